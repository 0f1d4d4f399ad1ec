//! GraphQL over HTTP.

use async_trait::async_trait;
use http::HeaderMap;
use http::header::ACCEPT;
use http::header::CONTENT_TYPE;
use tower::BoxError;
use url::Url;

use crate::client::ClientRequest;
use crate::error::TransportError;
use crate::graphql;
use crate::transport::ResponseStream;
use crate::transport::Transport;

/// [`Transport`] sending each request as an HTTP POST with a JSON body.
///
/// Subscriptions are not supported over plain HTTP; use
/// [`crate::transport::websocket::WebSocketTransport`] for those.
pub struct HttpTransport {
    endpoint: Url,
    client: reqwest::Client,
    headers: HeaderMap,
}

#[buildstructor::buildstructor]
impl HttpTransport {
    /// Returns a builder that builds an [`HttpTransport`].
    ///
    /// Builder methods:
    ///
    /// * `.endpoint(Url)`
    ///   Required.
    ///   The URL requests are posted to.
    ///
    /// * `.client(reqwest::Client)`
    ///   Optional.
    ///   A pre-configured HTTP client to send with, e.g. one with custom
    ///   timeouts or TLS settings. Defaults to `reqwest::Client::new()`.
    ///
    /// * `.headers(http::HeaderMap)`
    ///   Optional.
    ///   Headers added to every request.
    ///
    /// * `.build()`
    ///   Finishes the builder and returns an [`HttpTransport`].
    #[builder(visibility = "pub")]
    fn new(endpoint: Url, client: Option<reqwest::Client>, headers: Option<HeaderMap>) -> Self {
        HttpTransport {
            endpoint,
            client: client.unwrap_or_default(),
            headers: headers.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: ClientRequest) -> Result<graphql::Response, BoxError> {
        let body = serde_json::to_vec(&request.request).map_err(|err| {
            TransportError::MalformedRequest {
                reason: err.to_string(),
            }
        })?;

        tracing::trace!(endpoint = %self.endpoint, "posting GraphQL request");
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, mime::APPLICATION_JSON.essence_str())
            .header(ACCEPT, mime::APPLICATION_JSON.essence_str())
            .body(body)
            .send()
            .await
            .map_err(|err| TransportError::Http {
                status_code: err.status().map(|status| status.as_u16()),
                endpoint: self.endpoint.to_string(),
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http {
                status_code: Some(status.as_u16()),
                endpoint: self.endpoint.to_string(),
                reason: format!(
                    "{}: {}",
                    status.as_str(),
                    status.canonical_reason().unwrap_or("Unknown")
                ),
            }
            .into());
        }

        if let Some(content_type) = response.headers().get(CONTENT_TYPE)
            && !is_json(content_type.to_str().unwrap_or_default())
        {
            return Err(TransportError::MalformedResponse {
                endpoint: self.endpoint.to_string(),
                reason: format!("unexpected content type {content_type:?}"),
            }
            .into());
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::Http {
                status_code: Some(status.as_u16()),
                endpoint: self.endpoint.to_string(),
                reason: err.to_string(),
            })?;

        graphql::Response::from_bytes(body).map_err(|err| {
            TransportError::MalformedResponse {
                endpoint: self.endpoint.to_string(),
                reason: err.reason,
            }
            .into()
        })
    }

    async fn execute_subscription(
        &self,
        _request: ClientRequest,
    ) -> Result<ResponseStream, BoxError> {
        Err(TransportError::SubscriptionsUnsupported {
            transport: "http".to_string(),
        }
        .into())
    }
}

/// `application/json` and `application/*+json` count as JSON.
fn is_json(content_type: &str) -> bool {
    content_type.parse::<mime::Mime>().is_ok_and(|mime| {
        mime.type_() == mime::APPLICATION
            && (mime.subtype() == mime::JSON || mime.suffix() == Some(mime::JSON))
    })
}
