//! The GraphQL client facade.
//!
//! A [`Client`] binds a [`Transport`] to an ordered interceptor chain and an
//! optional [`DocumentSource`], and hands out [`RequestBuilder`]s:
//!
//! ```text
//! RequestBuilder -> interceptor 1 -> .. -> interceptor n -> Transport
//! ```

pub mod interceptor;
mod response;

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json_bytes::Value;
use tower::BoxError;

use crate::client::interceptor::Chain;
use crate::client::interceptor::Interceptor;
use crate::client::interceptor::SubscriptionChain;
use crate::client::interceptor::Terminal;
use crate::context::Context;
use crate::document::DocumentSource;
use crate::error::ResponseVerificationError;
use crate::error::TransportError;
use crate::graphql;
use crate::json_ext::Object;
use crate::transport::ResponseStream;
use crate::transport::Transport;
use crate::transport::websocket::CONNECTION_ACK_CONTEXT_KEY;
use crate::transport::websocket::CONNECTION_PARAMS_CONTEXT_KEY;

pub use crate::client::response::ClientResponse;
pub use crate::client::response::ResponseField;

/// The events of one client subscription. Ends when the server completes
/// the subscription; an item is `Err` when the server terminated it with
/// errors or the transport failed.
pub type SubscriptionStream = BoxStream<'static, Result<ClientResponse, BoxError>>;

/// A GraphQL request on its way through the client: the wire-level request
/// plus the per-request [`Context`].
#[derive(Clone, Debug)]
pub struct ClientRequest {
    pub request: graphql::Request,
    pub context: Context,
}

/// A GraphQL client over some [`Transport`].
///
/// Cheap to clone; clones share the transport, the interceptors and the
/// document source.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    document_source: Option<Arc<dyn DocumentSource>>,
    /// The one interceptor that takes part in the connection handshake,
    /// validated unique by [`ClientBuilder::build`].
    connection_lifecycle: Option<Arc<dyn Interceptor>>,
}

impl Client {
    pub fn builder(transport: impl Transport + 'static) -> ClientBuilder {
        ClientBuilder {
            transport: Arc::new(transport),
            interceptors: Vec::new(),
            document_source: None,
        }
    }

    /// A builder pre-populated with this client's configuration, for a
    /// variant client sharing the same transport.
    pub fn mutate(&self) -> ClientBuilder {
        ClientBuilder {
            transport: Arc::clone(&self.inner.transport),
            interceptors: self.inner.interceptors.clone(),
            document_source: self.inner.document_source.clone(),
        }
    }

    /// Start a request from a full GraphQL document.
    pub fn document(&self, document: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), DocumentRef::Inline(document.into()))
    }

    /// Start a request from the name of a document to resolve through the
    /// client's [`DocumentSource`].
    pub fn document_name(&self, name: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), DocumentRef::Named(name.into()))
    }

    pub(crate) async fn run(
        &self,
        request: ClientRequest,
    ) -> Result<graphql::Response, BoxError> {
        let context = request.context.clone();
        let terminal: Terminal<'_, graphql::Response> = Box::new(move |request: ClientRequest| {
            Box::pin(async move {
                self.store_connection_params(&request.context);
                self.inner.transport.execute(request).await
            })
        });
        let response = Chain::new(&self.inner.interceptors, terminal)
            .next(request)
            .await?;
        self.deliver_connection_ack(&context);
        Ok(response)
    }

    pub(crate) async fn run_subscription(
        &self,
        request: ClientRequest,
    ) -> Result<ResponseStream, BoxError> {
        let context = request.context.clone();
        let terminal: Terminal<'_, ResponseStream> = Box::new(move |request: ClientRequest| {
            Box::pin(async move {
                self.store_connection_params(&request.context);
                self.inner.transport.execute_subscription(request).await
            })
        });
        let events = SubscriptionChain::new(&self.inner.interceptors, terminal)
            .next(request)
            .await?;
        self.deliver_connection_ack(&context);
        Ok(events)
    }

    fn store_connection_params(&self, context: &Context) {
        if let Some(lifecycle) = &self.inner.connection_lifecycle
            && let Some(payload) = lifecycle.connection_init_payload()
        {
            context.insert_json_value(CONNECTION_PARAMS_CONTEXT_KEY, payload);
        }
    }

    fn deliver_connection_ack(&self, context: &Context) {
        if let Some(lifecycle) = &self.inner.connection_lifecycle
            && let Some(payload) = context.get_json_value(CONNECTION_ACK_CONTEXT_KEY)
        {
            lifecycle.handle_connection_ack(&payload);
        }
    }
}

/// Configures and builds a [`Client`].
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    document_source: Option<Arc<dyn DocumentSource>>,
}

impl ClientBuilder {
    /// Append an interceptor. Interceptors run in the order they were
    /// added.
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Resolve [`Client::document_name`] references through `source`.
    pub fn document_source(mut self, source: impl DocumentSource + 'static) -> Self {
        self.document_source = Some(Arc::new(source));
        self
    }

    /// # Panics
    ///
    /// When more than one interceptor provides a connection init payload.
    pub fn build(self) -> Client {
        let mut lifecycle: Vec<Arc<dyn Interceptor>> = self
            .interceptors
            .iter()
            .filter(|interceptor| interceptor.connection_init_payload().is_some())
            .cloned()
            .collect();
        if lifecycle.len() > 1 {
            panic!(
                "a client accepts at most one interceptor that provides a connection init payload, found {}",
                lifecycle.len(),
            );
        }

        Client {
            inner: Arc::new(ClientInner {
                transport: self.transport,
                interceptors: self.interceptors,
                document_source: self.document_source,
                connection_lifecycle: lifecycle.pop(),
            }),
        }
    }
}

enum DocumentRef {
    Inline(String),
    Named(String),
}

/// Collects a request, then executes it any number of times.
///
/// Every `execute*` call snapshots the current state into an independent
/// [`graphql::Request`], so a builder can be adjusted and re-executed.
pub struct RequestBuilder {
    client: Client,
    document: DocumentRef,
    operation_name: Option<String>,
    variables: Object,
    extensions: Object,
}

impl RequestBuilder {
    fn new(client: Client, document: DocumentRef) -> Self {
        RequestBuilder {
            client,
            document,
            operation_name: None,
            variables: Object::default(),
            extensions: Object::default(),
        }
    }

    /// Select the operation to execute when the document defines several.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Set a variable. Setting the same name again overwrites the previous
    /// value.
    pub fn variable(
        mut self,
        name: impl Into<serde_json_bytes::ByteString>,
        value: impl Into<Value>,
    ) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Set a request extension. Setting the same name again overwrites the
    /// previous value.
    pub fn extension(
        mut self,
        name: impl Into<serde_json_bytes::ByteString>,
        value: impl Into<Value>,
    ) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    /// Execute as a single request/response operation.
    pub async fn execute(&self) -> Result<ClientResponse, BoxError> {
        let request = ClientRequest {
            request: self.build_request().await?,
            context: Context::new(),
        };
        let response = self.client.run(request).await?;
        Ok(ClientResponse::new(response))
    }

    /// Execute and treat any response error as a failure, for operations
    /// expected to succeed outright.
    pub async fn execute_and_verify(&self) -> Result<ClientResponse, BoxError> {
        let response = self.execute().await?;
        if response.errors().is_empty() {
            Ok(response)
        } else {
            Err(ResponseVerificationError {
                errors: response.errors().to_vec(),
            }
            .into())
        }
    }

    /// Execute as a subscription.
    ///
    /// The stream ends when the server completes the subscription. A server
    /// terminating it with errors yields one final
    /// [`SubscriptionEndedError`](crate::error::SubscriptionEndedError)
    /// item. The subscription is never restarted from the inside; re-issue
    /// it to resubscribe.
    pub async fn execute_subscription(&self) -> Result<SubscriptionStream, BoxError> {
        let request = ClientRequest {
            request: self.build_request().await?,
            context: Context::new(),
        };
        let events = self.client.run_subscription(request).await?;
        Ok(events.map(|event| event.map(ClientResponse::new)).boxed())
    }

    async fn build_request(&self) -> Result<graphql::Request, BoxError> {
        let query = match &self.document {
            DocumentRef::Inline(document) => document.clone(),
            DocumentRef::Named(name) => match &self.client.inner.document_source {
                Some(source) => source.resolve(name).await?,
                None => {
                    return Err(TransportError::MalformedRequest {
                        reason: format!("no document source is configured to resolve '{name}'"),
                    }
                    .into());
                }
            },
        };
        if query.trim().is_empty() {
            return Err(TransportError::MalformedRequest {
                reason: "the request document is empty".to_string(),
            }
            .into());
        }

        Ok(graphql::Request::builder()
            .query(query)
            .and_operation_name(self.operation_name.clone())
            .variables(self.variables.clone())
            .extensions(self.extensions.clone())
            .build())
    }
}
