//! Client errors.
use displaydoc::Display;
use serde::Serialize;
use serde_json_bytes::Value;
use thiserror::Error;

use crate::graphql;
use crate::graphql::ErrorExtension;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::PathParseError;

/// Error types raised below the GraphQL layer, while moving a request to a
/// server or a response payload back.
///
/// Note that these are never GraphQL errors; a caller who wants to surface
/// one inside a GraphQL response converts it with
/// [`TransportError::to_graphql_error`].
#[derive(Error, Display, Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(untagged)]
#[ignore_extra_doc_attributes]
#[non_exhaustive]
pub enum TransportError {
    /// request was malformed: {reason}
    MalformedRequest {
        /// The reason the serialization failed.
        reason: String,
    },

    /// response from '{endpoint}' was malformed: {reason}
    MalformedResponse {
        /// The endpoint that responded with the malformed payload.
        endpoint: String,

        /// The reason the payload could not be decoded.
        reason: String,
    },

    /// HTTP fetch failed from '{endpoint}': {reason}
    ///
    /// note that this relates to a transport error and not a GraphQL error
    Http {
        status_code: Option<u16>,

        /// The endpoint that failed.
        endpoint: String,

        /// The reason the fetch failed.
        reason: String,
    },

    /// WebSocket fetch failed from '{endpoint}': {reason}
    ///
    /// note that this relates to a transport error and not a GraphQL error
    WebSocket {
        /// The endpoint that failed.
        endpoint: String,

        /// The reason the fetch failed.
        reason: String,
    },

    /// subscriptions are not supported by the '{transport}' transport
    SubscriptionsUnsupported {
        /// The transport the subscription was attempted over.
        transport: String,
    },
}

impl TransportError {
    /// Convert the transport error to a GraphQL error.
    pub fn to_graphql_error(&self, path: Option<Path>) -> graphql::Error {
        let mut extensions = match serde_json_bytes::to_value(self) {
            Ok(Value::Object(object)) => object,
            _ => Object::default(),
        };
        extensions
            .entry("code")
            .or_insert_with(|| self.extension_code().into());
        if let TransportError::Http { status_code, .. } = self {
            extensions.remove("status_code");
            if let Some(status_code) = status_code {
                extensions.insert("http", serde_json_bytes::json!({ "status": status_code }));
            }
        }

        graphql::Error::builder()
            .message(self.to_string())
            .and_path(path)
            .extensions(extensions)
            .build()
    }
}

impl ErrorExtension for TransportError {
    fn extension_code(&self) -> String {
        match self {
            TransportError::MalformedRequest { .. } => "MALFORMED_REQUEST",
            TransportError::MalformedResponse { .. } => "MALFORMED_RESPONSE",
            TransportError::Http { .. } => "HTTP_FETCH_ERROR",
            TransportError::WebSocket { .. } => "WEBSOCKET_FETCH_ERROR",
            TransportError::SubscriptionsUnsupported { .. } => "SUBSCRIPTIONS_UNSUPPORTED",
        }
        .to_string()
    }
}

/// The server terminated a subscription with an `error` event.
///
/// Yielded as the final item of a subscription stream; distinct from a clean
/// `complete` (the stream just ends) and from losing the connection (which
/// surfaces as a [`TransportError`]).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("subscription ended by the server: {}", format_error_messages(.errors))]
pub struct SubscriptionEndedError {
    /// The errors carried by the terminal event.
    pub errors: Vec<graphql::Error>,
}

/// A response expected to be error-free carried errors.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("response contains errors: {}", format_error_messages(.errors))]
pub struct ResponseVerificationError {
    /// The errors found in the response.
    pub errors: Vec<graphql::Error>,
}

fn format_error_messages(errors: &[graphql::Error]) -> String {
    errors
        .iter()
        .map(|error| format!("'{error}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error types raised when reading one field of a response as a typed value.
#[derive(Error, Display, Debug, Clone, PartialEq)]
#[ignore_extra_doc_attributes]
#[non_exhaustive]
pub enum FieldAccessError {
    /// field at '{path}' is unresolved: {error}
    ///
    /// the server reported an error for this field instead of producing a value
    Unresolved {
        /// The complete response the field was read from.
        response: graphql::Response,

        /// The path of the offending field.
        path: Path,

        /// The error the server associated with the field.
        error: graphql::Error,
    },

    /// field at '{path}' could not be decoded: {reason}
    Decode {
        /// The complete response the field was read from.
        response: graphql::Response,

        /// The path of the offending field.
        path: Path,

        /// The reason decoding failed.
        reason: String,
    },

    /// invalid field path: {0}
    InvalidPath(#[from] PathParseError),
}
