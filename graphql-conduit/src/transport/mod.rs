//! Transports that move GraphQL requests to a server and responses back.

pub mod http;
pub mod websocket;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tower::BoxError;

use crate::client::ClientRequest;
use crate::graphql;

/// A stream of responses, as produced by a subscription.
pub type ResponseStream = BoxStream<'static, Result<graphql::Response, BoxError>>;

/// A way of sending GraphQL requests to a server.
///
/// Shipped implementations are [`http::HttpTransport`] and
/// [`websocket::WebSocketTransport`]; [`crate::execution::ExecutionService`]
/// implements it over an in-process engine so the same client runs with no
/// network at all. Other protocols plug in by implementing this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute a single request and return its single response.
    ///
    /// An `Err` means the request never produced a GraphQL response; a
    /// response carrying GraphQL errors is still `Ok`.
    async fn execute(&self, request: ClientRequest) -> Result<graphql::Response, BoxError>;

    /// Start a subscription and return its stream of responses.
    ///
    /// The stream ends when the server completes the subscription. A server
    /// terminating with an explicit error yields
    /// [`crate::error::SubscriptionEndedError`] as the final item. Dropping
    /// the stream cancels the subscription.
    async fn execute_subscription(
        &self,
        request: ClientRequest,
    ) -> Result<ResponseStream, BoxError>;
}
