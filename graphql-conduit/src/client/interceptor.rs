//! Interception of client requests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json_bytes::Value;
use tower::BoxError;

use crate::client::ClientRequest;
use crate::graphql;
use crate::transport::ResponseStream;

/// The terminal step of a chain, usually the transport call.
pub(crate) type Terminal<'a, T> =
    Box<dyn FnOnce(ClientRequest) -> BoxFuture<'a, Result<T, BoxError>> + Send + 'a>;

/// Intercepts client requests on their way to the transport and responses on
/// their way back.
///
/// Interceptors run in registration order: the first one sees the request
/// first and the response last. An implementation calls [`Chain::next`]
/// (or [`SubscriptionChain::next`]) to continue; returning without calling it
/// short-circuits the chain, and returning `Err` aborts it. The error reaches
/// the caller as-is, it is never converted into a [`graphql::Response`].
///
/// [`connection_init_payload`](Interceptor::connection_init_payload) and
/// [`handle_connection_ack`](Interceptor::handle_connection_ack) tie an
/// interceptor into the handshake of transports that keep a persistent
/// connection. A client accepts at most one interceptor with a connection
/// init payload; [`ClientBuilder::build`](crate::client::ClientBuilder::build)
/// panics otherwise.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Intercept a single-response request. The default implementation
    /// forwards the request unchanged.
    async fn intercept(
        &self,
        request: ClientRequest,
        chain: Chain<'_>,
    ) -> Result<graphql::Response, BoxError> {
        chain.next(request).await
    }

    /// Intercept a subscription request. The default implementation forwards
    /// the request unchanged.
    async fn intercept_subscription(
        &self,
        request: ClientRequest,
        chain: SubscriptionChain<'_>,
    ) -> Result<ResponseStream, BoxError> {
        chain.next(request).await
    }

    /// The payload to send in the `connection_init` message when a transport
    /// establishes a persistent connection on behalf of this client.
    fn connection_init_payload(&self) -> Option<Value> {
        None
    }

    /// Called with the payload of the server's `connection_ack` message when
    /// a request ran over a persistent connection that carried one.
    fn handle_connection_ack(&self, _payload: &Value) {}
}

/// The not-yet-run tail of an interceptor chain, ending in the transport
/// call.
pub struct Chain<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    terminal: Terminal<'a, graphql::Response>,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        interceptors: &'a [Arc<dyn Interceptor>],
        terminal: Terminal<'a, graphql::Response>,
    ) -> Self {
        Chain {
            interceptors,
            terminal,
        }
    }

    /// Hand `request` to the next interceptor, or to the transport once
    /// every interceptor has run.
    pub async fn next(self, request: ClientRequest) -> Result<graphql::Response, BoxError> {
        match self.interceptors.split_first() {
            Some((interceptor, rest)) => {
                interceptor
                    .intercept(
                        request,
                        Chain {
                            interceptors: rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
            }
            None => (self.terminal)(request).await,
        }
    }
}

/// [`Chain`], for subscription requests.
pub struct SubscriptionChain<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    terminal: Terminal<'a, ResponseStream>,
}

impl<'a> SubscriptionChain<'a> {
    pub(crate) fn new(
        interceptors: &'a [Arc<dyn Interceptor>],
        terminal: Terminal<'a, ResponseStream>,
    ) -> Self {
        SubscriptionChain {
            interceptors,
            terminal,
        }
    }

    /// Hand `request` to the next interceptor, or to the transport once
    /// every interceptor has run.
    pub async fn next(self, request: ClientRequest) -> Result<ResponseStream, BoxError> {
        match self.interceptors.split_first() {
            Some((interceptor, rest)) => {
                interceptor
                    .intercept_subscription(
                        request,
                        SubscriptionChain {
                            interceptors: rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
            }
            None => (self.terminal)(request).await,
        }
    }
}
