//! GraphQL over WebSocket.
//!
//! Implements the client side of both GraphQL-over-WebSocket protocols and a
//! [`Transport`] that multiplexes any number of concurrent subscriptions
//! over one lazily-established connection.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use futures::Sink;
use futures::SinkExt;
use futures::Stream;
use futures::StreamExt;
use futures::future;
use http::HeaderValue;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::connect_async_tls_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tower::BoxError;
use url::Url;

use crate::client::ClientRequest;
use crate::error::SubscriptionEndedError;
use crate::error::TransportError;
use crate::graphql;
use crate::transport::ResponseStream;
use crate::transport::Transport;

/// Context key under which the client stores the connection-init payload
/// produced by a connection-lifecycle interceptor.
pub const CONNECTION_PARAMS_CONTEXT_KEY: &str = "conduit::websocket::connection_params";

/// Context key under which the transport stores the payload carried by the
/// server's `connection_ack` message.
pub const CONNECTION_ACK_CONTEXT_KEY: &str = "conduit::websocket::connection_ack";

const CONNECTION_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Events a subscription can buffer before it backpressures the connection.
const SUBSCRIPTION_EVENT_BUFFER: usize = 100;

/// The WebSocket subprotocol name for the modern graphql-ws protocol.
/// See [`WebSocketProtocol::GraphqlWs`].
const GRAPHQL_WS_SUBPROTOCOL: &str = "graphql-transport-ws";
/// The WebSocket subprotocol name for the legacy subscriptions-transport-ws protocol.
/// See [`WebSocketProtocol::SubscriptionsTransportWs`].
const SUBSCRIPTIONS_TRANSPORT_WS_SUBPROTOCOL: &str = "graphql-ws";

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, Copy)]
#[serde(rename_all = "snake_case")]
pub enum WebSocketProtocol {
    /// The modern graphql-ws protocol. The subprotocol name is "graphql-transport-ws".
    ///
    /// Spec URL: https://github.com/enisdenjo/graphql-ws/blob/0c0eb499c3a0278c6d9cc799064f22c5d24d2f60/PROTOCOL.md
    #[default]
    GraphqlWs,
    /// The legacy subscriptions-transport-ws protocol. Confusingly, the subprotocol name is
    /// "graphql-ws".
    ///
    /// https://github.com/apollographql/subscriptions-transport-ws/blob/36f3f6f780acc1a458b768db13fd39c65e5e6518/PROTOCOL.md
    SubscriptionsTransportWs,
}

impl From<WebSocketProtocol> for HeaderValue {
    fn from(value: WebSocketProtocol) -> Self {
        match value {
            WebSocketProtocol::GraphqlWs => HeaderValue::from_static(GRAPHQL_WS_SUBPROTOCOL),
            WebSocketProtocol::SubscriptionsTransportWs => {
                HeaderValue::from_static(SUBSCRIPTIONS_TRANSPORT_WS_SUBPROTOCOL)
            }
        }
    }
}

impl WebSocketProtocol {
    /// Returns a subscription start message appropriate for the active protocol.
    fn subscribe(&self, id: String, payload: graphql::Request) -> ClientMessage {
        match self {
            WebSocketProtocol::GraphqlWs => ClientMessage::Subscribe { id, payload },
            WebSocketProtocol::SubscriptionsTransportWs => ClientMessage::OldStart { id, payload },
        }
    }

    /// Returns a subscription completion message appropriate for the active protocol.
    fn complete(&self, id: String) -> ClientMessage {
        match self {
            WebSocketProtocol::GraphqlWs => ClientMessage::Complete { id },
            WebSocketProtocol::SubscriptionsTransportWs => ClientMessage::OldStop { id },
        }
    }
}

/// WebSocket messages sent from the client.
///
/// Branches prefixed with "Old" are specific to the subscriptions-transport-ws protocol, other
/// branches are either part of the graphql-ws protocol or shared by both protocols.
#[derive(Deserialize, Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ClientMessage {
    /// A new connection
    ConnectionInit {
        /// Optional init payload from the client
        payload: Option<Value>,
    },
    /// The start of a Websocket subscription in the graphql-ws protocol
    Subscribe {
        /// Message ID
        id: String,
        /// The GraphQL Request
        payload: graphql::Request,
    },
    /// The start of a Websocket subscription in the subscriptions-transport-ws protocol
    #[serde(rename = "start")]
    OldStart {
        /// Message ID
        id: String,
        /// The GraphQL Request
        payload: graphql::Request,
    },
    /// The end of a Websocket subscription in the graphql-ws protocol
    Complete {
        /// Message ID
        id: String,
    },
    /// The end of a Websocket subscription in the subscriptions-transport-ws protocol
    #[serde(rename = "stop")]
    OldStop {
        /// Message ID
        id: String,
    },
    /// Connection terminated by the client, only used in the subscriptions-transport-ws protocol.
    #[serde(rename = "connection_terminate")]
    OldConnectionTerminate,
    /// Close the websocket connection. This is an internal message, not part of either protocol.
    CloseWebsocket,
    /// Useful for detecting failed connections, displaying latency metrics or
    /// other types of network probing.
    ///
    /// Reference: <https://github.com/enisdenjo/graphql-ws/blob/0c0eb499c3a0278c6d9cc799064f22c5d24d2f60/PROTOCOL.md#ping>
    Ping {
        /// Additional details about the ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// The response to the Ping message.
    ///
    /// Reference: <https://github.com/enisdenjo/graphql-ws/blob/0c0eb499c3a0278c6d9cc799064f22c5d24d2f60/PROTOCOL.md#pong>
    Pong {
        /// Additional details about the pong.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

/// WebSocket messages received from the server.
#[derive(Deserialize, Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ServerMessage {
    ConnectionAck {
        /// Optional ack payload from the server, e.g. negotiated session data.
        payload: Option<Value>,
    },
    /// The payload message has type "next" in the graphql-ws protocol, and type "data" in the
    /// subscriptions-transport-ws protocol.
    #[serde(alias = "data")]
    Next {
        id: String,
        payload: graphql::Response,
    },
    #[serde(alias = "connection_error")]
    Error {
        id: Option<String>,
        payload: ServerError,
    },
    Complete {
        id: String,
    },
    #[serde(alias = "ka")]
    KeepAlive,
    /// The response to the Ping message.
    ///
    /// Reference: <https://github.com/enisdenjo/graphql-ws/blob/0c0eb499c3a0278c6d9cc799064f22c5d24d2f60/PROTOCOL.md#pong>
    Pong {
        payload: Option<Value>,
    },
    Ping {
        payload: Option<Value>,
    },
    /// The websocket connection itself went away. Synthesized from close
    /// frames and read failures, not part of either protocol.
    #[serde(skip)]
    Closed {
        error: Option<graphql::Error>,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(untagged)]
pub(crate) enum ServerError {
    Error(graphql::Error),
    Errors(Vec<graphql::Error>),
}

impl From<ServerError> for Vec<graphql::Error> {
    fn from(value: ServerError) -> Self {
        match value {
            ServerError::Error(e) => vec![e],
            ServerError::Errors(e) => e,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error("websocket error")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("deserialization/serialization error")]
    SerdeError(#[from] serde_json::Error),
}

/// Convert a bidirectional stream of untyped websocket packets to a [Stream] + [Sink] that speaks the
/// GraphQL WebSocket protocol ([`ServerMessage`] and [`ClientMessage`]).
pub(crate) fn convert_websocket_stream<T>(
    stream: WebSocketStream<T>,
) -> impl Stream<Item = serde_json::Result<ServerMessage>> + Sink<ClientMessage, Error = Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    stream
        // Serialize messages being written into the `Sink`
        .with(|client_message: ClientMessage| match client_message {
            ClientMessage::CloseWebsocket => future::ready(Ok(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Default::default(),
            })))),
            message => future::ready(match serde_json::to_string(&message) {
                Ok(client_message_str) => Ok(Message::text(client_message_str)),
                Err(err) => Err(Error::SerdeError(err)),
            }),
        })
        // Parse messages received from the `Stream`
        .map(|msg| match msg {
            Ok(Message::Text(text)) => serde_json::from_str(&text),
            Ok(Message::Binary(bin)) => serde_json::from_slice(&bin),
            Ok(Message::Ping(payload)) => Ok(ServerMessage::Ping {
                payload: serde_json::from_slice(&payload).ok(),
            }),
            Ok(Message::Pong(payload)) => Ok(ServerMessage::Pong {
                payload: serde_json::from_slice(&payload).ok(),
            }),
            Ok(Message::Close(None)) => Ok(ServerMessage::Closed { error: None }),
            Ok(Message::Close(Some(CloseFrame { code, reason }))) => {
                if code == CloseCode::Normal {
                    Ok(ServerMessage::Closed { error: None })
                } else {
                    Ok(ServerMessage::Closed {
                        error: Some(
                            graphql::Error::builder()
                                .message(format!("websocket connection has been closed with error code '{code}' and reason '{reason}'"))
                                .extension_code("WEBSOCKET_CLOSE_ERROR")
                                .build(),
                        ),
                    })
                }
            }
            Ok(Message::Frame(frame)) => serde_json::from_slice(frame.payload()),
            Err(err) => {
                tracing::trace!("cannot consume more message on websocket stream: {err:?}");

                Ok(ServerMessage::Closed {
                    error: Some(
                        graphql::Error::builder()
                            .message("cannot read message from websocket")
                            .extension_code("WEBSOCKET_MESSAGE_ERROR")
                            .build(),
                    ),
                })
            }
        })
}

enum ConnectionCommand {
    Subscribe {
        id: String,
        request: graphql::Request,
        events: mpsc::Sender<Result<graphql::Response, BoxError>>,
    },
    Complete {
        id: String,
    },
}

/// Handle to a live GraphQL websocket connection.
///
/// The connection itself is owned by a spawned task; the handle registers
/// subscriptions with it. Dropping the last handle shuts the connection
/// down.
pub(crate) struct GraphqlWebSocket {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    ack_payload: Option<Value>,
}

impl GraphqlWebSocket {
    /// Perform the connection-init handshake over `stream` and spawn the
    /// task that owns the connection afterwards.
    pub(crate) async fn connect<S>(
        mut stream: S,
        endpoint: String,
        protocol: WebSocketProtocol,
        connection_params: Option<Value>,
        ack_timeout: Duration,
        heartbeat_interval: Option<Duration>,
    ) -> Result<Self, graphql::Error>
    where
        S: Stream<Item = serde_json::Result<ServerMessage>>
            + Sink<ClientMessage>
            + std::marker::Unpin
            + std::marker::Send
            + 'static,
    {
        stream
            .send(ClientMessage::ConnectionInit {
                payload: connection_params,
            })
            .await
            .map_err(|_err| {
                graphql::Error::builder()
                    .message("cannot send connection init through websocket connection")
                    .extension_code("WEBSOCKET_INIT_ERROR")
                    .build()
            })?;

        let first_non_ping_payload = async {
            loop {
                match stream.next().await {
                    Some(Ok(ServerMessage::Ping { .. })) => {
                        // There's no need to send a pong here because the server will send a pong automatically.
                        // See https://docs.rs/tungstenite/latest/tungstenite/protocol/struct.WebSocket.html#method.write
                    }
                    other => {
                        return other;
                    }
                }
            }
        };

        let resp = tokio::time::timeout(ack_timeout, first_non_ping_payload)
            .await
            .map_err(|_| {
                graphql::Error::builder()
                    .message("cannot receive connection ack from websocket connection")
                    .extension_code("WEBSOCKET_ACK_ERROR_TIMEOUT")
                    .build()
            })?;
        let ack_payload = match resp {
            Some(Ok(ServerMessage::ConnectionAck { payload })) => payload,
            resp => {
                return Err(graphql::Error::builder()
                    .message(format!("didn't receive the connection ack from websocket connection but instead got: {resp:?}"))
                    .extension_code("WEBSOCKET_ACK_ERROR")
                    .build());
            }
        };

        let (commands, command_receiver) = mpsc::unbounded_channel();
        tokio::task::spawn(connection_task(
            stream,
            command_receiver,
            endpoint,
            protocol,
            heartbeat_interval,
        ));

        Ok(Self {
            commands,
            ack_payload,
        })
    }

    /// Whether the connection task has terminated. A closed connection
    /// cannot accept subscriptions and should be replaced.
    pub(crate) fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// The payload the server attached to its `connection_ack`, if any.
    pub(crate) fn ack_payload(&self) -> Option<&Value> {
        self.ack_payload.as_ref()
    }

    /// Register a subscription under `id` and return its event stream.
    pub(crate) fn subscribe(
        &self,
        id: String,
        request: graphql::Request,
    ) -> Result<SubscriptionStream, graphql::Error> {
        let (events, receiver) = mpsc::channel(SUBSCRIPTION_EVENT_BUFFER);
        self.commands
            .send(ConnectionCommand::Subscribe {
                id: id.clone(),
                request,
                events,
            })
            .map_err(|_err| {
                graphql::Error::builder()
                    .message("cannot subscribe on a closed websocket connection")
                    .extension_code("WEBSOCKET_CONNECTION_ERROR")
                    .build()
            })?;

        Ok(SubscriptionStream {
            events: ReceiverStream::new(receiver),
            id: Some(id),
            commands: self.commands.clone(),
        })
    }
}

/// Awaits the next heartbeat tick, or forever when heartbeats are disabled.
async fn maybe_tick(heartbeat: Option<&mut IntervalStream>) -> Option<tokio::time::Instant> {
    match heartbeat {
        Some(heartbeat) => heartbeat.next().await,
        None => future::pending().await,
    }
}

/// Owns one websocket connection: sends subscribe/complete messages on
/// behalf of the [`GraphqlWebSocket`] handle and routes server messages to
/// the per-subscription channels.
async fn connection_task<S>(
    mut stream: S,
    mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    endpoint: String,
    protocol: WebSocketProtocol,
    heartbeat_interval: Option<Duration>,
) where
    S: Stream<Item = serde_json::Result<ServerMessage>>
        + Sink<ClientMessage>
        + std::marker::Unpin
        + std::marker::Send
        + 'static,
{
    let mut subscriptions: HashMap<String, mpsc::Sender<Result<graphql::Response, BoxError>>> =
        HashMap::new();

    let mut heartbeat = match (protocol, heartbeat_interval) {
        (WebSocketProtocol::GraphqlWs, Some(duration)) => {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + duration, duration);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            Some(IntervalStream::new(interval))
        }
        _ => None,
    };

    let error = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ConnectionCommand::Subscribe { id, request, events }) => {
                    if stream.send(protocol.subscribe(id.clone(), request)).await.is_err() {
                        let _ = events
                            .send(Err(TransportError::WebSocket {
                                endpoint: endpoint.clone(),
                                reason: "cannot send the subscribe message".to_string(),
                            }
                            .into()))
                            .await;
                        continue;
                    }
                    subscriptions.insert(id, events);
                }
                Some(ConnectionCommand::Complete { id }) => {
                    if subscriptions.remove(&id).is_some()
                        && stream.send(protocol.complete(id)).await.is_err()
                    {
                        tracing::trace!("cannot send the complete message, closing the connection");
                        break Some(TransportError::WebSocket {
                            endpoint: endpoint.clone(),
                            reason: "cannot send the complete message".to_string(),
                        });
                    }
                }
                // Every handle is gone, shut the connection down.
                None => break None,
            },
            message = stream.next() => match message {
                Some(Ok(message)) => match message {
                    ServerMessage::Next { id, payload } => {
                        if let Some(events) = subscriptions.get(&id) {
                            // A send failure means the consumer dropped its
                            // stream; its Drop sends the Complete command
                            // which cleans up the registration.
                            let _ = events.send(Ok(payload)).await;
                        }
                    }
                    ServerMessage::Error { id: Some(id), payload } => {
                        if let Some(events) = subscriptions.remove(&id) {
                            let _ = events
                                .send(Err(SubscriptionEndedError {
                                    errors: payload.into(),
                                }
                                .into()))
                                .await;
                        }
                    }
                    ServerMessage::Error { id: None, payload } => {
                        let errors: Vec<graphql::Error> = payload.into();
                        let reason = errors
                            .iter()
                            .map(|error| error.message.clone())
                            .collect::<Vec<_>>()
                            .join(", ");
                        break Some(TransportError::WebSocket {
                            endpoint: endpoint.clone(),
                            reason,
                        });
                    }
                    ServerMessage::Complete { id } => {
                        // Dropping the sender ends the subscription's stream.
                        subscriptions.remove(&id);
                    }
                    ServerMessage::Ping { .. } => {
                        let _ = stream.send(ClientMessage::Pong { payload: None }).await;
                    }
                    ServerMessage::ConnectionAck { .. }
                    | ServerMessage::KeepAlive
                    | ServerMessage::Pong { .. } => {}
                    ServerMessage::Closed { error } => {
                        break error.map(|error| TransportError::WebSocket {
                            endpoint: endpoint.clone(),
                            reason: error.message,
                        });
                    }
                },
                Some(Err(err)) => {
                    break Some(TransportError::WebSocket {
                        endpoint: endpoint.clone(),
                        reason: format!("cannot deserialize websocket server message: {err:?}"),
                    });
                }
                None => {
                    break Some(TransportError::WebSocket {
                        endpoint: endpoint.clone(),
                        reason: "websocket connection has been closed".to_string(),
                    });
                }
            },
            Some(_) = maybe_tick(heartbeat.as_mut()) => {
                if stream.send(ClientMessage::Ping { payload: None }).await.is_err() {
                    tracing::trace!("cannot send heartbeat");
                }
            }
        }
    };

    // Fail the subscriptions that are still registered, then tear the
    // protocol down. The teardown messages are best-effort: the connection
    // may already be gone.
    if let Some(error) = error {
        tracing::debug!(%endpoint, "websocket connection failed: {error}");
        for events in subscriptions.values() {
            let _ = events.send(Err(Box::new(error.clone()) as BoxError)).await;
        }
    }
    subscriptions.clear();

    if protocol == WebSocketProtocol::SubscriptionsTransportWs {
        let _ = stream.send(ClientMessage::OldConnectionTerminate).await;
    }
    let _ = stream.send(ClientMessage::CloseWebsocket).await;
    let _ = stream.close().await;
}

/// The events of one subscription, multiplexed off a shared connection.
///
/// Dropping the stream completes the subscription on the server without
/// touching the connection or its other subscriptions.
pub(crate) struct SubscriptionStream {
    events: ReceiverStream<Result<graphql::Response, BoxError>>,
    id: Option<String>,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl Stream for SubscriptionStream {
    type Item = Result<graphql::Response, BoxError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        if let Some(id) = self.id.take()
            && self
                .commands
                .send(ConnectionCommand::Complete { id })
                .is_err()
        {
            tracing::trace!("websocket connection is already closed");
        }
    }
}

/// WebSocket transport settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct WebSocketConfiguration {
    /// Which subprotocol to speak.
    pub protocol: WebSocketProtocol,
    /// How long to wait for the server's `connection_ack` before failing
    /// the connection attempt.
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Interval between client-initiated pings. No pings are sent when
    /// absent. Only used with the graphql-ws protocol.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Option<Duration>,
}

impl Default for WebSocketConfiguration {
    fn default() -> Self {
        WebSocketConfiguration {
            protocol: WebSocketProtocol::default(),
            ack_timeout: CONNECTION_ACK_TIMEOUT,
            heartbeat_interval: None,
        }
    }
}

/// [`Transport`] multiplexing requests over one GraphQL websocket
/// connection.
///
/// The connection is established lazily on the first call and then cached;
/// concurrent subscriptions share it, each under its own id. When the
/// connection is lost every in-flight subscription receives the failure and
/// the next call reconnects. Nothing is re-subscribed automatically.
pub struct WebSocketTransport {
    endpoint: Url,
    configuration: WebSocketConfiguration,
    connection: tokio::sync::Mutex<Option<GraphqlWebSocket>>,
}

#[buildstructor::buildstructor]
impl WebSocketTransport {
    /// Returns a builder that builds a [`WebSocketTransport`].
    ///
    /// Builder methods:
    ///
    /// * `.endpoint(Url)`
    ///   Required.
    ///   The `ws://` or `wss://` URL to connect to.
    ///
    /// * `.configuration(WebSocketConfiguration)`
    ///   Optional.
    ///   Protocol selection, ack timeout and heartbeat settings.
    ///
    /// * `.build()`
    ///   Finishes the builder and returns a [`WebSocketTransport`].
    #[builder(visibility = "pub")]
    fn new(endpoint: Url, configuration: Option<WebSocketConfiguration>) -> Self {
        WebSocketTransport {
            endpoint,
            configuration: configuration.unwrap_or_default(),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    async fn connect(
        &self,
        connection_params: Option<Value>,
    ) -> Result<GraphqlWebSocket, BoxError> {
        let mut request = self.endpoint.as_str().into_client_request().map_err(|err| {
            TransportError::WebSocket {
                endpoint: self.endpoint.to_string(),
                reason: format!("cannot create websocket client request: {err}"),
            }
        })?;
        request.headers_mut().insert(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            self.configuration.protocol.into(),
        );

        let (ws_stream, _resp) = match self.endpoint.scheme() {
            "wss" => connect_async_tls_with_config(request, None, false, None).await,
            _ => connect_async(request).await,
        }
        .map_err(|err| TransportError::WebSocket {
            endpoint: self.endpoint.to_string(),
            reason: format!("cannot connect websocket: {err}"),
        })?;

        GraphqlWebSocket::connect(
            convert_websocket_stream(ws_stream),
            self.endpoint.to_string(),
            self.configuration.protocol,
            connection_params,
            self.configuration.ack_timeout,
            self.configuration.heartbeat_interval,
        )
        .await
        .map_err(|err| {
            TransportError::WebSocket {
                endpoint: self.endpoint.to_string(),
                reason: err.to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn execute(&self, request: ClientRequest) -> Result<graphql::Response, BoxError> {
        let mut responses = self.execute_subscription(request).await?;
        match responses.next().await {
            Some(response) => response,
            None => Err(TransportError::WebSocket {
                endpoint: self.endpoint.to_string(),
                reason: "subscription ended without a response".to_string(),
            }
            .into()),
        }
    }

    async fn execute_subscription(
        &self,
        request: ClientRequest,
    ) -> Result<ResponseStream, BoxError> {
        let connection_params = request.context.get_json_value(CONNECTION_PARAMS_CONTEXT_KEY);

        let mut slot = self.connection.lock().await;
        let socket = match &mut *slot {
            Some(socket) if !socket.is_closed() => socket,
            slot => {
                tracing::debug!(endpoint = %self.endpoint, "establishing websocket connection");
                slot.insert(self.connect(connection_params).await?)
            }
        };

        if let Some(ack_payload) = socket.ack_payload() {
            request
                .context
                .insert_json_value(CONNECTION_ACK_CONTEXT_KEY, ack_payload.clone());
        }

        let id = uuid::Uuid::new_v4().to_string();
        let events = socket.subscribe(id, request.request).map_err(|err| {
            TransportError::WebSocket {
                endpoint: self.endpoint.to_string(),
                reason: err.to_string(),
            }
        })?;
        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use axum::Router;
    use axum::extract::ws::Message as WsMessage;
    use axum::extract::ws::WebSocket;
    use axum::extract::ws::WebSocketUpgrade;
    use axum::response::Response;
    use axum::routing::get;
    use futures::Future;
    use parking_lot::Mutex;
    use serde_json::json;
    use serde_json_bytes::json as bjson;
    use test_log::test;

    use super::*;
    use crate::context::Context;

    async fn spawn_ws_server<F, Fut>(handler: F) -> Url
    where
        F: Fn(WebSocket) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let app = Router::new().route(
            "/ws",
            get(move |ws: WebSocketUpgrade| {
                let handler = handler.clone();
                async move {
                    let response: Response = ws
                        .protocols([GRAPHQL_WS_SUBPROTOCOL, SUBSCRIPTIONS_TRANSPORT_WS_SUBPROTOCOL])
                        .on_upgrade(move |socket| handler(socket));
                    response
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::task::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{addr}/ws").parse().unwrap()
    }

    async fn recv_json(socket: &mut WebSocket) -> serde_json::Value {
        loop {
            match socket.recv().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return serde_json::from_str(text.as_str()).unwrap();
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                other => panic!("fake server expected a text frame but got: {other:?}"),
            }
        }
    }

    async fn send_json(socket: &mut WebSocket, value: serde_json::Value) {
        socket
            .send(WsMessage::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn ack_handshake(socket: &mut WebSocket) {
        let init = recv_json(socket).await;
        assert_eq!(init["type"], "connection_init");
        send_json(socket, json!({ "type": "connection_ack" })).await;
    }

    fn subscription_request(query: &str) -> ClientRequest {
        ClientRequest {
            request: graphql::Request::builder().query(query).build(),
            context: Context::new(),
        }
    }

    #[test(tokio::test)]
    async fn test_subscription_happy_path() {
        let endpoint = spawn_ws_server(|mut socket| async move {
            ack_handshake(&mut socket).await;
            let subscribe = recv_json(&mut socket).await;
            assert_eq!(subscribe["type"], "subscribe");
            assert_eq!(subscribe["payload"]["query"], "subscription { userWasCreated { name } }");
            let id = subscribe["id"].as_str().unwrap().to_string();

            for name in ["Ada", "Grace"] {
                send_json(
                    &mut socket,
                    json!({
                        "type": "next",
                        "id": id,
                        "payload": { "data": { "userWasCreated": { "name": name } } },
                    }),
                )
                .await;
            }
            send_json(&mut socket, json!({ "type": "complete", "id": id })).await;
            // Drain the rest so the client can close cleanly.
            while socket.recv().await.is_some() {}
        })
        .await;

        let transport = WebSocketTransport::builder().endpoint(endpoint).build();
        let mut responses = transport
            .execute_subscription(subscription_request(
                "subscription { userWasCreated { name } }",
            ))
            .await
            .unwrap();

        let first = responses.next().await.unwrap().unwrap();
        assert_eq!(
            first.data,
            Some(bjson!({ "userWasCreated": { "name": "Ada" } }))
        );
        let second = responses.next().await.unwrap().unwrap();
        assert_eq!(
            second.data,
            Some(bjson!({ "userWasCreated": { "name": "Grace" } }))
        );
        assert!(responses.next().await.is_none());
    }

    #[test(tokio::test)]
    async fn test_subscriptions_share_one_connection() {
        let connections = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(Mutex::new(Vec::<String>::new()));

        let endpoint = {
            let connections = Arc::clone(&connections);
            let completed = Arc::clone(&completed);
            spawn_ws_server(move |mut socket| {
                let connections = Arc::clone(&connections);
                let completed = Arc::clone(&completed);
                async move {
                    connections.fetch_add(1, Ordering::SeqCst);
                    ack_handshake(&mut socket).await;

                    let first = recv_json(&mut socket).await;
                    let first_id = first["id"].as_str().unwrap().to_string();
                    send_json(
                        &mut socket,
                        json!({ "type": "next", "id": first_id, "payload": { "data": { "n": 1 } } }),
                    )
                    .await;

                    let second = recv_json(&mut socket).await;
                    let second_id = second["id"].as_str().unwrap().to_string();
                    assert_ne!(first_id, second_id);
                    send_json(
                        &mut socket,
                        json!({ "type": "next", "id": second_id, "payload": { "data": { "n": 10 } } }),
                    )
                    .await;
                    send_json(
                        &mut socket,
                        json!({ "type": "next", "id": first_id, "payload": { "data": { "n": 2 } } }),
                    )
                    .await;

                    // The client dropped the first stream: only that id
                    // completes, the connection stays up.
                    let complete = recv_json(&mut socket).await;
                    assert_eq!(complete["type"], "complete");
                    assert_eq!(complete["id"].as_str().unwrap(), first_id);
                    completed.lock().push(first_id);

                    send_json(
                        &mut socket,
                        json!({ "type": "next", "id": second_id, "payload": { "data": { "n": 20 } } }),
                    )
                    .await;
                    send_json(&mut socket, json!({ "type": "complete", "id": second_id })).await;
                    while socket.recv().await.is_some() {}
                }
            })
            .await
        };

        let transport = WebSocketTransport::builder().endpoint(endpoint).build();
        let mut first = transport
            .execute_subscription(subscription_request("subscription { a }"))
            .await
            .unwrap();
        let event = first.next().await.unwrap().unwrap();
        assert_eq!(event.data, Some(bjson!({ "n": 1 })));

        let mut second = transport
            .execute_subscription(subscription_request("subscription { b }"))
            .await
            .unwrap();
        let event = second.next().await.unwrap().unwrap();
        assert_eq!(event.data, Some(bjson!({ "n": 10 })));
        let event = first.next().await.unwrap().unwrap();
        assert_eq!(event.data, Some(bjson!({ "n": 2 })));

        drop(first);

        let event = second.next().await.unwrap().unwrap();
        assert_eq!(event.data, Some(bjson!({ "n": 20 })));
        assert!(second.next().await.is_none());

        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert_eq!(completed.lock().len(), 1);
    }

    #[test(tokio::test)]
    async fn test_connection_ack_timeout() {
        let endpoint = spawn_ws_server(|mut socket| async move {
            let init = recv_json(&mut socket).await;
            assert_eq!(init["type"], "connection_init");
            // Never ack.
            while socket.recv().await.is_some() {}
        })
        .await;

        let transport = WebSocketTransport::builder()
            .endpoint(endpoint)
            .configuration(WebSocketConfiguration {
                ack_timeout: Duration::from_millis(100),
                ..Default::default()
            })
            .build();
        // `.err().unwrap()` because the `Ok` stream is not `Debug`.
        let err = transport
            .execute_subscription(subscription_request("subscription { a }"))
            .await
            .err()
            .unwrap();
        match err.downcast_ref::<TransportError>() {
            Some(TransportError::WebSocket { reason, .. }) => {
                assert!(reason.contains("connection ack"), "unexpected reason: {reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test(tokio::test)]
    async fn test_server_error_termination() {
        let endpoint = spawn_ws_server(|mut socket| async move {
            ack_handshake(&mut socket).await;
            let subscribe = recv_json(&mut socket).await;
            let id = subscribe["id"].as_str().unwrap().to_string();
            send_json(
                &mut socket,
                json!({
                    "type": "error",
                    "id": id,
                    "payload": [{ "message": "quota exceeded" }],
                }),
            )
            .await;
            while socket.recv().await.is_some() {}
        })
        .await;

        let transport = WebSocketTransport::builder().endpoint(endpoint).build();
        let mut responses = transport
            .execute_subscription(subscription_request("subscription { a }"))
            .await
            .unwrap();

        let err = responses.next().await.unwrap().unwrap_err();
        let ended = err.downcast_ref::<SubscriptionEndedError>().unwrap();
        assert_eq!(ended.errors[0].message, "quota exceeded");
        assert!(responses.next().await.is_none());
    }

    #[test(tokio::test)]
    async fn test_legacy_protocol_round_trip() {
        let terminated = Arc::new(AtomicUsize::new(0));
        let endpoint = {
            let terminated = Arc::clone(&terminated);
            spawn_ws_server(move |mut socket| {
                let terminated = Arc::clone(&terminated);
                async move {
                    ack_handshake(&mut socket).await;
                    send_json(&mut socket, json!({ "type": "ka" })).await;

                    let start = recv_json(&mut socket).await;
                    assert_eq!(start["type"], "start");
                    let id = start["id"].as_str().unwrap().to_string();
                    send_json(
                        &mut socket,
                        json!({ "type": "data", "id": id, "payload": { "data": { "tick": 1 } } }),
                    )
                    .await;
                    send_json(&mut socket, json!({ "type": "complete", "id": id })).await;

                    loop {
                        match socket.recv().await {
                            Some(Ok(WsMessage::Text(text))) => {
                                let message: serde_json::Value =
                                    serde_json::from_str(text.as_str()).unwrap();
                                if message["type"] == "connection_terminate" {
                                    terminated.fetch_add(1, Ordering::SeqCst);
                                }
                            }
                            Some(Ok(_)) => continue,
                            _ => break,
                        }
                    }
                }
            })
            .await
        };

        let transport = WebSocketTransport::builder()
            .endpoint(endpoint)
            .configuration(WebSocketConfiguration {
                protocol: WebSocketProtocol::SubscriptionsTransportWs,
                ..Default::default()
            })
            .build();
        let mut responses = transport
            .execute_subscription(subscription_request("subscription { tick }"))
            .await
            .unwrap();
        let event = responses.next().await.unwrap().unwrap();
        assert_eq!(event.data, Some(bjson!({ "tick": 1 })));
        assert!(responses.next().await.is_none());

        // Dropping the transport closes the connection with a protocol
        // terminate message.
        drop(responses);
        drop(transport);
        tokio::time::timeout(Duration::from_secs(5), async {
            while terminated.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("the server never saw connection_terminate");
    }

    #[test(tokio::test)]
    async fn test_execute_single_request() {
        let endpoint = spawn_ws_server(|mut socket| async move {
            ack_handshake(&mut socket).await;
            let subscribe = recv_json(&mut socket).await;
            let id = subscribe["id"].as_str().unwrap().to_string();
            send_json(
                &mut socket,
                json!({
                    "type": "next",
                    "id": id,
                    "payload": { "data": { "greeting": "hello" } },
                }),
            )
            .await;
            send_json(&mut socket, json!({ "type": "complete", "id": id })).await;
            while socket.recv().await.is_some() {}
        })
        .await;

        let transport = WebSocketTransport::builder().endpoint(endpoint).build();
        let response = transport
            .execute(subscription_request("{ greeting }"))
            .await
            .unwrap();
        assert_eq!(response.data, Some(bjson!({ "greeting": "hello" })));
    }

    #[test(tokio::test)]
    async fn test_connection_params_and_ack_payload() {
        let endpoint = spawn_ws_server(|mut socket| async move {
            let init = recv_json(&mut socket).await;
            assert_eq!(init["type"], "connection_init");
            assert_eq!(init["payload"], json!({ "token": "s3cret" }));
            send_json(
                &mut socket,
                json!({ "type": "connection_ack", "payload": { "region": "eu-west" } }),
            )
            .await;

            let subscribe = recv_json(&mut socket).await;
            let id = subscribe["id"].as_str().unwrap().to_string();
            send_json(&mut socket, json!({ "type": "complete", "id": id })).await;
            while socket.recv().await.is_some() {}
        })
        .await;

        let transport = WebSocketTransport::builder().endpoint(endpoint).build();
        let request = subscription_request("subscription { a }");
        let context = request.context.clone();
        context.insert_json_value(CONNECTION_PARAMS_CONTEXT_KEY, bjson!({ "token": "s3cret" }));

        let mut responses = transport.execute_subscription(request).await.unwrap();
        assert!(responses.next().await.is_none());
        assert_eq!(
            context.get_json_value(CONNECTION_ACK_CONTEXT_KEY),
            Some(bjson!({ "region": "eu-west" }))
        );
    }

    #[test]
    fn test_configuration_deserialization() {
        let configuration: WebSocketConfiguration = serde_json::from_str(
            r#"{
                "protocol": "subscriptions_transport_ws",
                "ack_timeout": "2s",
                "heartbeat_interval": "10s"
            }"#,
        )
        .unwrap();
        assert_eq!(
            configuration.protocol,
            WebSocketProtocol::SubscriptionsTransportWs
        );
        assert_eq!(configuration.ack_timeout, Duration::from_secs(2));
        assert_eq!(
            configuration.heartbeat_interval,
            Some(Duration::from_secs(10))
        );

        let defaulted: WebSocketConfiguration = serde_json::from_str("{}").unwrap();
        assert_eq!(defaulted.protocol, WebSocketProtocol::GraphqlWs);
        assert_eq!(defaulted.ack_timeout, CONNECTION_ACK_TIMEOUT);
        assert_eq!(defaulted.heartbeat_interval, None);
    }
}
