//! A transport-agnostic GraphQL client with interceptors, subscriptions and
//! exception mapping.
//!
//! A [`Client`] sends GraphQL requests through a [`transport::Transport`]
//! (HTTP, WebSocket, or an in-process [`execution::ExecutionService`]) and
//! hands back responses to navigate with
//! [`ClientResponse`](client::ClientResponse). The `graphql-conduit-test`
//! crate layers a fluent assertion surface on top for tests.

#![warn(unreachable_pub)]

#[macro_use]
pub mod json_ext;

pub mod client;
pub mod context;
pub mod document;
pub mod error;
pub mod execution;
pub mod graphql;
pub mod testing;
pub mod transport;

pub use client::Client;
pub use client::ClientRequest;
pub use client::ClientResponse;
pub use context::Context;
