//! Assertion-style testing workflow for GraphQL requests.
//!
//! A [`Tester`] wraps a [`graphql_conduit::Client`] and executes requests
//! into specs that panic with descriptive messages when an expectation does
//! not hold, the way tests want failures surfaced. The workflow mirrors the
//! client surface: build the tester over any transport, issue a document,
//! then chain path and error assertions off the returned [`ResponseSpec`].
//!
//! Response errors must be acknowledged before data is inspected:
//! [`ResponseSpec::path`] fails while unverified errors remain, and
//! [`ErrorSpec`] provides `filter` / `expect` / `satisfy` / `verify` to
//! acknowledge them.

#![warn(unreachable_pub)]

use std::fmt::Debug;

use futures::StreamExt;
use graphql_conduit::Client;
use graphql_conduit::ClientResponse;
use graphql_conduit::client::ClientBuilder;
use graphql_conduit::client::RequestBuilder;
use graphql_conduit::client::ResponseField;
use graphql_conduit::client::interceptor::Interceptor;
use graphql_conduit::document::DocumentSource;
use graphql_conduit::graphql;
use graphql_conduit::transport::Transport;
use serde::de::DeserializeOwned;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;

/// Entry point of the testing workflow.
pub struct Tester {
    client: Client,
}

impl Tester {
    /// A tester over an existing, fully configured client.
    pub fn new(client: Client) -> Self {
        Tester { client }
    }

    /// Start configuring a tester from a transport, mirroring
    /// [`Client::builder`].
    pub fn builder(transport: impl Transport + 'static) -> TesterBuilder {
        TesterBuilder {
            inner: Client::builder(transport),
        }
    }

    /// Start a request from a full GraphQL document.
    pub fn document(&self, document: impl Into<String>) -> TesterRequest {
        TesterRequest {
            inner: self.client.document(document),
        }
    }

    /// Start a request from the name of a document to resolve through the
    /// client's document source.
    pub fn document_name(&self, name: impl Into<String>) -> TesterRequest {
        TesterRequest {
            inner: self.client.document_name(name),
        }
    }
}

/// Configures and builds a [`Tester`], mirroring the client builder.
pub struct TesterBuilder {
    inner: ClientBuilder,
}

impl TesterBuilder {
    /// Append an interceptor. Interceptors run in the order they were
    /// added.
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.inner = self.inner.interceptor(interceptor);
        self
    }

    /// Resolve [`Tester::document_name`] references through `source`.
    pub fn document_source(mut self, source: impl DocumentSource + 'static) -> Self {
        self.inner = self.inner.document_source(source);
        self
    }

    pub fn build(self) -> Tester {
        Tester {
            client: self.inner.build(),
        }
    }
}

/// A request under test. Reusable: every `execute*` call snapshots the
/// current state.
pub struct TesterRequest {
    inner: RequestBuilder,
}

impl TesterRequest {
    /// Select the operation to execute when the document defines several.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.inner = self.inner.operation_name(name);
        self
    }

    /// Set a variable. Setting the same name again overwrites the previous
    /// value.
    pub fn variable(mut self, name: impl Into<ByteString>, value: impl Into<Value>) -> Self {
        self.inner = self.inner.variable(name, value);
        self
    }

    /// Set a request extension.
    pub fn extension(mut self, name: impl Into<ByteString>, value: impl Into<Value>) -> Self {
        self.inner = self.inner.extension(name, value);
        self
    }

    /// Execute and wrap the response for assertions.
    ///
    /// # Panics
    ///
    /// When the request fails below the GraphQL layer (transport or
    /// interceptor failure). A response carrying GraphQL errors does not
    /// panic here; those are handled through [`ResponseSpec::errors`].
    pub async fn execute(&self) -> ResponseSpec {
        match self.inner.execute().await {
            Ok(response) => ResponseSpec::new(response),
            Err(error) => panic!("request execution failed: {error}"),
        }
    }

    /// Execute and require an error-free response.
    ///
    /// # Panics
    ///
    /// When the request fails, or the response carries any error.
    pub async fn execute_and_verify(&self) -> ResponseSpec {
        self.execute().await.errors().verify()
    }

    /// Execute as a subscription and collect every event.
    ///
    /// # Panics
    ///
    /// When the subscription cannot start, an event fails, or the server
    /// terminates the subscription with errors.
    pub async fn execute_subscription(&self) -> Vec<ResponseSpec> {
        let mut events = match self.inner.execute_subscription().await {
            Ok(events) => events,
            Err(error) => panic!("subscription failed to start: {error}"),
        };
        let mut specs = Vec::new();
        while let Some(event) = events.next().await {
            match event {
                Ok(response) => specs.push(ResponseSpec::new(response)),
                Err(error) => panic!("subscription failed: {error}"),
            }
        }
        specs
    }
}

/// A response under test.
///
/// Tracks which of the response's errors have been verified; navigating to
/// data while unverified errors remain is a test failure.
pub struct ResponseSpec {
    response: ClientResponse,
    verified: Vec<bool>,
}

impl ResponseSpec {
    fn new(response: ClientResponse) -> Self {
        let verified = vec![false; response.errors().len()];
        ResponseSpec { response, verified }
    }

    /// Switch to the error verification workflow.
    pub fn errors(self) -> ErrorSpec {
        ErrorSpec {
            response: self.response,
            verified: self.verified,
        }
    }

    /// Navigate to `path` for value assertions.
    ///
    /// # Panics
    ///
    /// When the path is malformed, or unverified response errors remain.
    pub fn path(self, path: &str) -> PathSpec {
        let unverified = unverified_errors(&self.response, &self.verified);
        if !unverified.is_empty() {
            panic!(
                "response contains unexpected errors: {}",
                format_errors(&unverified),
            );
        }
        if let Err(error) = self.response.field(path) {
            panic!("invalid path '{path}': {error}");
        }
        PathSpec {
            response: self.response,
            verified: self.verified,
            path: path.to_string(),
        }
    }

    /// The wrapped response, for inspection beyond what the specs cover.
    pub fn response(&self) -> &ClientResponse {
        &self.response
    }

    pub fn into_response(self) -> ClientResponse {
        self.response
    }
}

/// The error verification workflow of a [`ResponseSpec`].
pub struct ErrorSpec {
    response: ClientResponse,
    verified: Vec<bool>,
}

impl ErrorSpec {
    /// Mark every error matching `predicate` as expected. Never fails, even
    /// when nothing matches.
    pub fn filter(mut self, predicate: impl Fn(&graphql::Error) -> bool) -> Self {
        self.mark(&predicate);
        self
    }

    /// Require at least one error matching `predicate`; matching errors
    /// become expected.
    ///
    /// # Panics
    ///
    /// When no error matches.
    pub fn expect(mut self, predicate: impl Fn(&graphql::Error) -> bool) -> Self {
        if self.mark(&predicate) == 0 {
            panic!(
                "no response error matches the expectation; response errors: {}",
                format_errors(self.response.errors()),
            );
        }
        self
    }

    /// Hand the unverified errors to `consumer` and mark them all verified.
    pub fn satisfy(mut self, consumer: impl FnOnce(&[graphql::Error])) -> Self {
        let unverified = unverified_errors(&self.response, &self.verified);
        consumer(&unverified);
        for flag in &mut self.verified {
            *flag = true;
        }
        self
    }

    /// Require that every error has been verified.
    ///
    /// # Panics
    ///
    /// When unverified errors remain, listing them.
    pub fn verify(self) -> ResponseSpec {
        let unverified = unverified_errors(&self.response, &self.verified);
        if !unverified.is_empty() {
            panic!(
                "response contains unverified errors: {}",
                format_errors(&unverified),
            );
        }
        ResponseSpec {
            response: self.response,
            verified: self.verified,
        }
    }

    fn mark(&mut self, predicate: &impl Fn(&graphql::Error) -> bool) -> usize {
        let mut marked = 0;
        for (error, verified) in self.response.errors().iter().zip(self.verified.iter_mut()) {
            if predicate(error) {
                *verified = true;
                marked += 1;
            }
        }
        marked
    }
}

/// Value assertions at one path of a response.
///
/// Assertions return the spec so they chain; [`PathSpec::path`] moves on to
/// another path of the same response.
pub struct PathSpec {
    response: ClientResponse,
    verified: Vec<bool>,
    path: String,
}

impl PathSpec {
    fn field(&self) -> ResponseField<'_> {
        // The path was validated when this spec was created.
        self.response
            .field(&self.path)
            .expect("path was validated on entry")
    }

    /// Navigate to another path of the same response.
    pub fn path(self, path: &str) -> PathSpec {
        ResponseSpec {
            response: self.response,
            verified: self.verified,
        }
        .path(path)
    }

    /// Require the path to be addressable in the data, a null value
    /// included.
    pub fn path_exists(self) -> Self {
        if !self.field().exists() {
            panic!("path '{}' does not exist in the response", self.path);
        }
        self
    }

    pub fn path_does_not_exist(self) -> Self {
        if self.field().exists() {
            panic!("path '{}' unexpectedly exists in the response", self.path);
        }
        self
    }

    /// Require a non-null value at the path.
    pub fn value_exists(self) -> Self {
        if !self.field().has_value() {
            panic!("no value at path '{}'", self.path);
        }
        self
    }

    pub fn value_does_not_exist(self) -> Self {
        if self.field().has_value() {
            panic!(
                "unexpected value at path '{}': {:?}",
                self.path,
                self.field().value(),
            );
        }
        self
    }

    /// Require the value to be absent, null, or an empty string, list or
    /// object.
    pub fn value_is_empty(self) -> Self {
        if !is_empty_value(self.field().value()) {
            panic!(
                "value at path '{}' is not empty: {:?}",
                self.path,
                self.field().value(),
            );
        }
        self
    }

    pub fn value_is_not_empty(self) -> Self {
        if is_empty_value(self.field().value()) {
            panic!("value at path '{}' is empty", self.path);
        }
        self
    }

    /// Decode the value into `T`.
    ///
    /// # Panics
    ///
    /// When the field is unresolved (no value plus an associated error) or
    /// the value does not decode into `T`.
    pub fn entity<T>(self) -> EntitySpec<T>
    where
        T: DeserializeOwned,
    {
        match self.response.to_entity::<T>(&self.path) {
            Ok(entity) => EntitySpec {
                entity,
                response: self.response,
                verified: self.verified,
                path: self.path,
            },
            Err(error) => panic!("{error}"),
        }
    }

    /// Decode the value into a list of `T`.
    pub fn entity_list<T>(self) -> EntitySpec<Vec<T>>
    where
        T: DeserializeOwned,
    {
        self.entity::<Vec<T>>()
    }
}

/// Assertions over a decoded entity.
pub struct EntitySpec<T> {
    entity: T,
    response: ClientResponse,
    verified: Vec<bool>,
    path: String,
}

impl<T> EntitySpec<T> {
    /// # Panics
    ///
    /// When the decoded entity differs from `expected`.
    pub fn is_equal_to(self, expected: T) -> Self
    where
        T: PartialEq + Debug,
    {
        assert_eq!(self.entity, expected, "entity at path '{}'", self.path);
        self
    }

    /// Run arbitrary assertions against the decoded entity.
    pub fn satisfies(self, requirements: impl FnOnce(&T)) -> Self {
        requirements(&self.entity);
        self
    }

    /// The decoded entity.
    pub fn get(self) -> T {
        self.entity
    }

    /// Navigate to another path of the same response.
    pub fn path(self, path: &str) -> PathSpec {
        ResponseSpec {
            response: self.response,
            verified: self.verified,
        }
        .path(path)
    }
}

fn unverified_errors(response: &ClientResponse, verified: &[bool]) -> Vec<graphql::Error> {
    response
        .errors()
        .iter()
        .zip(verified.iter())
        .filter(|(_, verified)| !**verified)
        .map(|(error, _)| error.clone())
        .collect()
}

fn format_errors(errors: &[graphql::Error]) -> String {
    if errors.is_empty() {
        return "(none)".to_string();
    }
    errors
        .iter()
        .map(|error| format!("'{error}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.as_str().is_empty(),
        Some(Value::Array(array)) => array.is_empty(),
        Some(Value::Object(object)) => object.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use graphql_conduit::testing::MockTransport;
    use serde::Deserialize;
    use serde_json_bytes::json as bjson;
    use test_log::test;

    use super::*;

    fn tester_for(query: &str, response: graphql::Response) -> Tester {
        let transport = MockTransport::builder()
            .with_response(graphql::Request::builder().query(query).build(), response)
            .build();
        Tester::builder(transport).build()
    }

    #[test(tokio::test)]
    async fn test_path_assertions() {
        let tester = tester_for(
            "{ me { name friends } }",
            graphql::Response::builder()
                .data(bjson!({ "me": { "name": "Luke Skywalker", "friends": [] } }))
                .build(),
        );

        tester
            .document("{ me { name friends } }")
            .execute()
            .await
            .path("me.name")
            .path_exists()
            .value_exists()
            .value_is_not_empty()
            .path("me.friends")
            .path_exists()
            .value_is_empty()
            .path("hero")
            .path_does_not_exist();
    }

    #[test(tokio::test)]
    async fn test_null_field_assertions() {
        let tester = tester_for(
            "{ greeting }",
            graphql::Response::builder()
                .data(bjson!({ "greeting": Value::Null }))
                .build(),
        );

        tester
            .document("{ greeting }")
            .execute()
            .await
            .path("greeting")
            .path_exists()
            .value_does_not_exist()
            .value_is_empty();
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Character {
        name: String,
        friends: Vec<String>,
    }

    #[test(tokio::test)]
    async fn test_entity_decoding() {
        let tester = tester_for(
            "{ me { name friends } }",
            graphql::Response::builder()
                .data(bjson!({
                    "me": { "name": "Luke Skywalker", "friends": ["Han Solo", "Leia Organa"] },
                }))
                .build(),
        );

        let friends = tester
            .document("{ me { name friends } }")
            .execute()
            .await
            .path("me")
            .entity::<Character>()
            .is_equal_to(Character {
                name: "Luke Skywalker".to_string(),
                friends: vec!["Han Solo".to_string(), "Leia Organa".to_string()],
            })
            .satisfies(|me| assert_eq!(me.friends.len(), 2))
            .path("me.friends")
            .entity_list::<String>()
            .get();
        assert_eq!(friends, ["Han Solo", "Leia Organa"]);
    }

    fn two_error_response() -> graphql::Response {
        graphql::Response::builder()
            .data(bjson!({ "a": Value::Null, "b": Value::Null }))
            .errors(vec![
                graphql::Error::builder()
                    .message("a failed")
                    .path(graphql_conduit::json_ext::Path::from_key("a"))
                    .build(),
                graphql::Error::builder()
                    .message("b failed")
                    .path(graphql_conduit::json_ext::Path::from_key("b"))
                    .build(),
            ])
            .build()
    }

    #[test(tokio::test)]
    async fn test_error_workflow() {
        let tester = tester_for("{ a b }", two_error_response());

        tester
            .document("{ a b }")
            .execute()
            .await
            .errors()
            .filter(|error| error.message == "a failed")
            .expect(|error| error.message == "b failed")
            .verify()
            .path("a")
            .value_does_not_exist();
    }

    #[test(tokio::test)]
    async fn test_satisfy_consumes_all_errors() {
        let tester = tester_for("{ a b }", two_error_response());

        tester
            .document("{ a b }")
            .execute()
            .await
            .errors()
            .satisfy(|errors| {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[0].message, "a failed");
            })
            .verify();
    }

    #[test(tokio::test)]
    #[should_panic(expected = "unexpected errors")]
    async fn test_path_with_unverified_errors_panics() {
        let tester = tester_for("{ a b }", two_error_response());
        tester.document("{ a b }").execute().await.path("a");
    }

    #[test(tokio::test)]
    #[should_panic(expected = "no response error matches")]
    async fn test_expect_without_match_panics() {
        let tester = tester_for("{ a b }", two_error_response());
        tester
            .document("{ a b }")
            .execute()
            .await
            .errors()
            .expect(|error| error.message == "c failed");
    }

    #[test(tokio::test)]
    #[should_panic(expected = "unverified errors")]
    async fn test_verify_with_leftover_errors_panics() {
        let tester = tester_for("{ a b }", two_error_response());
        tester
            .document("{ a b }")
            .execute()
            .await
            .errors()
            .filter(|error| error.message == "a failed")
            .verify();
    }

    #[test(tokio::test)]
    #[should_panic(expected = "unverified errors")]
    async fn test_execute_and_verify_panics_on_errors() {
        let tester = tester_for("{ a b }", two_error_response());
        tester.document("{ a b }").execute_and_verify().await;
    }

    #[test(tokio::test)]
    #[should_panic(expected = "request execution failed")]
    async fn test_execute_panics_on_transport_failure() {
        let tester = Tester::builder(MockTransport::default()).build();
        tester.document("{ unknown }").execute().await;
    }

    #[test(tokio::test)]
    async fn test_subscription_events_collected() {
        let request = graphql::Request::builder()
            .query("subscription { tick }")
            .build();
        let transport = MockTransport::builder()
            .with_subscription(
                request,
                vec![
                    graphql::Response::builder().data(bjson!({ "tick": 1 })).build(),
                    graphql::Response::builder().data(bjson!({ "tick": 2 })).build(),
                ],
            )
            .build();
        let tester = Tester::builder(transport).build();

        let events = tester
            .document("subscription { tick }")
            .execute_subscription()
            .await;
        assert_eq!(events.len(), 2);
        let ticks: Vec<u64> = events
            .into_iter()
            .map(|event| event.path("tick").entity::<u64>().get())
            .collect();
        assert_eq!(ticks, [1, 2]);
    }

    #[test(tokio::test)]
    #[should_panic(expected = "subscription failed")]
    async fn test_subscription_error_termination_panics() {
        let request = graphql::Request::builder()
            .query("subscription { tick }")
            .build();
        let transport = MockTransport::builder()
            .with_failing_subscription(
                request,
                Vec::new(),
                vec![graphql::Error::builder().message("stream revoked").build()],
            )
            .build();
        let tester = Tester::builder(transport).build();

        tester
            .document("subscription { tick }")
            .execute_subscription()
            .await;
    }
}
