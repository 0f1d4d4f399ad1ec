//! Test doubles for exercising clients without a server.
//!
//! [`MockTransport`] answers requests from a canned map and records what it
//! received; [`StubExecutor`] is a minimal in-process engine driven entirely
//! by registered field fetchers, for wiring through
//! [`ExecutionService`](crate::execution::ExecutionService).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json_bytes::Value;
use tower::BoxError;

use crate::client::ClientRequest;
use crate::context::LocalValueGuard;
use crate::error::SubscriptionEndedError;
use crate::execution::ExecutionRequest;
use crate::execution::Executor;
use crate::execution::exception::ExceptionResolverChain;
use crate::execution::exception::FieldEnvironment;
use crate::graphql;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::transport::ResponseStream;
use crate::transport::Transport;

type MockResponses = HashMap<graphql::Request, graphql::Response>;

struct CannedSubscription {
    events: Vec<graphql::Response>,
    /// Errors the server ends the subscription with; empty for a clean
    /// completion.
    errors: Vec<graphql::Error>,
}

/// A [`Transport`] answering from canned responses.
///
/// Clones share the canned maps and the request log, so a clone kept aside
/// serves as a probe into what the client actually sent.
#[derive(Clone, Default)]
pub struct MockTransport {
    // using arcs to improve efficiency when the transport is cloned
    responses: Arc<MockResponses>,
    subscriptions: Arc<HashMap<graphql::Request, CannedSubscription>>,
    received: Arc<Mutex<Vec<ClientRequest>>>,
}

impl MockTransport {
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    /// Every request this transport has been asked to execute, in order.
    pub fn received(&self) -> Vec<ClientRequest> {
        self.received.lock().clone()
    }

    fn unmatched(request: &graphql::Request) -> BoxError {
        format!(
            "no canned response matches the request: {}",
            serde_json::to_string(request).expect("a request is serializable; qed"),
        )
        .into()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: ClientRequest) -> Result<graphql::Response, BoxError> {
        self.received.lock().push(request.clone());
        match self.responses.get(&request.request) {
            Some(response) => Ok(response.clone()),
            None => Err(Self::unmatched(&request.request)),
        }
    }

    async fn execute_subscription(
        &self,
        request: ClientRequest,
    ) -> Result<ResponseStream, BoxError> {
        self.received.lock().push(request.clone());
        match self.subscriptions.get(&request.request) {
            Some(canned) => {
                let mut events: Vec<Result<graphql::Response, BoxError>> =
                    canned.events.iter().cloned().map(Ok).collect();
                if !canned.errors.is_empty() {
                    events.push(Err(SubscriptionEndedError {
                        errors: canned.errors.clone(),
                    }
                    .into()));
                }
                Ok(futures::stream::iter(events).boxed())
            }
            None => Err(Self::unmatched(&request.request)),
        }
    }
}

/// Collects canned responses for a [`MockTransport`].
#[derive(Default)]
pub struct MockTransportBuilder {
    responses: MockResponses,
    subscriptions: HashMap<graphql::Request, CannedSubscription>,
}

impl MockTransportBuilder {
    /// Answer `request` with `response`.
    pub fn with_response(
        mut self,
        request: graphql::Request,
        response: graphql::Response,
    ) -> Self {
        self.responses.insert(request, response);
        self
    }

    /// Answer `request` with a subscription yielding `events`, then
    /// completing cleanly.
    pub fn with_subscription(
        mut self,
        request: graphql::Request,
        events: Vec<graphql::Response>,
    ) -> Self {
        self.subscriptions.insert(
            request,
            CannedSubscription {
                events,
                errors: Vec::new(),
            },
        );
        self
    }

    /// Answer `request` with a subscription yielding `events` and then
    /// terminated by the server with `errors`.
    pub fn with_failing_subscription(
        mut self,
        request: graphql::Request,
        events: Vec<graphql::Response>,
        errors: Vec<graphql::Error>,
    ) -> Self {
        self.subscriptions
            .insert(request, CannedSubscription { events, errors });
        self
    }

    pub fn build(self) -> MockTransport {
        MockTransport {
            responses: Arc::new(self.responses),
            subscriptions: Arc::new(self.subscriptions),
            received: Arc::default(),
        }
    }
}

/// The events a subscription field produces, as returned by a registered
/// subscription fetcher.
pub type SubscriptionEvents = BoxStream<'static, Result<Value, BoxError>>;

type FieldFetcher = Box<dyn Fn(&FieldEnvironment) -> Result<Value, BoxError> + Send + Sync>;
type SubscriptionFetcher = Box<dyn Fn(&FieldEnvironment) -> SubscriptionEvents + Send + Sync>;

/// An [`Executor`] that resolves registered fields instead of parsing the
/// request document.
///
/// Every registered field fetcher runs on `execute` and its value lands in
/// the response data under the field's name. A failing fetcher null-merges:
/// the field becomes `null` and the failure goes through the configured
/// [`ExceptionResolverChain`] to produce the response errors. Fetchers run
/// with the chain's registered thread-local values restored.
pub struct StubExecutor {
    fields: Vec<(String, FieldFetcher)>,
    subscriptions: Vec<(String, SubscriptionFetcher)>,
    exceptions: ExceptionResolverChain,
}

impl StubExecutor {
    pub fn builder() -> StubExecutorBuilder {
        StubExecutorBuilder::default()
    }

    fn environment(&self, field: &str, request: &ExecutionRequest) -> FieldEnvironment {
        FieldEnvironment::builder()
            .path(Path::from_key(field))
            .and_operation_name(request.operation_name.clone())
            .context(request.context.clone())
            .build()
    }

    fn field_response(field: &str, value: Value, errors: Vec<graphql::Error>) -> graphql::Response {
        let mut data = Object::default();
        data.insert(field, value);
        graphql::Response::builder()
            .data(Value::Object(data))
            .errors(errors)
            .build()
    }
}

#[async_trait]
impl Executor for StubExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<graphql::Response, BoxError> {
        let mut data = Object::default();
        let mut errors = Vec::new();
        for (name, fetcher) in &self.fields {
            let environment = self.environment(name, &request);
            let result = {
                let _guard =
                    LocalValueGuard::restore(self.exceptions.accessors(), &environment.context);
                fetcher(&environment)
            };
            match result {
                Ok(value) => {
                    data.insert(name.as_str(), value);
                }
                Err(error) => {
                    data.insert(name.as_str(), Value::Null);
                    errors.extend(self.exceptions.resolve(&error, &environment).await);
                }
            }
        }
        Ok(graphql::Response::builder()
            .data(Value::Object(data))
            .errors(errors)
            .build())
    }

    async fn subscribe(&self, request: ExecutionRequest) -> Result<ResponseStream, BoxError> {
        let mut streams = Vec::new();
        for (name, fetcher) in &self.subscriptions {
            let environment = self.environment(name, &request);
            let events = {
                let _guard =
                    LocalValueGuard::restore(self.exceptions.accessors(), &environment.context);
                fetcher(&environment)
            };
            let name = name.clone();
            let exceptions = self.exceptions.clone();
            streams.push(events.then(move |event| {
                let name = name.clone();
                let exceptions = exceptions.clone();
                let environment = environment.clone();
                async move {
                    match event {
                        Ok(value) => Self::field_response(&name, value, Vec::new()),
                        Err(error) => {
                            let errors = exceptions.resolve(&error, &environment).await;
                            Self::field_response(&name, Value::Null, errors)
                        }
                    }
                }
            }));
        }
        // One registered subscription is the normal case; several are
        // played back in registration order.
        Ok(futures::stream::iter(streams).flatten().map(Ok).boxed())
    }
}

/// Collects field fetchers for a [`StubExecutor`].
#[derive(Default)]
pub struct StubExecutorBuilder {
    fields: Vec<(String, FieldFetcher)>,
    subscriptions: Vec<(String, SubscriptionFetcher)>,
    exceptions: ExceptionResolverChain,
}

impl StubExecutorBuilder {
    /// Register a fetcher producing the value of a top-level field.
    pub fn field(
        mut self,
        name: impl Into<String>,
        fetcher: impl Fn(&FieldEnvironment) -> Result<Value, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.fields.push((name.into(), Box::new(fetcher)));
        self
    }

    /// Register a fetcher producing the event stream of a subscription
    /// field.
    pub fn subscription(
        mut self,
        name: impl Into<String>,
        fetcher: impl Fn(&FieldEnvironment) -> SubscriptionEvents + Send + Sync + 'static,
    ) -> Self {
        self.subscriptions.push((name.into(), Box::new(fetcher)));
        self
    }

    /// Resolve fetcher failures through `exceptions` instead of the default
    /// empty chain (which turns every failure into the generic fallback
    /// error).
    pub fn exceptions(mut self, exceptions: ExceptionResolverChain) -> Self {
        self.exceptions = exceptions;
        self
    }

    pub fn build(self) -> StubExecutor {
        StubExecutor {
            fields: self.fields,
            subscriptions: self.subscriptions,
            exceptions: self.exceptions,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json_bytes::json as bjson;
    use test_log::test;

    use super::*;
    use crate::context::Context;
    use crate::context::LocalValueAccessor;
    use crate::execution::exception::ExceptionResolverAdapter;
    use crate::graphql::ErrorType;

    fn client_request(query: &str) -> ClientRequest {
        ClientRequest {
            request: graphql::Request::builder().query(query).build(),
            context: Context::new(),
        }
    }

    #[test(tokio::test)]
    async fn test_mock_transport_answers_canned_requests() {
        let transport = MockTransport::builder()
            .with_response(
                graphql::Request::builder().query("{ me { name } }").build(),
                graphql::Response::builder()
                    .data(bjson!({ "me": { "name": "Ada" } }))
                    .build(),
            )
            .build();

        let response = transport
            .execute(client_request("{ me { name } }"))
            .await
            .unwrap();
        assert_eq!(response.data, Some(bjson!({ "me": { "name": "Ada" } })));

        let received = transport.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].request.query, "{ me { name } }");
    }

    #[test(tokio::test)]
    async fn test_mock_transport_rejects_unknown_requests() {
        let transport = MockTransport::default();
        let err = transport
            .execute(client_request("{ unknown }"))
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("no canned response"),
            "unexpected error: {err}"
        );
    }

    #[test(tokio::test)]
    async fn test_stub_executor_merges_fields_and_null_merges_failures() {
        let executor = StubExecutor::builder()
            .field("answer", |_| Ok(Value::from(42_u64)))
            .field("broken", |_| Err("backend offline".into()))
            .exceptions(
                ExceptionResolverChain::builder()
                    .resolver(ExceptionResolverAdapter::new(|error, environment| {
                        Some(
                            graphql::Error::builder()
                                .message(format!("mapped: {error}"))
                                .path(environment.path.clone())
                                .build(),
                        )
                    }))
                    .build(),
            )
            .build();

        let response = executor
            .execute(ExecutionRequest::builder().document("{ answer broken }").build())
            .await
            .unwrap();

        assert_eq!(
            response.data,
            Some(bjson!({ "answer": 42, "broken": Value::Null }))
        );
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "mapped: backend offline");
        assert_eq!(response.errors[0].path.as_ref().unwrap().to_string(), "broken");
    }

    #[test(tokio::test)]
    async fn test_stub_executor_falls_back_without_a_chain() {
        let executor = StubExecutor::builder()
            .field("broken", |_| Err("backend offline".into()))
            .build();

        let response = executor
            .execute(ExecutionRequest::builder().document("{ broken }").build())
            .await
            .unwrap();

        assert_eq!(response.errors[0].message, "backend offline");
        assert_eq!(response.errors[0].error_type(), Some(ErrorType::InternalError));
    }

    #[test(tokio::test)]
    async fn test_stub_executor_subscription_events() {
        let executor = StubExecutor::builder()
            .subscription("tick", |_| {
                futures::stream::iter(vec![
                    Ok(Value::from(1_u64)),
                    Ok(Value::from(2_u64)),
                    Err("ticker crashed".into()),
                ])
                .boxed()
            })
            .build();

        let mut events = executor
            .subscribe(
                ExecutionRequest::builder()
                    .document("subscription { tick }")
                    .build(),
            )
            .await
            .unwrap();

        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.data, Some(bjson!({ "tick": 1 })));
        let second = events.next().await.unwrap().unwrap();
        assert_eq!(second.data, Some(bjson!({ "tick": 2 })));
        let third = events.next().await.unwrap().unwrap();
        assert_eq!(third.data, Some(bjson!({ "tick": Value::Null })));
        assert_eq!(third.errors[0].message, "ticker crashed");
        assert!(events.next().await.is_none());
    }

    thread_local! {
        static CURRENT_USER: RefCell<Option<String>> = const { RefCell::new(None) };
    }

    struct UserAccessor;

    impl LocalValueAccessor for UserAccessor {
        fn key(&self) -> &str {
            "user.name"
        }

        fn extract(&self) -> Option<Value> {
            CURRENT_USER.with(|user| user.borrow().clone().map(Value::from))
        }

        fn restore(&self, value: &Value) {
            if let Value::String(name) = value {
                CURRENT_USER.with(|user| *user.borrow_mut() = Some(name.as_str().to_string()));
            }
        }

        fn clear(&self) {
            CURRENT_USER.with(|user| *user.borrow_mut() = None);
        }
    }

    #[test(tokio::test)]
    async fn test_stub_executor_restores_locals_around_fetchers() {
        let executor = StubExecutor::builder()
            .field("greeting", |_| {
                let user = CURRENT_USER
                    .with(|user| user.borrow().clone())
                    .unwrap_or_else(|| "nobody".to_string());
                Ok(Value::from(format!("hello {user}")))
            })
            .exceptions(
                ExceptionResolverChain::builder().accessor(UserAccessor).build(),
            )
            .build();

        let context = Context::new();
        context.insert_json_value("user.name", Value::from("leia"));

        let response = executor
            .execute(
                ExecutionRequest::builder()
                    .document("{ greeting }")
                    .context(context)
                    .build(),
            )
            .await
            .unwrap();

        assert_eq!(response.data, Some(bjson!({ "greeting": "hello leia" })));
        // The guard cleared the thread-local when the fetcher returned.
        assert_eq!(CURRENT_USER.with(|user| user.borrow().clone()), None);
    }
}
