//! In-process request execution.
//!
//! [`ExecutionService`] adapts an [`Executor`] (a GraphQL engine) to the
//! [`Transport`] interface, so a client can run against an engine in the
//! same process with no network in between.

pub mod exception;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;
use tower::BoxError;

use crate::client::ClientRequest;
use crate::context::Context;
use crate::context::LocalValueAccessor;
use crate::graphql;
use crate::json_ext::Object;
use crate::transport::ResponseStream;
use crate::transport::Transport;

/// What an [`Executor`] receives: the request fields plus the ambient
/// [`Context`] attached at submission.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub document: String,
    pub operation_name: Option<String>,
    pub variables: Object,
    pub context: Context,
}

#[buildstructor::buildstructor]
impl ExecutionRequest {
    /// Returns a builder that builds an [`ExecutionRequest`].
    ///
    /// Builder methods:
    ///
    /// * `.document(impl Into<String>)`
    ///   Required.
    ///
    /// * `.operation_name(impl Into<String>)`
    ///   Optional.
    ///
    /// * `.variables(JsonMap<ByteString, Value>)`
    ///   Optional.
    ///
    /// * `.context(Context)`
    ///   Optional. Defaults to an empty context.
    ///
    /// * `.build()`
    ///   Finishes the builder and returns an [`ExecutionRequest`].
    #[builder(visibility = "pub")]
    fn new(
        document: String,
        operation_name: Option<String>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        variables: JsonMap<ByteString, Value>,
        context: Option<Context>,
    ) -> Self {
        ExecutionRequest {
            document,
            operation_name,
            variables,
            context: context.unwrap_or_default(),
        }
    }
}

impl From<ClientRequest> for ExecutionRequest {
    fn from(request: ClientRequest) -> Self {
        ExecutionRequest {
            document: request.request.query,
            operation_name: request.request.operation_name,
            variables: request.request.variables,
            context: request.context,
        }
    }
}

/// A GraphQL engine.
///
/// An `Err` is an engine failure; a request that executed but produced
/// GraphQL errors is an `Ok` response carrying them.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<graphql::Response, BoxError>;

    async fn subscribe(&self, request: ExecutionRequest) -> Result<ResponseStream, BoxError>;
}

/// [`Transport`] running requests on an in-process [`Executor`].
pub struct ExecutionService {
    executor: Arc<dyn Executor>,
    accessors: Vec<Arc<dyn LocalValueAccessor>>,
}

impl ExecutionService {
    pub fn builder(executor: impl Executor + 'static) -> ExecutionServiceBuilder {
        ExecutionServiceBuilder {
            executor: Arc::new(executor),
            accessors: Vec::new(),
        }
    }

    fn attach_locals(&self, context: &Context) {
        // On the submitting thread, before the first await: values present
        // in thread-locals here travel inside the context from now on.
        context.extract_locals(&self.accessors);
    }
}

/// Configures and builds an [`ExecutionService`].
pub struct ExecutionServiceBuilder {
    executor: Arc<dyn Executor>,
    accessors: Vec<Arc<dyn LocalValueAccessor>>,
}

impl ExecutionServiceBuilder {
    /// Register a thread-local accessor whose value is captured into the
    /// context when a request is submitted.
    pub fn accessor(mut self, accessor: impl LocalValueAccessor + 'static) -> Self {
        self.accessors.push(Arc::new(accessor));
        self
    }

    pub fn build(self) -> ExecutionService {
        ExecutionService {
            executor: self.executor,
            accessors: self.accessors,
        }
    }
}

#[async_trait]
impl Transport for ExecutionService {
    async fn execute(&self, request: ClientRequest) -> Result<graphql::Response, BoxError> {
        self.attach_locals(&request.context);
        self.executor.execute(request.into()).await
    }

    async fn execute_subscription(
        &self,
        request: ClientRequest,
    ) -> Result<ResponseStream, BoxError> {
        self.attach_locals(&request.context);
        self.executor.subscribe(request.into()).await
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use futures::StreamExt;
    use parking_lot::Mutex;
    use serde_json_bytes::Value;
    use serde_json_bytes::json as bjson;
    use test_log::test;

    use super::*;

    #[derive(Clone, Default)]
    struct CapturingExecutor {
        seen: Arc<Mutex<Vec<ExecutionRequest>>>,
    }

    #[async_trait]
    impl Executor for CapturingExecutor {
        async fn execute(
            &self,
            request: ExecutionRequest,
        ) -> Result<graphql::Response, BoxError> {
            self.seen.lock().push(request);
            Ok(graphql::Response::builder()
                .data(bjson!({ "ok": true }))
                .build())
        }

        async fn subscribe(
            &self,
            request: ExecutionRequest,
        ) -> Result<ResponseStream, BoxError> {
            self.seen.lock().push(request);
            Ok(futures::stream::empty().boxed())
        }
    }

    fn client_request(query: &str) -> ClientRequest {
        ClientRequest {
            request: graphql::Request::builder()
                .query(query)
                .operation_name("Q")
                .variable("id", 7_u64)
                .build(),
            context: Context::new(),
        }
    }

    #[test(tokio::test)]
    async fn test_requests_map_onto_the_executor_boundary() {
        let executor = CapturingExecutor::default();
        let service = ExecutionService::builder(executor.clone()).build();

        let response = service
            .execute(client_request("query Q($id: ID!) { user(id: $id) { name } }"))
            .await
            .unwrap();
        assert_eq!(response.data, Some(bjson!({ "ok": true })));

        let seen = executor.seen.lock();
        assert_eq!(seen[0].document, "query Q($id: ID!) { user(id: $id) { name } }");
        assert_eq!(seen[0].operation_name.as_deref(), Some("Q"));
        assert_eq!(seen[0].variables.get("id"), Some(&Value::from(7_u64)));
    }

    thread_local! {
        static CURRENT_TENANT: RefCell<Option<String>> = const { RefCell::new(None) };
    }

    struct TenantAccessor;

    impl LocalValueAccessor for TenantAccessor {
        fn key(&self) -> &str {
            "tenant"
        }

        fn extract(&self) -> Option<Value> {
            CURRENT_TENANT.with(|cell| cell.borrow().clone().map(Value::from))
        }

        fn restore(&self, value: &Value) {
            if let Value::String(tenant) = value {
                CURRENT_TENANT.with(|cell| {
                    *cell.borrow_mut() = Some(tenant.as_str().to_string());
                });
            }
        }

        fn clear(&self) {
            CURRENT_TENANT.with(|cell| *cell.borrow_mut() = None);
        }
    }

    #[test(tokio::test)]
    async fn test_locals_are_captured_at_submission() {
        let executor = CapturingExecutor::default();
        let service = ExecutionService::builder(executor.clone())
            .accessor(TenantAccessor)
            .build();

        CURRENT_TENANT.with(|cell| *cell.borrow_mut() = Some("acme".to_string()));
        service.execute(client_request("{ me { id } }")).await.unwrap();
        CURRENT_TENANT.with(|cell| *cell.borrow_mut() = None);

        let seen = executor.seen.lock();
        assert_eq!(
            seen[0].context.get_json_value("tenant"),
            Some(Value::from("acme"))
        );
    }

    #[test(tokio::test)]
    async fn test_absent_locals_stay_absent() {
        let executor = CapturingExecutor::default();
        let service = ExecutionService::builder(executor.clone())
            .accessor(TenantAccessor)
            .build();

        service.execute(client_request("{ me { id } }")).await.unwrap();

        let seen = executor.seen.lock();
        assert_eq!(seen[0].context.get_json_value("tenant"), None);
    }
}
