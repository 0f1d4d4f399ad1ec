//! Resolution of field errors raised during execution.
//!
//! When a field fetcher fails, the engine asks an
//! [`ExceptionResolverChain`] to turn the failure into GraphQL errors for
//! the response. Resolvers are consulted in registration order; the first
//! one to return a decision wins, and an unclaimed failure falls back to a
//! single generic internal error so that nothing is silently dropped.

use std::sync::Arc;

use async_trait::async_trait;
use tower::BoxError;

use crate::context::Context;
use crate::context::LocalValueAccessor;
use crate::context::LocalValueGuard;
use crate::graphql;
use crate::graphql::ErrorType;
use crate::graphql::Location;
use crate::json_ext::Path;

/// Where and for whom a field was being resolved when it failed.
#[derive(Clone, Debug)]
pub struct FieldEnvironment {
    /// The response path of the failing field.
    pub path: Path,
    /// The location of the field in the request document, when known.
    pub location: Option<Location>,
    /// The operation the request selected, when any.
    pub operation_name: Option<String>,
    /// The ambient context of the request.
    pub context: Context,
}

#[buildstructor::buildstructor]
impl FieldEnvironment {
    /// Returns a builder that builds a [`FieldEnvironment`].
    ///
    /// Builder methods:
    ///
    /// * `.path(Path)`
    ///   Required.
    ///   The response path of the failing field.
    ///
    /// * `.location(Location)`
    ///   Optional.
    ///
    /// * `.operation_name(impl Into<String>)`
    ///   Optional.
    ///
    /// * `.context(Context)`
    ///   Optional. Defaults to an empty context.
    ///
    /// * `.build()`
    ///   Finishes the builder and returns a [`FieldEnvironment`].
    #[builder(visibility = "pub")]
    fn new(
        path: Path,
        location: Option<Location>,
        operation_name: Option<String>,
        context: Option<Context>,
    ) -> Self {
        FieldEnvironment {
            path,
            location,
            operation_name,
            context: context.unwrap_or_default(),
        }
    }
}

/// Maps a field failure to GraphQL errors.
#[async_trait]
pub trait ExceptionResolver: Send + Sync + 'static {
    /// Decide what to do with `error`.
    ///
    /// `None` defers to the next resolver in the chain. An empty list
    /// suppresses the failure entirely; a non-empty list resolves it into
    /// those errors.
    async fn resolve(
        &self,
        error: &BoxError,
        environment: &FieldEnvironment,
    ) -> Option<Vec<graphql::Error>>;

    /// Whether the chain should restore registered thread-local values from
    /// the request context around [`resolve`](Self::resolve).
    ///
    /// Only meaningful for resolvers that complete without suspending: the
    /// values are bound to the polling thread for the duration of the call.
    fn wants_local_context(&self) -> bool {
        false
    }
}

/// Adapts a synchronous closure producing at most one error into an
/// [`ExceptionResolver`].
///
/// The closure cannot suppress a failure (that requires a full
/// [`ExceptionResolver`] returning an empty list); returning `None` defers
/// to the next resolver.
pub struct ExceptionResolverAdapter<F> {
    resolver: F,
    local_context_aware: bool,
}

impl<F> ExceptionResolverAdapter<F>
where
    F: Fn(&BoxError, &FieldEnvironment) -> Option<graphql::Error> + Send + Sync + 'static,
{
    pub fn new(resolver: F) -> Self {
        ExceptionResolverAdapter {
            resolver,
            local_context_aware: false,
        }
    }

    /// Restore registered thread-local values from the request context
    /// while the closure runs.
    pub fn local_context_aware(mut self, aware: bool) -> Self {
        self.local_context_aware = aware;
        self
    }
}

#[async_trait]
impl<F> ExceptionResolver for ExceptionResolverAdapter<F>
where
    F: Fn(&BoxError, &FieldEnvironment) -> Option<graphql::Error> + Send + Sync + 'static,
{
    async fn resolve(
        &self,
        error: &BoxError,
        environment: &FieldEnvironment,
    ) -> Option<Vec<graphql::Error>> {
        (self.resolver)(error, environment).map(|error| vec![error])
    }

    fn wants_local_context(&self) -> bool {
        self.local_context_aware
    }
}

/// An ordered chain of [`ExceptionResolver`]s with a guaranteed outcome:
/// when no resolver claims a failure, it becomes one generic internal
/// error carrying the failing field's path and location.
#[derive(Clone, Default)]
pub struct ExceptionResolverChain {
    resolvers: Vec<Arc<dyn ExceptionResolver>>,
    accessors: Vec<Arc<dyn LocalValueAccessor>>,
}

impl ExceptionResolverChain {
    pub fn builder() -> ExceptionResolverChainBuilder {
        ExceptionResolverChainBuilder::default()
    }

    /// The accessors whose thread-local values are restored for
    /// context-aware resolvers.
    pub(crate) fn accessors(&self) -> &[Arc<dyn LocalValueAccessor>] {
        &self.accessors
    }

    /// Resolve `error` into the GraphQL errors to report for the field.
    ///
    /// An empty return means the failure was explicitly suppressed.
    pub async fn resolve(
        &self,
        error: &BoxError,
        environment: &FieldEnvironment,
    ) -> Vec<graphql::Error> {
        for resolver in &self.resolvers {
            let resolved = if resolver.wants_local_context() {
                // A context-aware resolver completes in a single poll, so
                // the restored values never outlive this thread's turn.
                let _guard = LocalValueGuard::restore(&self.accessors, &environment.context);
                resolver.resolve(error, environment).await
            } else {
                resolver.resolve(error, environment).await
            };

            if let Some(errors) = resolved {
                if errors.is_empty() {
                    tracing::debug!(path = %environment.path, "field error suppressed by resolver");
                } else {
                    tracing::debug!(
                        path = %environment.path,
                        "field error resolved into {} GraphQL error(s)",
                        errors.len(),
                    );
                }
                return errors;
            }
        }

        tracing::error!(path = %environment.path, "unresolved field error: {error}");
        vec![Self::fallback_error(error, environment)]
    }

    fn fallback_error(error: &BoxError, environment: &FieldEnvironment) -> graphql::Error {
        graphql::Error::builder()
            .message(error.to_string())
            .path(environment.path.clone())
            .locations(Vec::from_iter(environment.location.clone()))
            .error_type(ErrorType::InternalError)
            .build()
    }
}

/// Collects resolvers and accessors for an [`ExceptionResolverChain`].
#[derive(Default)]
pub struct ExceptionResolverChainBuilder {
    resolvers: Vec<Arc<dyn ExceptionResolver>>,
    accessors: Vec<Arc<dyn LocalValueAccessor>>,
}

impl ExceptionResolverChainBuilder {
    /// Append a resolver. Resolvers are consulted in the order they were
    /// added.
    pub fn resolver(mut self, resolver: impl ExceptionResolver) -> Self {
        self.resolvers.push(Arc::new(resolver));
        self
    }

    /// Register a thread-local accessor for context-aware resolvers.
    pub fn accessor(mut self, accessor: impl LocalValueAccessor + 'static) -> Self {
        self.accessors.push(Arc::new(accessor));
        self
    }

    pub fn build(self) -> ExceptionResolverChain {
        ExceptionResolverChain {
            resolvers: self.resolvers,
            accessors: self.accessors,
        }
    }
}
