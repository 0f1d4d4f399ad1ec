//! Provide a [`Context`] for one GraphQL request.
//!
//! Interceptors, transports and resolvers all accept the [`Context`] of the
//! request being processed, and this contains a DashMap which allows
//! additional data to be passed back and forth along the invocation
//! pipeline.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json_bytes::Value;
use tower::BoxError;

/// Holds [`Context`] entries.
type Entries = Arc<DashMap<String, Value>>;

/// Context for one GraphQL request.
///
/// A context is created when a request is built and travels with it through
/// the interceptor chain, the transport and (for in-process execution) the
/// resolvers. Cloning is shallow: every clone shares the same entries, so a
/// value inserted by an interceptor on the way in is visible on the way out.
#[derive(Clone, Debug, Default)]
pub struct Context {
    entries: Entries,
}

impl Context {
    pub fn new() -> Self {
        Context {
            entries: Default::default(),
        }
    }

    /// Get a deserialized value from the context by key.
    pub fn get<K, V>(&self, key: K) -> Result<Option<V>, BoxError>
    where
        K: Into<String>,
        V: for<'de> serde::Deserialize<'de>,
    {
        self.entries
            .get(&key.into())
            .map(|v| serde_json_bytes::from_value(v.value().clone()))
            .transpose()
            .map_err(|e| e.into())
    }

    /// Insert a serializable value, returning the previous value for the key
    /// if there was one.
    pub fn insert<K, V>(&self, key: K, value: V) -> Result<Option<V>, BoxError>
    where
        K: Into<String>,
        V: for<'de> serde::Deserialize<'de> + Serialize,
    {
        match serde_json_bytes::to_value(value) {
            Ok(value) => self
                .entries
                .insert(key.into(), value)
                .map(serde_json_bytes::from_value)
                .transpose()
                .map_err(|e| e.into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Update the value for a key with `upsert`, inserting `default` first
    /// if the key is absent.
    pub fn upsert<K, V>(
        &self,
        key: K,
        upsert: impl Fn(V) -> V,
        default: impl Fn() -> V,
    ) -> Result<(), BoxError>
    where
        K: Into<String>,
        V: for<'de> serde::Deserialize<'de> + Serialize,
    {
        let key = key.into();
        self.entries
            .entry(key.clone())
            .or_try_insert_with(|| serde_json_bytes::to_value((default)()))?;
        let mut result = Ok(());
        self.entries
            .alter(&key, |_, v| match serde_json_bytes::from_value(v.clone()) {
                Ok(value) => match serde_json_bytes::to_value((upsert)(value)) {
                    Ok(value) => value,
                    Err(e) => {
                        result = Err(e);
                        v
                    }
                },
                Err(e) => {
                    result = Err(e);
                    v
                }
            });
        result.map_err(|e| e.into())
    }

    /// Get the raw JSON value for a key, without deserializing.
    pub fn get_json_value(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    /// Insert a raw JSON value, returning the previous value for the key if
    /// there was one.
    pub fn insert_json_value(&self, key: &str, value: Value) -> Option<Value> {
        self.entries.insert(key.to_string(), value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Snapshot the values currently held by the given thread-local
    /// accessors into this context.
    ///
    /// Must run on the thread that owns the values, before the request first
    /// moves to another task or thread.
    pub fn extract_locals(&self, accessors: &[Arc<dyn LocalValueAccessor>]) {
        for accessor in accessors {
            if let Some(value) = accessor.extract() {
                self.entries.insert(accessor.key().to_string(), value);
            }
        }
    }
}

/// Bridge between `thread_local!` state and the per-request [`Context`].
///
/// Codebases that keep ambient request data in thread-locals (a current
/// user, a tenant, a locale) lose it as soon as execution hops to another
/// task or thread. An accessor describes one such value: it is snapshotted
/// into the context when the request is submitted
/// ([`Context::extract_locals`]) and re-materialized on whichever thread
/// later runs a resolver ([`LocalValueGuard::restore`]).
pub trait LocalValueAccessor: Send + Sync {
    /// The context key the value travels under.
    fn key(&self) -> &str;

    /// Read the value from the current thread, if set.
    fn extract(&self) -> Option<Value>;

    /// Install the value on the current thread.
    fn restore(&self, value: &Value);

    /// Remove the value from the current thread.
    fn clear(&self);
}

/// Materializes context values as thread-locals for the duration of one
/// resolver invocation.
///
/// Dropping the guard clears every value it restored, leaving the thread as
/// it was found. The guard must not be held across an `.await`: the
/// continuation may resume on a different thread, stranding the values on
/// this one.
#[must_use = "thread-local values are cleared as soon as the guard is dropped"]
pub struct LocalValueGuard {
    restored: Vec<Arc<dyn LocalValueAccessor>>,
}

impl LocalValueGuard {
    /// Install every accessor value present in `context` on the current
    /// thread.
    pub fn restore(accessors: &[Arc<dyn LocalValueAccessor>], context: &Context) -> Self {
        let mut restored = Vec::new();
        for accessor in accessors {
            if let Some(value) = context.get_json_value(accessor.key()) {
                accessor.restore(&value);
                restored.push(Arc::clone(accessor));
            }
        }
        LocalValueGuard { restored }
    }
}

impl Drop for LocalValueGuard {
    fn drop(&mut self) {
        for accessor in &self.restored {
            accessor.clear();
        }
    }
}
