//! Non-LLM task execution: native functions and HTTP calls.
//!
//! Function tasks dispatch through a [`FunctionRegistry`] populated by
//! the embedding application at startup. API-call tasks go through the
//! [`HttpCaller`] seam; the reqwest-backed implementation lives in the
//! infra crate.
//!
//! Both receive the same payload shape: a JSON object of the run's
//! context bindings, plus a `feedback` key on retry attempts.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use stagegate_types::error::TaskError;

// ---------------------------------------------------------------------------
// Native functions
// ---------------------------------------------------------------------------

/// A named native task, registered under a handler name that workflow
/// definitions reference via `type: function`.
pub trait NativeFunction: Send + Sync {
    fn call(
        &self,
        payload: serde_json::Value,
    ) -> impl std::future::Future<Output = Result<String, TaskError>> + Send;
}

/// Object-safe version of [`NativeFunction`] with boxed futures.
pub trait NativeFunctionDyn: Send + Sync {
    fn call_boxed(
        &self,
        payload: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<String, TaskError>> + Send + '_>>;
}

impl<T: NativeFunction> NativeFunctionDyn for T {
    fn call_boxed(
        &self,
        payload: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<String, TaskError>> + Send + '_>> {
        Box::pin(self.call(payload))
    }
}

/// Adapter for plain synchronous closures.
struct SyncFunction<F>(F);

impl<F> NativeFunction for SyncFunction<F>
where
    F: Fn(serde_json::Value) -> Result<String, TaskError> + Send + Sync,
{
    fn call(
        &self,
        payload: serde_json::Value,
    ) -> impl std::future::Future<Output = Result<String, TaskError>> + Send {
        std::future::ready((self.0)(payload))
    }
}

/// Registry of native functions, keyed by handler name.
///
/// Built once at startup and shared immutably with the engine.
#[derive(Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Arc<dyn NativeFunctionDyn + Send + Sync>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async function under `name`. Replaces any previous
    /// registration with the same name.
    pub fn register<F: NativeFunction + 'static>(&mut self, name: impl Into<String>, function: F) {
        self.handlers.insert(name.into(), Arc::new(function));
    }

    /// Register a plain synchronous closure under `name`.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(serde_json::Value) -> Result<String, TaskError> + Send + Sync + 'static,
    {
        self.register(name, SyncFunction(function));
    }

    /// Invoke a registered function by name.
    pub async fn invoke(&self, name: &str, payload: serde_json::Value) -> Result<String, TaskError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| TaskError::NotRegistered(name.to_string()))?;
        handler.call_boxed(payload).await
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names, unordered.
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// HTTP tasks
// ---------------------------------------------------------------------------

/// Transport for `type: api_call` tasks.
pub trait HttpCaller: Send + Sync {
    /// Send `payload` to `endpoint` and return the response body.
    fn call(
        &self,
        method: &str,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> impl std::future::Future<Output = Result<String, TaskError>> + Send;
}

/// Object-safe version of [`HttpCaller`] with boxed futures.
pub trait HttpCallerDyn: Send + Sync {
    fn call_boxed<'a>(
        &'a self,
        method: &'a str,
        endpoint: &'a str,
        payload: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<String, TaskError>> + Send + 'a>>;
}

impl<T: HttpCaller> HttpCallerDyn for T {
    fn call_boxed<'a>(
        &'a self,
        method: &'a str,
        endpoint: &'a str,
        payload: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<String, TaskError>> + Send + 'a>> {
        Box::pin(self.call(method, endpoint, payload))
    }
}

/// Type-erased HTTP caller.
pub struct BoxHttpCaller {
    inner: Box<dyn HttpCallerDyn + Send + Sync>,
}

impl BoxHttpCaller {
    pub fn new<T: HttpCaller + 'static>(caller: T) -> Self {
        Self {
            inner: Box::new(caller),
        }
    }

    pub async fn call(
        &self,
        method: &str,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<String, TaskError> {
        self.inner.call_boxed(method, endpoint, payload).await
    }
}

impl HttpCaller for BoxHttpCaller {
    async fn call(
        &self,
        method: &str,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<String, TaskError> {
        BoxHttpCaller::call(self, method, endpoint, payload).await
    }
}
