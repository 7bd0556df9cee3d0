//! Collaborator traits for the work a state dispatches.
//!
//! The engine never looks inside a unit of work. It hands a reference and a
//! rendered input to a [`UnitOfWorkInvoker`] (an external model or service
//! call) or a context snapshot to an [`ActionRunner`] (custom imperative
//! step), and maps whatever comes back.
//!
//! Both traits use RPITIT and so are not object-safe. [`BoxInvoker`] and
//! [`BoxActionRunner`] provide type-erased handles via the usual
//! `*Dyn` blanket-impl pattern so an executor tree can share one
//! collaborator behind an `Arc`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// WorkError
// ---------------------------------------------------------------------------

/// A failure reported by a collaborator.
///
/// `kind` is the error-type name used for `on_error` routing and recorded as
/// `context.last_error_type`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WorkError {
    pub kind: String,
    pub message: String,
}

impl WorkError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Collaborator not wired into the executor.
    pub fn not_configured(what: &str) -> Self {
        Self::new("NotConfigured", format!("no {what} configured"))
    }
}

// ---------------------------------------------------------------------------
// UnitOfWorkInvoker
// ---------------------------------------------------------------------------

/// Invokes an opaque unit of work (`agent:` reference) with a rendered input.
pub trait UnitOfWorkInvoker: Send + Sync {
    fn invoke(
        &self,
        reference: &str,
        input: &Value,
    ) -> impl Future<Output = Result<Value, WorkError>> + Send;
}

/// Object-safe version of [`UnitOfWorkInvoker`].
pub trait UnitOfWorkInvokerDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        reference: &'a str,
        input: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, WorkError>> + Send + 'a>>;
}

impl<T: UnitOfWorkInvoker> UnitOfWorkInvokerDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        reference: &'a str,
        input: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, WorkError>> + Send + 'a>> {
        Box::pin(self.invoke(reference, input))
    }
}

/// Type-erased, cheaply clonable invoker shared across an executor tree.
#[derive(Clone)]
pub struct BoxInvoker {
    inner: Arc<dyn UnitOfWorkInvokerDyn>,
}

impl BoxInvoker {
    pub fn new<T: UnitOfWorkInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Arc::new(invoker),
        }
    }

    pub async fn invoke(&self, reference: &str, input: &Value) -> Result<Value, WorkError> {
        self.inner.invoke_boxed(reference, input).await
    }
}

impl Default for BoxInvoker {
    fn default() -> Self {
        Self::new(UnconfiguredInvoker)
    }
}

/// Fails every call. Installed when no invoker is supplied.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredInvoker;

impl UnitOfWorkInvoker for UnconfiguredInvoker {
    async fn invoke(&self, _reference: &str, _input: &Value) -> Result<Value, WorkError> {
        Err(WorkError::not_configured("unit-of-work invoker"))
    }
}

// ---------------------------------------------------------------------------
// ActionRunner
// ---------------------------------------------------------------------------

/// Runs a named custom action against the current context.
///
/// The returned map is a patch: its keys are merged into the context and the
/// patch itself becomes the state's output.
pub trait ActionRunner: Send + Sync {
    fn run(
        &self,
        action: &str,
        context: &Map<String, Value>,
    ) -> impl Future<Output = Result<Map<String, Value>, WorkError>> + Send;
}

/// Object-safe version of [`ActionRunner`].
pub trait ActionRunnerDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        action: &'a str,
        context: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Map<String, Value>, WorkError>> + Send + 'a>>;
}

impl<T: ActionRunner> ActionRunnerDyn for T {
    fn run_boxed<'a>(
        &'a self,
        action: &'a str,
        context: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Map<String, Value>, WorkError>> + Send + 'a>> {
        Box::pin(self.run(action, context))
    }
}

#[derive(Clone)]
pub struct BoxActionRunner {
    inner: Arc<dyn ActionRunnerDyn>,
}

impl BoxActionRunner {
    pub fn new<T: ActionRunner + 'static>(runner: T) -> Self {
        Self {
            inner: Arc::new(runner),
        }
    }

    pub async fn run(
        &self,
        action: &str,
        context: &Map<String, Value>,
    ) -> Result<Map<String, Value>, WorkError> {
        self.inner.run_boxed(action, context).await
    }
}

impl Default for BoxActionRunner {
    fn default() -> Self {
        Self::new(UnconfiguredActionRunner)
    }
}

/// Fails every call. Installed when no action runner is supplied.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredActionRunner;

impl ActionRunner for UnconfiguredActionRunner {
    async fn run(
        &self,
        _action: &str,
        _context: &Map<String, Value>,
    ) -> Result<Map<String, Value>, WorkError> {
        Err(WorkError::not_configured("action runner"))
    }
}
