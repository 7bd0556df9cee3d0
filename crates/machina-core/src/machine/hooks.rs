//! Lifecycle hooks.
//!
//! Each hook receives the value the engine is about to use and returns a
//! possibly replaced one. A [`HookChain`] applies hooks in registration
//! order. A failing hook is logged and skipped: the value it was handed is
//! passed on to the next hook unchanged.

use std::sync::Arc;

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("hook failed: {0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Error details handed to [`MachineHooks::on_error`].
#[derive(Debug, Clone, Copy)]
pub struct ErrorInfo<'a> {
    pub state: &'a str,
    pub error_type: &'a str,
    pub message: &'a str,
}

/// Observer callbacks with the option to replace what they observe.
///
/// Every method defaults to passing its value through.
pub trait MachineHooks: Send + Sync {
    fn on_machine_start(
        &self,
        _machine: &str,
        context: Map<String, Value>,
    ) -> Result<Map<String, Value>, HookError> {
        Ok(context)
    }

    fn on_machine_end(
        &self,
        _machine: &str,
        _context: &Map<String, Value>,
        output: Value,
    ) -> Result<Value, HookError> {
        Ok(output)
    }

    fn on_state_enter(
        &self,
        _state: &str,
        context: Map<String, Value>,
    ) -> Result<Map<String, Value>, HookError> {
        Ok(context)
    }

    fn on_state_exit(
        &self,
        _state: &str,
        _context: &Map<String, Value>,
        output: Value,
    ) -> Result<Value, HookError> {
        Ok(output)
    }

    /// May rewrite the transition target.
    fn on_transition(
        &self,
        _from: &str,
        to: String,
        _context: &Map<String, Value>,
    ) -> Result<String, HookError> {
        Ok(to)
    }

    /// May supply or override the recovery state. `None` means propagate.
    fn on_error(
        &self,
        _error: ErrorInfo<'_>,
        _context: &Map<String, Value>,
        recovery: Option<String>,
    ) -> Result<Option<String>, HookError> {
        Ok(recovery)
    }
}

/// Ordered hook list shared by an executor and its children.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn MachineHooks>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<H: MachineHooks + 'static>(&mut self, hook: H) {
        self.hooks.push(Arc::new(hook));
    }

    pub fn push_arc(&mut self, hook: Arc<dyn MachineHooks>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn machine_start(&self, machine: &str, context: Map<String, Value>) -> Map<String, Value> {
        self.fold("on_machine_start", context, |hook, ctx| {
            hook.on_machine_start(machine, ctx)
        })
    }

    pub fn machine_end(&self, machine: &str, context: &Map<String, Value>, output: Value) -> Value {
        self.fold("on_machine_end", output, |hook, out| {
            hook.on_machine_end(machine, context, out)
        })
    }

    pub fn state_enter(&self, state: &str, context: Map<String, Value>) -> Map<String, Value> {
        self.fold("on_state_enter", context, |hook, ctx| hook.on_state_enter(state, ctx))
    }

    pub fn state_exit(&self, state: &str, context: &Map<String, Value>, output: Value) -> Value {
        self.fold("on_state_exit", output, |hook, out| {
            hook.on_state_exit(state, context, out)
        })
    }

    pub fn transition(&self, from: &str, to: String, context: &Map<String, Value>) -> String {
        self.fold("on_transition", to, |hook, target| {
            hook.on_transition(from, target, context)
        })
    }

    pub fn error(
        &self,
        error: ErrorInfo<'_>,
        context: &Map<String, Value>,
        recovery: Option<String>,
    ) -> Option<String> {
        self.fold("on_error", recovery, |hook, current| {
            hook.on_error(error, context, current)
        })
    }

    fn fold<T: Clone>(
        &self,
        hook_name: &'static str,
        initial: T,
        mut apply: impl FnMut(&dyn MachineHooks, T) -> Result<T, HookError>,
    ) -> T {
        let mut value = initial;
        for (index, hook) in self.hooks.iter().enumerate() {
            match apply(hook.as_ref(), value.clone()) {
                Ok(next) => value = next,
                Err(err) => {
                    tracing::warn!(hook = hook_name, index, error = %err, "hook failed, skipping");
                }
            }
        }
        value
    }
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookChain")
            .field("len", &self.hooks.len())
            .finish()
    }
}
