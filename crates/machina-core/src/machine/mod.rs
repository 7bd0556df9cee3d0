//! The state-machine engine: definitions, expressions, templates, hooks,
//! strategies, and the executor that ties them together.

pub mod context;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod hooks;
pub mod strategy;
pub mod template;

pub use context::ExecutionContext;
pub use definition::{
    DefinitionError, MachineRegistry, load_workflow_file, parse_workflow_json,
    parse_workflow_yaml, validate_definition,
};
pub use executor::{MachineError, MachineExecutor, MachineExecutorBuilder};
pub use expression::{ConditionEvaluator, EvalValue, ExpressionError};
pub use hooks::{ErrorInfo, HookChain, HookError, MachineHooks};
pub use strategy::ExecutionStrategy;
pub use template::{JinjaRenderer, TemplateError, TemplateRenderer};
