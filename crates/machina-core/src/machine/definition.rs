//! Workflow definition loading, validation, and child-machine lookup.
//!
//! The engine consumes an already-parsed `WorkflowDefinition`; the YAML and
//! JSON entry points here are thin serde wrappers that validate before
//! returning.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use machina_types::machine::{MachineRef, StrategyConfig, WorkflowDefinition};
use thiserror::Error;

use super::expression::{ExpressionError, parse_condition};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("machine '{machine}' has no initial state")]
    NoInitialState { machine: String },

    #[error("machine '{machine}' has multiple initial states: {states:?}")]
    MultipleInitialStates { machine: String, states: Vec<String> },

    #[error("state '{state}' in machine '{machine}' references unknown state '{target}'")]
    UnknownState {
        machine: String,
        state: String,
        target: String,
    },

    #[error("state '{state}' references unknown machine '{reference}'")]
    UnknownMachine { state: String, reference: String },

    #[error("invalid condition {condition:?} in state '{state}': {source}")]
    InvalidCondition {
        state: String,
        condition: String,
        source: ExpressionError,
    },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a YAML workflow definition.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse and validate a JSON workflow definition.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Load a definition from disk. `.json` files parse as JSON, everything else
/// as YAML.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

// ---------------------------------------------------------------------------
// Machine registry
// ---------------------------------------------------------------------------

/// Every machine reachable from a root definition, keyed by name.
///
/// Nested `machines` maps are flattened so a reference resolves the same way
/// at any depth. The root is registered under its own name, which makes
/// self-reference work.
#[derive(Debug, Clone, Default)]
pub struct MachineRegistry {
    machines: HashMap<String, Arc<WorkflowDefinition>>,
}

impl MachineRegistry {
    pub fn from_root(root: &WorkflowDefinition) -> Result<Self, DefinitionError> {
        let mut registry = Self::default();
        registry.register(root)?;
        Ok(registry)
    }

    fn register(&mut self, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
        if self.machines.contains_key(&def.name) {
            return Err(DefinitionError::ValidationError(format!(
                "duplicate machine name '{}'",
                def.name
            )));
        }
        self.machines.insert(def.name.clone(), Arc::new(def.clone()));

        for (key, child) in &def.machines {
            if key != &child.name {
                return Err(DefinitionError::ValidationError(format!(
                    "machine registered as '{key}' is named '{}'",
                    child.name
                )));
            }
            self.register(child)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.machines.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.machines.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// The single explicitly marked initial state.
pub fn initial_state(def: &WorkflowDefinition) -> Result<&str, DefinitionError> {
    let initial = def.initial_states();
    match initial.as_slice() {
        [one] => Ok(one),
        [] => Err(DefinitionError::NoInitialState {
            machine: def.name.clone(),
        }),
        many => Err(DefinitionError::MultipleInitialStates {
            machine: def.name.clone(),
            states: many.iter().map(|s| s.to_string()).collect(),
        }),
    }
}

/// Validate a definition and every machine nested in it.
///
/// Checks:
/// - Names are non-empty and nested machine names are unique
/// - Exactly one `initial` state per machine
/// - At most one of `agent`, `action`, `machine`, `launch` per state
/// - `foreach`, `key` and `mode` only appear with `machine`
/// - Non-final states have at least one transition
/// - Transition and `on_error` targets exist
/// - `machine` / `launch` references resolve
/// - Conditions parse
/// - Timeouts and strategy parameters are in range
pub fn validate_definition(def: &WorkflowDefinition) -> Result<MachineRegistry, DefinitionError> {
    let registry = MachineRegistry::from_root(def)?;
    for machine in registry.machines.values() {
        validate_machine(machine, &registry)?;
    }
    Ok(registry)
}

fn validate_machine(
    def: &WorkflowDefinition,
    registry: &MachineRegistry,
) -> Result<(), DefinitionError> {
    if def.name.trim().is_empty() {
        return Err(DefinitionError::ValidationError(
            "machine name must not be empty".to_string(),
        ));
    }
    if def.states.is_empty() {
        return Err(DefinitionError::ValidationError(format!(
            "machine '{}' must have at least one state",
            def.name
        )));
    }
    initial_state(def)?;

    let unknown_state = |state: &str, target: &str| DefinitionError::UnknownState {
        machine: def.name.clone(),
        state: state.to_string(),
        target: target.to_string(),
    };

    for (name, state) in &def.states {
        let work_count = [
            state.agent.is_some(),
            state.action.is_some(),
            state.machine.is_some(),
            state.launch.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count();
        if work_count > 1 {
            return Err(DefinitionError::ValidationError(format!(
                "state '{name}' declares more than one of agent, action, machine, launch"
            )));
        }

        if state.machine.is_none() {
            for (field, present) in [
                ("foreach", state.foreach.is_some()),
                ("key", state.key.is_some()),
                ("mode", state.mode.is_some()),
            ] {
                if present {
                    return Err(DefinitionError::ValidationError(format!(
                        "state '{name}' uses '{field}' without 'machine'"
                    )));
                }
            }
        }
        if state.key.is_some() && state.foreach.is_none() {
            return Err(DefinitionError::ValidationError(format!(
                "state '{name}' uses 'key' without 'foreach'"
            )));
        }

        if state.foreach.is_some() && state.machine.as_ref().is_some_and(MachineRef::is_many) {
            return Err(DefinitionError::ValidationError(format!(
                "state '{name}' uses 'foreach' with more than one machine"
            )));
        }

        if !state.is_final() && state.transitions.is_empty() {
            return Err(DefinitionError::ValidationError(format!(
                "non-final state '{name}' has no transitions"
            )));
        }

        for transition in &state.transitions {
            if !def.states.contains_key(&transition.to) {
                return Err(unknown_state(name, &transition.to));
            }
            if let Some(condition) = &transition.condition {
                parse_condition(condition).map_err(|source| DefinitionError::InvalidCondition {
                    state: name.clone(),
                    condition: condition.clone(),
                    source,
                })?;
            }
        }

        if let Some(on_error) = &state.on_error {
            for target in on_error.targets() {
                if !def.states.contains_key(target) {
                    return Err(unknown_state(name, target));
                }
            }
        }

        for reference in state.machine.iter().chain(state.launch.iter()) {
            for child in reference.names() {
                if !registry.contains(child) {
                    return Err(DefinitionError::UnknownMachine {
                        state: name.clone(),
                        reference: child.to_string(),
                    });
                }
            }
        }

        if let Some(timeout) = state.timeout {
            if !(timeout > 0.0 && Duration::try_from_secs_f64(timeout).is_ok()) {
                return Err(DefinitionError::ValidationError(format!(
                    "state '{name}' timeout must be a positive, representable number of seconds"
                )));
            }
        }

        if let Some(strategy) = &state.execution {
            validate_strategy(name, strategy)?;
        }
    }

    Ok(())
}

fn validate_strategy(state: &str, strategy: &StrategyConfig) -> Result<(), DefinitionError> {
    let problem = match strategy {
        StrategyConfig::Default => None,
        StrategyConfig::Retry { backoffs, jitter } => {
            if !(0.0..=1.0).contains(jitter) {
                Some("retry jitter must be between 0 and 1")
            } else if backoffs.iter().any(|b| {
                *b < 0.0 || Duration::try_from_secs_f64(b * (1.0 + jitter)).is_err()
            }) {
                Some("retry backoffs must be non-negative and representable as a duration")
            } else {
                None
            }
        }
        StrategyConfig::Parallel { n_samples } => {
            (*n_samples == 0).then_some("parallel n_samples must be at least 1")
        }
        StrategyConfig::QuorumVote {
            k_margin,
            max_candidates,
        } => {
            if *k_margin == 0 {
                Some("quorum_vote k_margin must be at least 1")
            } else if *max_candidates == 0 {
                Some("quorum_vote max_candidates must be at least 1")
            } else {
                None
            }
        }
    };

    match problem {
        Some(message) => Err(DefinitionError::ValidationError(format!(
            "state '{state}': {message}"
        ))),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
