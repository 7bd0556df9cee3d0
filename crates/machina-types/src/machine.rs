//! Workflow definition types for Machina.
//!
//! A `WorkflowDefinition` is the parsed, immutable description of a state
//! machine: named states, the unit of work each one dispatches, guarded
//! transitions, error routing, and engine settings. It is loaded once and
//! shared read-only by the executor that owns it and every child executor
//! it spawns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Machine name. Child references equal to this name resolve to itself.
    pub name: String,
    /// Definition version recorded in every snapshot.
    #[serde(default = "default_version")]
    pub version: String,
    /// Initial context template. Values may be templates over `input`.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// State name -> state definition.
    pub states: BTreeMap<String, StateDefinition>,
    /// Child machine definitions addressable from `machine` / `launch`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machines: BTreeMap<String, WorkflowDefinition>,
    /// Engine settings.
    #[serde(default)]
    pub settings: MachineSettings,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a state by name.
    pub fn state(&self, name: &str) -> Option<&StateDefinition> {
        self.states.get(name)
    }

    /// Names of all states explicitly marked `initial`.
    pub fn initial_states(&self) -> Vec<&str> {
        self.states
            .iter()
            .filter(|(_, s)| s.kind == StateKind::Initial)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Whether checkpointing is enabled for the given event.
    pub fn checkpoints_on(&self, event: CheckpointEvent) -> bool {
        self.settings.checkpoint_events.contains(&event)
    }
}

/// Engine settings carried by a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSettings {
    /// Maximum number of steps before execution is aborted. Unset falls
    /// back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,
    /// Events at which a snapshot is written. Empty disables checkpointing.
    #[serde(default = "default_checkpoint_events")]
    pub checkpoint_events: Vec<CheckpointEvent>,
    /// URI scheme used for result channel addresses.
    #[serde(default = "default_result_scheme")]
    pub result_scheme: String,
}

fn default_checkpoint_events() -> Vec<CheckpointEvent> {
    vec![
        CheckpointEvent::MachineStart,
        CheckpointEvent::Execute,
        CheckpointEvent::MachineEnd,
    ]
}

fn default_result_scheme() -> String {
    "machina".to_string()
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            max_steps: None,
            checkpoint_events: default_checkpoint_events(),
            result_scheme: default_result_scheme(),
        }
    }
}

/// Lifecycle points at which a snapshot may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointEvent {
    MachineStart,
    Execute,
    MachineEnd,
    /// Best-effort snapshot written when execution fails.
    Error,
}

// ---------------------------------------------------------------------------
// State Definition
// ---------------------------------------------------------------------------

/// A single named state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDefinition {
    #[serde(rename = "type", default)]
    pub kind: StateKind,
    /// Unit-of-work reference handed to the invoker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Custom action name handed to the action runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Child machine(s) to invoke and wait for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<MachineRef>,
    /// Child machine(s) to launch without waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch: Option<MachineRef>,
    /// Input template rendered against the context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Context key -> template over `context`, `input` and `output`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_to_context: Option<Map<String, Value>>,
    /// Output template for final states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Execution strategy wrapped around `agent` calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<StrategyConfig>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
    /// Template producing the list to fan out over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<String>,
    /// Variable name bound to each `foreach` item.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub item_var: Option<String>,
    /// Template producing the result map key for each `foreach` item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<FanOutMode>,
    /// Wait timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl StateDefinition {
    pub fn is_final(&self) -> bool {
        self.kind == StateKind::Final
    }
}

/// The role of a state in the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    #[default]
    Normal,
    Initial,
    Final,
}

/// One child machine reference or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MachineRef {
    One(String),
    Many(Vec<String>),
}

impl MachineRef {
    /// Flatten into a list of machine names.
    pub fn names(&self) -> Vec<&str> {
        match self {
            MachineRef::One(name) => vec![name.as_str()],
            MachineRef::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_many(&self) -> bool {
        matches!(self, MachineRef::Many(_))
    }
}

/// How a multi-child fan-out completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutMode {
    /// Wait for every child.
    #[default]
    Settled,
    /// Take the first child that completes.
    Any,
}

/// A guarded edge to another state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Guard expression. Absent means always.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub to: String,
}

/// Error routing for a state.
///
/// ```yaml
/// on_error: recover                # unconditional
/// on_error:                        # by error type
///   TimeoutExceeded: slow_path
///   default: recover
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OnError {
    Target(String),
    ByType(BTreeMap<String, String>),
}

impl OnError {
    /// Resolve the recovery state for an error type.
    pub fn route(&self, error_type: &str) -> Option<&str> {
        match self {
            OnError::Target(state) => Some(state.as_str()),
            OnError::ByType(map) => map
                .get(error_type)
                .or_else(|| map.get("default"))
                .map(String::as_str),
        }
    }

    /// Every state name this routing table can produce.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            OnError::Target(state) => vec![state.as_str()],
            OnError::ByType(map) => map.values().map(String::as_str).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution Strategy Configuration
// ---------------------------------------------------------------------------

/// Policy wrapped around a single unit-of-work invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    Default,
    Retry {
        /// Seconds to sleep after each failed attempt.
        #[serde(default = "default_backoffs")]
        backoffs: Vec<f64>,
        /// Fractional jitter applied to each backoff.
        #[serde(default = "default_jitter")]
        jitter: f64,
    },
    Parallel {
        #[serde(default = "default_n_samples")]
        n_samples: usize,
    },
    QuorumVote {
        #[serde(default = "default_k_margin")]
        k_margin: usize,
        #[serde(default = "default_max_candidates")]
        max_candidates: usize,
    },
}

fn default_backoffs() -> Vec<f64> {
    vec![2.0, 8.0, 16.0, 35.0]
}

fn default_jitter() -> f64 {
    0.1
}

fn default_n_samples() -> usize {
    3
}

fn default_k_margin() -> usize {
    3
}

fn default_max_candidates() -> usize {
    10
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_defaults_to_normal() {
        let state: StateDefinition = serde_yaml_ng::from_str("transitions: []").unwrap();
        assert_eq!(state.kind, StateKind::Normal);
        assert!(state.agent.is_none());
    }

    #[test]
    fn test_machine_ref_one_and_many() {
        let one: MachineRef = serde_yaml_ng::from_str("child").unwrap();
        assert_eq!(one.names(), vec!["child"]);
        assert!(!one.is_many());

        let many: MachineRef = serde_yaml_ng::from_str("[a, b, c]").unwrap();
        assert_eq!(many.names(), vec!["a", "b", "c"]);
        assert!(many.is_many());
    }

    #[test]
    fn test_on_error_target() {
        let on_error: OnError = serde_yaml_ng::from_str("recover").unwrap();
        assert_eq!(on_error.route("anything"), Some("recover"));
    }

    #[test]
    fn test_on_error_by_type_with_default() {
        let yaml = "TimeoutExceeded: slow\ndefault: recover";
        let on_error: OnError = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(on_error.route("TimeoutExceeded"), Some("slow"));
        assert_eq!(on_error.route("ValueError"), Some("recover"));
    }

    #[test]
    fn test_on_error_by_type_without_default() {
        let on_error: OnError = serde_yaml_ng::from_str("RateLimit: wait").unwrap();
        assert_eq!(on_error.route("Other"), None);
    }

    #[test]
    fn test_retry_strategy_defaults() {
        let config: StrategyConfig = serde_yaml_ng::from_str("type: retry").unwrap();
        assert_eq!(
            config,
            StrategyConfig::Retry {
                backoffs: vec![2.0, 8.0, 16.0, 35.0],
                jitter: 0.1,
            }
        );
    }

    #[test]
    fn test_quorum_vote_strategy() {
        let yaml = "type: quorum_vote\nk_margin: 2\nmax_candidates: 5";
        let config: StrategyConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(
            config,
            StrategyConfig::QuorumVote {
                k_margin: 2,
                max_candidates: 5,
            }
        );
    }

    #[test]
    fn test_settings_defaults() {
        let settings = MachineSettings::default();
        assert_eq!(settings.max_steps, None);
        assert_eq!(settings.checkpoint_events.len(), 3);
        assert_eq!(settings.result_scheme, "machina");
    }

    #[test]
    fn test_definition_with_foreach_alias() {
        let yaml = r#"
name: fan
states:
  start:
    type: initial
    machine: worker
    foreach: "{{ context.items }}"
    as: entry
    key: "{{ entry.id }}"
    mode: any
    timeout: 2.5
    transitions:
      - to: done
  done:
    type: final
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        let start = def.state("start").unwrap();
        assert_eq!(start.item_var.as_deref(), Some("entry"));
        assert_eq!(start.mode, Some(FanOutMode::Any));
        assert_eq!(start.timeout, Some(2.5));
        assert_eq!(def.initial_states(), vec!["start"]);
        assert!(def.state("done").unwrap().is_final());
        assert!(def.checkpoints_on(CheckpointEvent::Execute));
    }
}
