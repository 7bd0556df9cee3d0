//! Point-in-time captures of a running machine.
//!
//! A `MachineSnapshot` is everything needed to resume an execution instance
//! without the caller's original input: current state, step counter, full
//! context, and the child launches that were still in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::machine::CheckpointEvent;

/// Serializable capture of one execution instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub execution_id: String,
    pub machine_name: String,
    pub machine_version: String,
    pub current_state: String,
    pub step: u64,
    /// The lifecycle point that produced this snapshot.
    pub event: CheckpointEvent,
    pub context: Map<String, Value>,
    /// Rendered machine output, present once the machine reached a final state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    #[serde(default)]
    pub pending_launches: Vec<PendingLaunch>,
    pub created_at: DateTime<Utc>,
}

impl MachineSnapshot {
    /// Whether this snapshot records a completed machine.
    pub fn is_complete(&self) -> bool {
        self.event == CheckpointEvent::MachineEnd && self.output.is_some()
    }
}

/// A child execution spawned by a state and not yet confirmed complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingLaunch {
    pub execution_id: String,
    /// Child machine reference.
    pub machine: String,
    /// Rendered input handed to the child.
    pub input: Value,
    /// Set once the child task has been started.
    #[serde(default)]
    pub launched: bool,
}

impl PendingLaunch {
    pub fn new(execution_id: String, machine: String, input: Value) -> Self {
        Self {
            execution_id,
            machine,
            input,
            launched: false,
        }
    }
}
