//! Event types for the Strata process event bus.
//!
//! `ProcessEvent` is broadcast by the engine on every lifecycle transition.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};

use crate::node::NodeId;
use crate::process::{ProcessKind, ProcessStatus};

/// Events emitted while processes execute.
///
/// The daemon listens for `Submitted` and `Sealed` to schedule resumption;
/// everything else is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    /// A process record was created.
    Created {
        process_id: NodeId,
        kind: ProcessKind,
        label: String,
        caller: Option<NodeId>,
    },

    /// A chain step handler is about to run.
    StepStarted {
        process_id: NodeId,
        step: String,
        index: usize,
    },

    /// A chain step handler returned and its context was checkpointed.
    StepCompleted {
        process_id: NodeId,
        step: String,
        index: usize,
        duration_ms: u64,
    },

    /// A chain suspended on futures.
    Waiting {
        process_id: NodeId,
        awaiting: Vec<NodeId>,
    },

    /// A process was handed to the scheduler for continuation.
    Submitted { process_id: NodeId },

    /// A process reached a terminal status.
    Sealed {
        process_id: NodeId,
        status: ProcessStatus,
    },
}

impl ProcessEvent {
    pub fn process_id(&self) -> NodeId {
        match self {
            ProcessEvent::Created { process_id, .. }
            | ProcessEvent::StepStarted { process_id, .. }
            | ProcessEvent::StepCompleted { process_id, .. }
            | ProcessEvent::Waiting { process_id, .. }
            | ProcessEvent::Submitted { process_id }
            | ProcessEvent::Sealed { process_id, .. } => *process_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_type_tag() {
        let id = NodeId::new();
        let event = ProcessEvent::Sealed {
            process_id: id,
            status: ProcessStatus::Finished,
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], json!("sealed"));
        assert_eq!(v["status"], json!("finished"));
        assert_eq!(event.process_id(), id);
    }
}
