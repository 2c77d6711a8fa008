//! Persisted chain context: named entries that are either resolved values or
//! placeholders for futures that have not completed yet.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::node::{NodeId, Outputs};
use crate::process::ErrorInfo;

/// One entry of a chain context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ContextEntry {
    Resolved { value: ContextValue },
    /// Waiting on the process with this id.
    Pending { process_id: NodeId },
}

impl ContextEntry {
    pub fn is_pending(&self) -> bool {
        matches!(self, ContextEntry::Pending { .. })
    }

    pub fn pending_process(&self) -> Option<NodeId> {
        match self {
            ContextEntry::Pending { process_id } => Some(*process_id),
            ContextEntry::Resolved { .. } => None,
        }
    }

    pub fn resolved(&self) -> Option<&ContextValue> {
        match self {
            ContextEntry::Resolved { value } => Some(value),
            ContextEntry::Pending { .. } => None,
        }
    }
}

/// A resolved context value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextValue {
    /// Plain value written by a step.
    Json { value: serde_json::Value },
    /// Reference to an existing data node.
    Node { id: NodeId },
    /// Result set of a finished future.
    Outputs { process_id: NodeId, outputs: Outputs },
    /// A future that failed, kept only under a tolerant wait.
    Failed { process_id: NodeId, error: ErrorInfo },
}

/// Mapping from name to context entry. `BTreeMap` keeps checkpoints stable.
pub type ProcessContext = BTreeMap<String, ContextEntry>;
