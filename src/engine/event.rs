use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workplan::{NodeClassification, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Created,
    Running,
    Paused,
    Completed,
    Faulted,
    Aborted,
}

impl InstanceStatus {
    /// No further firing happens once an instance reaches one of these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Faulted | InstanceStatus::Aborted
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceStatus::Created => "Created",
            InstanceStatus::Running => "Running",
            InstanceStatus::Paused => "Paused",
            InstanceStatus::Completed => "Completed",
            InstanceStatus::Faulted => "Faulted",
            InstanceStatus::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// The terminal place an instance ended in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceOutcome {
    pub instance: Uuid,
    pub connector: NodeId,
    pub name: String,
    pub classification: NodeClassification,
    pub token: Uuid,
}

/// Progress notifications of an instance and its nested instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum InstanceEvent {
    TokenAdded {
        instance: Uuid,
        connector: NodeId,
        token: Uuid,
    },
    TokenRemoved {
        instance: Uuid,
        connector: NodeId,
        token: Uuid,
    },
    /// Tokens were produced by a step. Task and sub-workplan steps report
    /// this when their activity or nested instance finishes.
    TransitionFired {
        instance: Uuid,
        step: NodeId,
        consumed: usize,
        produced: usize,
    },
    ActivityStarted {
        instance: Uuid,
        step: NodeId,
        name: String,
        token: Uuid,
    },
    ActivityCompleted {
        instance: Uuid,
        step: NodeId,
        name: String,
        token: Uuid,
        output: usize,
    },
    Paused {
        instance: Uuid,
    },
    Resumed {
        instance: Uuid,
    },
    Completed {
        outcome: InstanceOutcome,
    },
    Faulted {
        instance: Uuid,
        error: String,
    },
    Aborted {
        instance: Uuid,
    },
}

impl InstanceEvent {
    pub fn instance(&self) -> Uuid {
        match self {
            InstanceEvent::TokenAdded { instance, .. }
            | InstanceEvent::TokenRemoved { instance, .. }
            | InstanceEvent::TransitionFired { instance, .. }
            | InstanceEvent::ActivityStarted { instance, .. }
            | InstanceEvent::ActivityCompleted { instance, .. }
            | InstanceEvent::Paused { instance }
            | InstanceEvent::Resumed { instance }
            | InstanceEvent::Faulted { instance, .. }
            | InstanceEvent::Aborted { instance } => *instance,
            InstanceEvent::Completed { outcome } => outcome.instance,
        }
    }
}
