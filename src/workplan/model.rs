use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::{OutputClassification, OutputDescription, Step, StepKind};
use crate::error::WorkplanError;

/// Identifier of a connector or step, unique within one workplan.
pub type NodeId = u32;

/// Role of a connector in the process graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeClassification {
    #[default]
    Intermediate,
    Start,
    End,
    Failed,
    /// Custom exit besides `End` and `Failed`.
    Exit,
}

impl NodeClassification {
    /// Reaching a connector of this class terminates the instance.
    pub fn is_exit(self) -> bool {
        matches!(
            self,
            NodeClassification::End | NodeClassification::Failed | NodeClassification::Exit
        )
    }
}

impl fmt::Display for NodeClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeClassification::Intermediate => write!(f, "INTERMEDIATE"),
            NodeClassification::Start => write!(f, "START"),
            NodeClassification::End => write!(f, "END"),
            NodeClassification::Failed => write!(f, "FAILED"),
            NodeClassification::Exit => write!(f, "EXIT"),
        }
    }
}

/// A place definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub classification: NodeClassification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkplanState {
    #[default]
    New,
    Released,
}

/// Process graph definition. Built additively, then frozen with
/// [`release`](Workplan::release).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workplan {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    state: WorkplanState,
    #[serde(default)]
    connectors: Vec<Connector>,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    next_id: NodeId,
}

fn default_version() -> u32 {
    1
}

impl Workplan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: default_version(),
            state: WorkplanState::New,
            connectors: Vec::new(),
            steps: Vec::new(),
            next_id: 1,
        }
    }

    pub fn state(&self) -> WorkplanState {
        self.state
    }

    pub fn is_released(&self) -> bool {
        self.state == WorkplanState::Released
    }

    pub fn connectors(&self) -> &[Connector] {
        &self.connectors
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn connector(&self, id: NodeId) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.id == id)
    }

    pub fn step(&self, id: NodeId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn start(&self) -> Option<&Connector> {
        self.connectors
            .iter()
            .find(|c| c.classification == NodeClassification::Start)
    }

    /// Exit connectors in declaration order. A sub-workplan step has one
    /// output per exit, in this order.
    pub fn exits(&self) -> impl Iterator<Item = &Connector> {
        self.connectors
            .iter()
            .filter(|c| c.classification.is_exit())
    }

    /// Output descriptions a step wrapping this workplan exposes:
    /// `Success` for `End`, `Failure` for every other exit.
    pub fn exit_descriptions(&self) -> Vec<OutputDescription> {
        self.exits()
            .enumerate()
            .map(|(index, exit)| OutputDescription {
                name: exit.name.clone(),
                classification: if exit.classification == NodeClassification::End {
                    OutputClassification::Success
                } else {
                    OutputClassification::Failure
                },
                mapping_value: index as i32,
            })
            .collect()
    }

    pub fn add_connector(
        &mut self,
        name: impl Into<String>,
        classification: NodeClassification,
    ) -> Result<NodeId, WorkplanError> {
        self.ensure_editable()?;
        let id = self.allocate_id();
        self.connectors.push(Connector {
            id,
            name: name.into(),
            classification,
        });
        Ok(id)
    }

    pub fn add_step(&mut self, mut step: Step) -> Result<NodeId, WorkplanError> {
        self.ensure_editable()?;
        let id = self.allocate_id();
        step.id = id;
        self.steps.push(step);
        Ok(id)
    }

    /// Validate the graph and freeze it.
    pub fn release(&mut self) -> Result<(), WorkplanError> {
        self.ensure_editable()?;
        self.validate()?;
        self.state = WorkplanState::Released;
        Ok(())
    }

    /// Editable copy of this workplan with the next version number.
    pub fn new_version(&self) -> Workplan {
        Workplan {
            version: self.version + 1,
            state: WorkplanState::New,
            ..self.clone()
        }
    }

    /// Graph integrity checks run by [`release`](Workplan::release). Nested
    /// workplans are checked too, whatever state they claim.
    pub fn validate(&self) -> Result<(), WorkplanError> {
        let mut seen = HashSet::new();
        let ids = self.connectors.iter().map(|c| c.id);
        for id in ids.chain(self.steps.iter().map(|s| s.id)) {
            if !seen.insert(id) {
                return Err(WorkplanError::DuplicateId(id));
            }
        }
        match self
            .connectors
            .iter()
            .filter(|c| c.classification == NodeClassification::Start)
            .count()
        {
            0 => return Err(WorkplanError::MissingStart(self.name.clone())),
            1 => {}
            _ => return Err(WorkplanError::MultipleStarts(self.name.clone())),
        }
        if !self
            .connectors
            .iter()
            .any(|c| c.classification == NodeClassification::End)
        {
            return Err(WorkplanError::MissingEnd(self.name.clone()));
        }
        for step in &self.steps {
            for connector in step.inputs.iter().chain(&step.outputs) {
                if self.connector(*connector).is_none() {
                    return Err(WorkplanError::DanglingConnector {
                        step: step.name.clone(),
                        connector: *connector,
                    });
                }
            }
            validate_arity(step)?;
        }
        Ok(())
    }

    fn ensure_editable(&self) -> Result<(), WorkplanError> {
        if self.is_released() {
            return Err(WorkplanError::AlreadyReleased(self.name.clone()));
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> NodeId {
        let highest = self
            .connectors
            .iter()
            .map(|c| c.id)
            .chain(self.steps.iter().map(|s| s.id))
            .max()
            .unwrap_or(0);
        let id = self.next_id.max(highest + 1);
        self.next_id = id + 1;
        id
    }
}

fn validate_arity(step: &Step) -> Result<(), WorkplanError> {
    let inputs = step.inputs.len();
    let outputs = step.outputs.len();
    let single_input = || {
        if inputs != 1 {
            return Err(WorkplanError::InputArity {
                step: step.name.clone(),
                inputs,
            });
        }
        Ok(())
    };
    let output_arity = |descriptions: usize| {
        if outputs != descriptions {
            return Err(WorkplanError::OutputArity {
                step: step.name.clone(),
                outputs,
                descriptions,
            });
        }
        Ok(())
    };

    match &step.kind {
        StepKind::Task { .. } => {
            single_input()?;
            output_arity(step.output_descriptions().len())
        }
        StepKind::Split => {
            single_input()?;
            if outputs < 2 {
                return Err(WorkplanError::SplitArity {
                    step: step.name.clone(),
                    outputs,
                });
            }
            Ok(())
        }
        StepKind::Join => {
            if inputs < 2 {
                return Err(WorkplanError::JoinArity {
                    step: step.name.clone(),
                    inputs,
                });
            }
            output_arity(1)
        }
        StepKind::Subworkplan { workplan } => {
            single_input()?;
            if !workplan.is_released() {
                return Err(WorkplanError::NestedNotReleased(workplan.name.clone()));
            }
            workplan.validate()?;
            output_arity(workplan.exits().count())
        }
    }
}
