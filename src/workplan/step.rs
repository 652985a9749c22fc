use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::model::{NodeId, Workplan};

/// Meaning of a step output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputClassification {
    Success,
    Failure,
}

impl fmt::Display for OutputClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputClassification::Success => write!(f, "SUCCESS"),
            OutputClassification::Failure => write!(f, "FAILURE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescription {
    pub name: String,
    pub classification: OutputClassification,
    /// Result code the activity reports for this output.
    pub mapping_value: i32,
}

impl OutputDescription {
    pub fn success(name: impl Into<String>, mapping_value: i32) -> Self {
        Self {
            name: name.into(),
            classification: OutputClassification::Success,
            mapping_value,
        }
    }

    pub fn failure(name: impl Into<String>, mapping_value: i32) -> Self {
        Self {
            name: name.into(),
            classification: OutputClassification::Failure,
            mapping_value,
        }
    }
}

fn default_task_outputs() -> Vec<OutputDescription> {
    vec![
        OutputDescription::success("Success", 0),
        OutputDescription::failure("Failure", 1),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StepKind {
    /// Runs an activity through the activity collaborator.
    Task {
        activity: String,
        #[serde(default)]
        parameters: serde_json::Value,
        #[serde(default = "default_task_outputs")]
        descriptions: Vec<OutputDescription>,
    },
    /// One input, one token on every output.
    Split,
    /// Waits for a token on every input, produces one output token.
    Join,
    /// Runs a nested workplan; one output per nested exit.
    Subworkplan { workplan: Arc<Workplan> },
}

/// Transition template of a workplan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub id: NodeId,
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub inputs: Vec<NodeId>,
    #[serde(default)]
    pub outputs: Vec<NodeId>,
}

impl Step {
    fn with_kind(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: 0,
            name: name.into(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn task(name: impl Into<String>, activity: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            StepKind::Task {
                activity: activity.into(),
                parameters: serde_json::Value::Null,
                descriptions: default_task_outputs(),
            },
        )
    }

    pub fn split(name: impl Into<String>) -> Self {
        Self::with_kind(name, StepKind::Split)
    }

    pub fn join(name: impl Into<String>) -> Self {
        Self::with_kind(name, StepKind::Join)
    }

    pub fn subworkplan(name: impl Into<String>, workplan: Arc<Workplan>) -> Self {
        Self::with_kind(name, StepKind::Subworkplan { workplan })
    }

    pub fn input(mut self, connector: NodeId) -> Self {
        self.inputs.push(connector);
        self
    }

    pub fn inputs(mut self, connectors: impl IntoIterator<Item = NodeId>) -> Self {
        self.inputs.extend(connectors);
        self
    }

    pub fn output(mut self, connector: NodeId) -> Self {
        self.outputs.push(connector);
        self
    }

    pub fn outputs(mut self, connectors: impl IntoIterator<Item = NodeId>) -> Self {
        self.outputs.extend(connectors);
        self
    }

    /// Parameters handed to the activity. Ignored for non-task steps.
    pub fn parameters(mut self, value: serde_json::Value) -> Self {
        if let StepKind::Task { parameters, .. } = &mut self.kind {
            *parameters = value;
        }
        self
    }

    /// Replace the default `Success`/`Failure` outputs of a task.
    pub fn describe_outputs(mut self, outputs: Vec<OutputDescription>) -> Self {
        if let StepKind::Task { descriptions, .. } = &mut self.kind {
            *descriptions = outputs;
        }
        self
    }

    /// Meaning of each output, by output index.
    pub fn output_descriptions(&self) -> Vec<OutputDescription> {
        match &self.kind {
            StepKind::Task { descriptions, .. } => descriptions.clone(),
            StepKind::Split => (0..self.outputs.len())
                .map(|i| OutputDescription::success(format!("Branch{i}"), i as i32))
                .collect(),
            StepKind::Join => vec![OutputDescription::success("Joined", 0)],
            StepKind::Subworkplan { workplan } => workplan.exit_descriptions(),
        }
    }

    /// Output index chosen for an activity result.
    ///
    /// Prefers the output whose mapping value equals `code`, then the first
    /// output with the requested classification.
    pub fn resolve_output(&self, classification: OutputClassification, code: Option<i32>) -> Option<usize> {
        let descriptions = self.output_descriptions();
        if let Some(code) = code
            && let Some(index) = descriptions.iter().position(|d| d.mapping_value == code)
        {
            return Some(index);
        }
        descriptions
            .iter()
            .position(|d| d.classification == classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workplan::NodeClassification;

    #[test]
    fn task_defaults_to_success_and_failure() {
        let step = Step::task("Mount", "mount");
        let descriptions = step.output_descriptions();
        assert_eq!(descriptions.len(), 2);
        assert_eq!(descriptions[0].classification, OutputClassification::Success);
        assert_eq!(descriptions[1].classification, OutputClassification::Failure);
    }

    #[test]
    fn split_describes_every_branch_as_success() {
        let step = Step::split("Fork").input(1).outputs([2, 3, 4]);
        let descriptions = step.output_descriptions();
        assert_eq!(descriptions.len(), 3);
        assert!(
            descriptions
                .iter()
                .all(|d| d.classification == OutputClassification::Success)
        );
    }

    #[test]
    fn subworkplan_outputs_come_from_nested_exits() {
        let mut nested = Workplan::new("inner");
        nested.add_connector("Start", NodeClassification::Start).unwrap();
        nested.add_connector("Good", NodeClassification::End).unwrap();
        nested.add_connector("Bad", NodeClassification::Failed).unwrap();
        let step = Step::subworkplan("Inner", Arc::new(nested));

        let descriptions = step.output_descriptions();
        assert_eq!(
            descriptions,
            vec![
                OutputDescription::success("Good", 0),
                OutputDescription::failure("Bad", 1)
            ]
        );
    }

    #[test]
    fn resolve_output_prefers_mapping_value() {
        let step = Step::task("Test", "test").describe_outputs(vec![
            OutputDescription::success("Passed", 0),
            OutputDescription::failure("Retest", 1),
            OutputDescription::failure("Scrap", 2),
        ]);
        assert_eq!(step.resolve_output(OutputClassification::Failure, Some(2)), Some(2));
        assert_eq!(step.resolve_output(OutputClassification::Failure, None), Some(1));
        assert_eq!(step.resolve_output(OutputClassification::Success, Some(9)), Some(0));
    }

    #[test]
    fn parameters_only_apply_to_tasks() {
        let step = Step::split("Fork").parameters(serde_json::json!({"x": 1}));
        assert_eq!(step.kind, StepKind::Split);

        let step = Step::task("Mount", "mount").parameters(serde_json::json!({"torque": 4}));
        match step.kind {
            StepKind::Task { parameters, .. } => assert_eq!(parameters["torque"], 4),
            _ => panic!("expected task"),
        }
    }

    #[test]
    fn step_json_uses_type_tag() {
        let json = serde_json::to_value(Step::join("Merge").inputs([1, 2]).output(3)).unwrap();
        assert_eq!(json["kind"]["type"], "Join");
    }
}
