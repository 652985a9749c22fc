use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workplan::{NodeId, OutputClassification, Token};

/// Everything an executor needs to run the activity of a task step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRequest {
    pub instance: Uuid,
    pub step: NodeId,
    pub step_name: String,
    pub activity: String,
    pub parameters: serde_json::Value,
    /// Copy of the consumed token. The transition keeps the original until
    /// the result is routed.
    pub token: Token,
}

/// Outcome of an activity. A `Failure` is a regular result and is routed
/// to the step's failure output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityResult {
    pub classification: OutputClassification,
    /// Selects an output by its mapping value when several outputs share a
    /// classification.
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ActivityResult {
    pub fn success() -> Self {
        Self {
            classification: OutputClassification::Success,
            code: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn failure() -> Self {
        Self {
            classification: OutputClassification::Failure,
            ..Self::success()
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Activity execution collaborator.
///
/// An `Err` is an unexpected failure and faults the whole instance.
#[async_trait]
pub trait ActivityExecutor: Send + Sync {
    async fn execute(&self, request: ActivityRequest) -> anyhow::Result<ActivityResult>;
}

/// Executor that succeeds after a fixed delay, except for the steps or
/// activities it was told to fail.
#[derive(Debug, Default, Clone)]
pub struct SimulatedExecutor {
    delay: Duration,
    failing: HashSet<String>,
}

impl SimulatedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failing: HashSet::new(),
        }
    }

    /// Report `Failure` for a step name or activity name.
    pub fn fail(mut self, name: impl Into<String>) -> Self {
        self.failing.insert(name.into());
        self
    }
}

#[async_trait]
impl ActivityExecutor for SimulatedExecutor {
    async fn execute(&self, request: ActivityRequest) -> anyhow::Result<ActivityResult> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(&request.step_name) || self.failing.contains(&request.activity) {
            return Ok(ActivityResult::failure());
        }
        Ok(ActivityResult::success().with_payload(serde_json::json!({
            "token": request.token.name,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(step: &str, activity: &str) -> ActivityRequest {
        ActivityRequest {
            instance: Uuid::new_v4(),
            step: 3,
            step_name: step.into(),
            activity: activity.into(),
            parameters: serde_json::Value::Null,
            token: Token::new("part"),
        }
    }

    #[tokio::test]
    async fn simulated_executor_fails_named_steps() {
        let executor = SimulatedExecutor::default().fail("Solder");
        let ok = executor.execute(request("Mount", "mount")).await.unwrap();
        assert_eq!(ok.classification, OutputClassification::Success);
        assert_eq!(ok.payload["token"], "part");

        let failed = executor.execute(request("Solder", "solder")).await.unwrap();
        assert_eq!(failed.classification, OutputClassification::Failure);
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_executor_waits_for_delay() {
        let executor = SimulatedExecutor::new(Duration::from_millis(250)).fail("inspect");
        let started = tokio::time::Instant::now();
        let result = executor.execute(request("Inspect", "inspect")).await.unwrap();
        assert_eq!(result, ActivityResult::failure());
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
