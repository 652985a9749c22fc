//! Built-in assembly workplan used by `forgeflow demo` and `export-demo`.
//!
//! ```text
//! Start -> Kitting (split) -> Mount 0..n -> Assemble (join)
//!       -> Quality check (nested: Test -> Ok / Scrap) -> Done / Rework
//! ```

use std::sync::Arc;

use serde_json::json;

use crate::error::WorkplanError;
use crate::workplan::{NodeClassification, Step, Workplan};

/// Nested inspection cell: one test task with a pass and a scrap exit.
pub fn quality_check() -> Result<Workplan, WorkplanError> {
    let mut wp = Workplan::new("quality-check");
    let start = wp.add_connector("Start", NodeClassification::Start)?;
    let ok = wp.add_connector("Ok", NodeClassification::End)?;
    let scrap = wp.add_connector("Scrap", NodeClassification::Failed)?;
    wp.add_step(
        Step::task("Test", "functional-test")
            .parameters(json!({ "program": "eol-42" }))
            .input(start)
            .outputs([ok, scrap]),
    )?;
    wp.release()?;
    Ok(wp)
}

/// Released assembly workplan whose join waits for `lanes` mounting tasks.
pub fn assembly(lanes: usize) -> Result<Workplan, WorkplanError> {
    let mut wp = Workplan::new("assembly");
    let start = wp.add_connector("Start", NodeClassification::Start)?;
    let done = wp.add_connector("Done", NodeClassification::End)?;
    let rework = wp.add_connector("Rework", NodeClassification::Failed)?;

    let mut kits = Vec::with_capacity(lanes);
    let mut mounted = Vec::with_capacity(lanes);
    for lane in 0..lanes {
        kits.push(wp.add_connector(format!("Kit {lane}"), NodeClassification::Intermediate)?);
        mounted.push(wp.add_connector(format!("Mounted {lane}"), NodeClassification::Intermediate)?);
    }
    let assembled = wp.add_connector("Assembled", NodeClassification::Intermediate)?;

    wp.add_step(Step::split("Kitting").input(start).outputs(kits.iter().copied()))?;
    for (lane, (&kit, &out)) in kits.iter().zip(&mounted).enumerate() {
        wp.add_step(
            Step::task(format!("Mount {lane}"), "mount")
                .parameters(json!({ "lane": lane }))
                .input(kit)
                .outputs([out, rework]),
        )?;
    }
    wp.add_step(Step::join("Assemble").inputs(mounted).output(assembled))?;
    wp.add_step(
        Step::subworkplan("Quality check", Arc::new(quality_check()?))
            .input(assembled)
            .outputs([done, rework]),
    )?;
    wp.release()?;
    Ok(wp)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::{InstanceStatus, SimulatedExecutor, WorkflowEngine};
    use crate::workplan::{StepKind, Token, TokenKind};

    #[test]
    fn assembly_has_one_mount_per_lane() {
        let wp = assembly(3).unwrap();
        assert!(wp.is_released());
        let mounts = wp
            .steps()
            .iter()
            .filter(|s| matches!(&s.kind, StepKind::Task { activity, .. } if activity == "mount"))
            .count();
        assert_eq!(mounts, 3);
        let join = wp.steps().iter().find(|s| s.name == "Assemble").unwrap();
        assert_eq!(join.inputs.len(), 3);
        let check = wp.steps().iter().find(|s| s.name == "Quality check").unwrap();
        let names: Vec<String> = check.output_descriptions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["Ok", "Scrap"]);
    }

    #[test]
    fn single_lane_join_is_rejected() {
        assert!(matches!(assembly(1), Err(WorkplanError::SplitArity { .. })));
    }

    #[tokio::test]
    async fn assembly_runs_to_done() {
        let engine = WorkflowEngine::new(Arc::new(SimulatedExecutor::new(Duration::from_millis(1))));
        let wp = Arc::new(assembly(2).unwrap());
        let done = wp.exits().next().unwrap().id;
        let handle = engine.instantiate(wp).unwrap();
        handle.start(Token::new("pump-7")).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.completion())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.connector, done);
        assert_eq!(handle.status(), InstanceStatus::Completed);
        let finished = handle.tokens_at(done);
        assert!(matches!(&finished[0].kind, TokenKind::Joined { parts } if parts.len() == 2));
    }

    #[tokio::test]
    async fn failing_test_sends_the_unit_to_rework() {
        let executor = SimulatedExecutor::default().fail("Test");
        let engine = WorkflowEngine::new(Arc::new(executor));
        let wp = Arc::new(assembly(2).unwrap());
        let handle = engine.instantiate(wp).unwrap();
        handle.start(Token::new("pump-8")).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.completion())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.name, "Rework");
        assert_eq!(outcome.classification, NodeClassification::Failed);
    }
}
