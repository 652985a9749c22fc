use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::event::InstanceStatus;
use super::instance::{InstanceCore, InstanceHandle, ParentLink, Services, lock};
use crate::error::{EngineError, WorkplanError};
use crate::workplan::{NodeId, StepKind, Token, Workplan};

/// Serializable picture of an instance, handed to the persistence
/// collaborator for resume-after-restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance: Uuid,
    pub workplan: Uuid,
    pub version: u32,
    pub status: InstanceStatus,
    pub taken_at: DateTime<Utc>,
    pub places: Vec<PlaceSnapshot>,
    pub transitions: Vec<TransitionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceSnapshot {
    pub connector: NodeId,
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionSnapshot {
    pub step: NodeId,
    pub fired: u64,
    #[serde(default)]
    pub internal_state: serde_json::Value,
    /// Token of a task whose activity had not reported back.
    #[serde(default)]
    pub in_flight: Option<Token>,
    #[serde(default)]
    pub child: Option<Box<InstanceSnapshot>>,
    /// Token a finished nested instance is handing to this step's output.
    #[serde(default)]
    pub handoff: Option<PendingHandoff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingHandoff {
    /// Output position of the step, which is the nested exit position.
    pub exit: usize,
    pub token: Token,
}

impl InstanceSnapshot {
    /// Token count per connector, nested instances excluded.
    pub fn token_counts(&self) -> Vec<(NodeId, usize)> {
        self.places
            .iter()
            .map(|p| (p.connector, p.tokens.len()))
            .collect()
    }

    /// Every live token of the instance tree.
    pub fn total_tokens(&self) -> usize {
        let held: usize = self.places.iter().map(|p| p.tokens.len()).sum();
        let moving: usize = self
            .transitions
            .iter()
            .map(|t| {
                usize::from(t.in_flight.is_some())
                    + usize::from(t.handoff.is_some())
                    + t.child.as_ref().map_or(0, |c| c.total_tokens())
            })
            .sum();
        held + moving
    }
}

/// Rebuild an instance from `snapshot`. The instance is left paused.
pub(crate) fn restore(
    workplan: Arc<Workplan>,
    snapshot: &InstanceSnapshot,
    services: Services,
    cancel: CancellationToken,
    parent: Option<ParentLink>,
) -> Result<InstanceHandle, EngineError> {
    if snapshot.workplan != workplan.id || snapshot.version != workplan.version {
        return Err(EngineError::Snapshot(format!(
            "snapshot belongs to workplan {} v{}, not {} v{}",
            snapshot.workplan, snapshot.version, workplan.id, workplan.version
        )));
    }
    if snapshot.status.is_terminal() {
        return Err(EngineError::Snapshot(format!(
            "instance {} already {}",
            snapshot.instance, snapshot.status
        )));
    }

    let handle = InstanceCore::create(
        snapshot.instance,
        Arc::clone(&workplan),
        services.clone(),
        cancel.clone(),
        parent,
    )?;
    handle.hold()?;

    let mut nested = Vec::new();
    {
        let mut guard = lock(handle.core());
        let core = &mut *guard;
        for place in &snapshot.places {
            let index = core
                .place_index(place.connector)
                .ok_or(WorkplanError::UnknownConnector(place.connector))?;
            for token in &place.tokens {
                core.places[index].push(token.clone());
            }
        }
        for saved in &snapshot.transitions {
            let index = core
                .transition_index(saved.step)
                .ok_or(WorkplanError::UnknownStep(saved.step))?;
            let transition = &mut core.transitions[index];
            transition.fired = saved.fired;
            transition.internal_state = saved.internal_state.clone();
            let input = transition.inputs.first().copied();
            if let Some(token) = &saved.in_flight {
                let input = input.ok_or_else(|| {
                    EngineError::Snapshot(format!("step {} has no input", saved.step))
                })?;
                core.places[input].push_front(token.clone());
            }
            if let Some(handoff) = &saved.handoff {
                let output = core.transitions[index]
                    .outputs
                    .get(handoff.exit)
                    .copied()
                    .ok_or_else(|| {
                        EngineError::Snapshot(format!(
                            "step {} has no output {}",
                            saved.step, handoff.exit
                        ))
                    })?;
                core.places[output].push(handoff.token.clone());
            }
            if let Some(child) = &saved.child {
                let StepKind::Subworkplan { workplan } = &core.transitions[index].step.kind else {
                    return Err(EngineError::Snapshot(format!(
                        "step {} cannot own a nested instance",
                        saved.step
                    )));
                };
                nested.push((index, Arc::clone(workplan), child));
            }
        }
    }

    // Nested instances take their own locks; build them outside ours.
    for (index, workplan, child) in nested {
        let child = restore(
            workplan,
            child,
            services.clone(),
            cancel.child_token(),
            Some(ParentLink {
                core: Arc::downgrade(handle.core()),
                transition: index,
            }),
        )?;
        let mut core = lock(handle.core());
        let transition = &mut core.transitions[index];
        transition.executing = true;
        transition.child = Some(child);
    }

    info!(instance = %snapshot.instance, workplan = %workplan.name, "instance restored, paused");
    Ok(handle)
}
