//! Workflow engine: runs released workplans as instances of places and
//! transitions that move tokens.

mod activity;
mod event;
mod instance;
mod lifecycle;
mod place;
mod snapshot;
mod transition;

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use activity::{ActivityExecutor, ActivityRequest, ActivityResult, SimulatedExecutor};
pub use event::{InstanceEvent, InstanceOutcome, InstanceStatus};
pub use instance::InstanceHandle;
pub use place::PlaceState;
pub use snapshot::{InstanceSnapshot, PendingHandoff, PlaceSnapshot, TransitionSnapshot};

use crate::error::EngineError;
use crate::workplan::Workplan;
use instance::{InstanceCore, Services};

const EVENT_CAPACITY: usize = 1024;

/// Creates instances of released workplans. Instances share nothing but
/// the activity executor and run fully independently.
#[derive(Clone)]
pub struct WorkflowEngine {
    executor: Arc<dyn ActivityExecutor>,
}

impl WorkflowEngine {
    pub fn new(executor: Arc<dyn ActivityExecutor>) -> Self {
        Self { executor }
    }

    fn services(&self) -> Services {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Services {
            executor: Arc::clone(&self.executor),
            events,
        }
    }

    /// New instance in `Created`. Call [`InstanceHandle::start`] to run it.
    pub fn instantiate(&self, workplan: Arc<Workplan>) -> Result<InstanceHandle, EngineError> {
        InstanceCore::create(
            Uuid::new_v4(),
            workplan,
            self.services(),
            CancellationToken::new(),
            None,
        )
    }

    /// Rebuild an instance from a snapshot. It keeps its id and stays
    /// paused until [`InstanceHandle::resume`].
    pub fn restore(
        &self,
        workplan: Arc<Workplan>,
        snapshot: &InstanceSnapshot,
    ) -> Result<InstanceHandle, EngineError> {
        snapshot::restore(
            workplan,
            snapshot,
            self.services(),
            CancellationToken::new(),
            None,
        )
    }
}
