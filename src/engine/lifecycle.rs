//! Lifecycle of a workplan instance, driven by the state machine runtime.
//!
//! ```text
//! Created --start--> Running <--pause/resume--> Paused
//!    |                  |                         |
//!    +--hold--> Paused  +--complete--> Completed  |
//!                       +--fault-----> Faulted <--+
//!  any non-terminal state --abort--> Aborted
//! ```

use std::sync::{Arc, LazyLock};

use tracing::{info, warn};

use super::event::{InstanceEvent, InstanceStatus};
use super::instance::{Cascade, InstanceCore};
use crate::error::{EngineError, StateError};
use crate::state_machine::{StateClassification, StateHandler, StateKey, StateMap, next_state};
use crate::workplan::Token;

pub(crate) const CREATED: StateKey = 0;
pub(crate) const RUNNING: StateKey = 1;
pub(crate) const PAUSED: StateKey = 2;
pub(crate) const COMPLETED: StateKey = 3;
pub(crate) const FAULTED: StateKey = 4;
pub(crate) const ABORTED: StateKey = 5;

pub(crate) fn status_of(key: StateKey) -> InstanceStatus {
    match key {
        CREATED => InstanceStatus::Created,
        RUNNING => InstanceStatus::Running,
        PAUSED => InstanceStatus::Paused,
        COMPLETED => InstanceStatus::Completed,
        FAULTED => InstanceStatus::Faulted,
        _ => InstanceStatus::Aborted,
    }
}

fn rejected(ctx: &InstanceCore, expected: &'static str) -> EngineError {
    EngineError::InvalidInstanceState {
        expected,
        actual: ctx.state_name(),
    }
}

/// Operations of an instance. Each is rejected unless the active state
/// overrides it.
pub(crate) trait LifecycleState: StateHandler<InstanceCore> {
    fn start(&self, ctx: &mut InstanceCore, token: Token) -> Result<(), EngineError> {
        let _ = token;
        Err(rejected(ctx, "Created"))
    }

    /// Put a restored instance on hold until it is resumed.
    fn hold(&self, ctx: &mut InstanceCore) -> Result<(), EngineError> {
        Err(rejected(ctx, "Created"))
    }

    fn inject(&self, ctx: &mut InstanceCore, token: Token) -> Result<(), EngineError> {
        let _ = token;
        Err(rejected(ctx, "Running"))
    }

    fn pause(&self, ctx: &mut InstanceCore) -> Result<(), EngineError> {
        Err(rejected(ctx, "Running"))
    }

    fn resume(&self, ctx: &mut InstanceCore) -> Result<(), EngineError> {
        Err(rejected(ctx, "Paused"))
    }

    fn abort(&self, ctx: &mut InstanceCore) -> Result<(), EngineError> {
        Err(rejected(ctx, "Running"))
    }

    /// A token reached an exit place.
    fn complete(&self, ctx: &mut InstanceCore) -> Result<(), EngineError> {
        Err(rejected(ctx, "Running"))
    }

    fn fault(&self, ctx: &mut InstanceCore, error: EngineError) -> Result<(), EngineError> {
        let _ = error;
        Err(rejected(ctx, "Running"))
    }
}

fn to_aborted(ctx: &mut InstanceCore) -> Result<(), EngineError> {
    next_state(ctx, ABORTED)?;
    Ok(())
}

fn to_faulted(ctx: &mut InstanceCore, error: EngineError) -> Result<(), EngineError> {
    ctx.error = Some(error);
    next_state(ctx, FAULTED)?;
    Ok(())
}

struct Created;

impl StateHandler<InstanceCore> for Created {}

impl LifecycleState for Created {
    fn start(&self, ctx: &mut InstanceCore, token: Token) -> Result<(), EngineError> {
        info!(instance = %ctx.id, workplan = %ctx.workplan.name, token = %token.name, "instance started");
        next_state(ctx, RUNNING)?;
        let start = ctx.start;
        ctx.add_token(start, token);
        Ok(())
    }

    fn hold(&self, ctx: &mut InstanceCore) -> Result<(), EngineError> {
        next_state(ctx, PAUSED)?;
        Ok(())
    }

    fn abort(&self, ctx: &mut InstanceCore) -> Result<(), EngineError> {
        to_aborted(ctx)
    }

    fn fault(&self, ctx: &mut InstanceCore, error: EngineError) -> Result<(), EngineError> {
        to_faulted(ctx, error)
    }
}

struct Running;

impl StateHandler<InstanceCore> for Running {
    fn on_enter(&self, ctx: &mut InstanceCore) -> Result<(), StateError> {
        ctx.publish_status();
        Ok(())
    }
}

impl LifecycleState for Running {
    fn inject(&self, ctx: &mut InstanceCore, token: Token) -> Result<(), EngineError> {
        let start = ctx.start;
        ctx.add_token(start, token);
        Ok(())
    }

    fn pause(&self, ctx: &mut InstanceCore) -> Result<(), EngineError> {
        next_state(ctx, PAUSED)?;
        Ok(())
    }

    fn abort(&self, ctx: &mut InstanceCore) -> Result<(), EngineError> {
        to_aborted(ctx)
    }

    fn complete(&self, ctx: &mut InstanceCore) -> Result<(), EngineError> {
        next_state(ctx, COMPLETED)?;
        Ok(())
    }

    fn fault(&self, ctx: &mut InstanceCore, error: EngineError) -> Result<(), EngineError> {
        to_faulted(ctx, error)
    }
}

struct Paused;

impl StateHandler<InstanceCore> for Paused {
    fn on_enter(&self, ctx: &mut InstanceCore) -> Result<(), StateError> {
        for place in &mut ctx.places {
            place.pause();
        }
        ctx.publish_status();
        ctx.emit(InstanceEvent::Paused { instance: ctx.id });
        ctx.cascade(Cascade::Pause);
        info!(instance = %ctx.id, "instance paused");
        Ok(())
    }

    fn on_exit(&self, ctx: &mut InstanceCore) -> Result<(), StateError> {
        for index in 0..ctx.places.len() {
            let replay = ctx.places[index].resume();
            ctx.pending.extend(std::iter::repeat_n(index, replay));
        }
        Ok(())
    }
}

impl LifecycleState for Paused {
    fn inject(&self, ctx: &mut InstanceCore, token: Token) -> Result<(), EngineError> {
        let start = ctx.start;
        ctx.add_token(start, token);
        Ok(())
    }

    fn resume(&self, ctx: &mut InstanceCore) -> Result<(), EngineError> {
        next_state(ctx, RUNNING)?;
        ctx.emit(InstanceEvent::Resumed { instance: ctx.id });
        ctx.cascade(Cascade::Resume);
        info!(instance = %ctx.id, "instance resumed");
        Ok(())
    }

    fn abort(&self, ctx: &mut InstanceCore) -> Result<(), EngineError> {
        to_aborted(ctx)
    }

    fn fault(&self, ctx: &mut InstanceCore, error: EngineError) -> Result<(), EngineError> {
        to_faulted(ctx, error)
    }
}

struct Completed;

impl StateHandler<InstanceCore> for Completed {
    fn on_enter(&self, ctx: &mut InstanceCore) -> Result<(), StateError> {
        ctx.shut_down();
        if let Some(outcome) = ctx.outcome.clone() {
            info!(instance = %ctx.id, exit = %outcome.name, classification = %outcome.classification, "instance completed");
            ctx.emit(InstanceEvent::Completed { outcome });
        }
        ctx.publish_status();
        Ok(())
    }
}

impl LifecycleState for Completed {}

struct Faulted;

impl StateHandler<InstanceCore> for Faulted {
    fn on_enter(&self, ctx: &mut InstanceCore) -> Result<(), StateError> {
        ctx.shut_down();
        let error = ctx
            .error
            .get_or_insert_with(|| EngineError::Activity {
                step: String::new(),
                message: "unknown fault".into(),
            })
            .clone();
        warn!(instance = %ctx.id, error = %error, "instance faulted");
        ctx.emit(InstanceEvent::Faulted {
            instance: ctx.id,
            error: error.to_string(),
        });
        ctx.notify_parent_fault(error);
        ctx.publish_status();
        Ok(())
    }
}

impl LifecycleState for Faulted {}

struct Aborted;

impl StateHandler<InstanceCore> for Aborted {
    fn on_enter(&self, ctx: &mut InstanceCore) -> Result<(), StateError> {
        ctx.shut_down();
        info!(instance = %ctx.id, "instance aborted");
        ctx.emit(InstanceEvent::Aborted { instance: ctx.id });
        ctx.publish_status();
        Ok(())
    }
}

impl LifecycleState for Aborted {}

pub(crate) static LIFECYCLE: LazyLock<StateMap<dyn LifecycleState>> = LazyLock::new(|| {
    StateMap::new()
        .initial(CREATED, "Created", StateClassification::Initializing, || {
            Arc::new(Created) as Arc<dyn LifecycleState>
        })
        .state(RUNNING, "Running", StateClassification::Running, || {
            Arc::new(Running) as Arc<dyn LifecycleState>
        })
        .state(PAUSED, "Paused", StateClassification::Stopped, || {
            Arc::new(Paused) as Arc<dyn LifecycleState>
        })
        .state(COMPLETED, "Completed", StateClassification::Offline, || {
            Arc::new(Completed) as Arc<dyn LifecycleState>
        })
        .state(FAULTED, "Faulted", StateClassification::Failure, || {
            Arc::new(Faulted) as Arc<dyn LifecycleState>
        })
        .state(ABORTED, "Aborted", StateClassification::Offline, || {
            Arc::new(Aborted) as Arc<dyn LifecycleState>
        })
        .fallback(FAULTED)
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_map_is_valid() {
        assert!(LIFECYCLE.validate().is_ok());
        assert_eq!(LIFECYCLE.initial_entry().unwrap().key, CREATED);
    }

    #[test]
    fn keys_map_to_statuses() {
        let statuses: Vec<InstanceStatus> = [CREATED, RUNNING, PAUSED, COMPLETED, FAULTED, ABORTED]
            .into_iter()
            .map(status_of)
            .collect();
        assert_eq!(
            statuses,
            [
                InstanceStatus::Created,
                InstanceStatus::Running,
                InstanceStatus::Paused,
                InstanceStatus::Completed,
                InstanceStatus::Faulted,
                InstanceStatus::Aborted,
            ]
        );
        assert!(statuses[3..].iter().all(|s| s.is_terminal()));
    }
}
