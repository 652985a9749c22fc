use thiserror::Error;

use crate::state_machine::StateKey;

/// Errors raised by the state machine runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// The operation is not supported by the currently active state.
    #[error("operation `{operation}` is not valid in state {state}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    #[error("state {0} is not declared in the state map")]
    UnknownState(StateKey),

    #[error("state map declares no initial state")]
    NoInitialState,

    #[error("state map declares more than one initial state")]
    MultipleInitialStates,

    #[error("state {0} is declared twice")]
    DuplicateState(StateKey),

    #[error("fallback state {0} is not declared")]
    UnknownFallback(StateKey),

    /// An enter hook failed; the context was moved to its fallback state
    /// (or back to `from` when no fallback is declared).
    #[error("transition {from} -> {to} failed: {reason}")]
    TransitionFailed {
        from: &'static str,
        to: &'static str,
        reason: String,
    },

    #[error("a transition is already in flight")]
    TransitionInFlight,

    #[error("transition cancelled, context remains in {state}")]
    Cancelled { state: &'static str },

    /// Failure reported by an enter or exit hook.
    #[error("state hook failed: {0}")]
    Hook(String),
}

/// Graph integrity and lifecycle errors of a workplan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkplanError {
    #[error("step `{step}` references unknown connector {connector}")]
    DanglingConnector { step: String, connector: u32 },

    #[error("split step `{step}` needs at least 2 outputs, got {outputs}")]
    SplitArity { step: String, outputs: usize },

    #[error("join step `{step}` needs at least 2 inputs, got {inputs}")]
    JoinArity { step: String, inputs: usize },

    #[error("step `{step}` has {outputs} outputs but {descriptions} output descriptions")]
    OutputArity {
        step: String,
        outputs: usize,
        descriptions: usize,
    },

    #[error("step `{step}` must have exactly one input, got {inputs}")]
    InputArity { step: String, inputs: usize },

    #[error("workplan `{0}` has no start connector")]
    MissingStart(String),

    #[error("workplan `{0}` has more than one start connector")]
    MultipleStarts(String),

    #[error("workplan `{0}` has no end connector")]
    MissingEnd(String),

    #[error("nested workplan `{0}` is not released")]
    NestedNotReleased(String),

    #[error("workplan `{0}` is released and can no longer be edited")]
    AlreadyReleased(String),

    #[error("workplan `{0}` is not released")]
    NotReleased(String),

    #[error("node id {0} is used more than once")]
    DuplicateId(u32),

    #[error("unknown step {0}")]
    UnknownStep(u32),

    #[error("unknown connector {0}")]
    UnknownConnector(u32),
}

/// Errors raised while executing a workplan instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Workplan(#[from] WorkplanError),

    /// The instance lifecycle machine rejected a transition.
    #[error(transparent)]
    State(#[from] StateError),

    /// A transition was asked to fire while a previous firing is running.
    /// The triggering token stays queued in its place.
    #[error("transition `{0}` is already executing")]
    ConcurrencyViolation(String),

    /// The activity collaborator failed unexpectedly. Fatal for the instance.
    #[error("activity of step `{step}` failed: {message}")]
    Activity { step: String, message: String },

    #[error("instance is {actual}, expected {expected}")]
    InvalidInstanceState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("instance was aborted")]
    Aborted,

    #[error("snapshot does not match workplan: {0}")]
    Snapshot(String),
}

/// Errors of the persistence collaborator.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("no stored entry for {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level error of the crate.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Workplan(#[from] WorkplanError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_display() {
        let err = StateError::InvalidState {
            state: "Listening",
            operation: "send",
        };
        assert_eq!(
            err.to_string(),
            "operation `send` is not valid in state Listening"
        );
    }

    #[test]
    fn engine_error_wraps_workplan_error() {
        let err: EngineError = WorkplanError::NotReleased("assembly".into()).into();
        assert_eq!(err.to_string(), "workplan `assembly` is not released");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StateError>();
        assert_send_sync::<EngineError>();
        assert_send_sync::<ForgeError>();
    }
}
