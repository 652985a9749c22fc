//! Asynchronous state machine flavor.
//!
//! Hooks may await I/O and every transition takes a [`CancellationToken`].
//! A cancelled transition rolls back: the context stays in (or returns to)
//! the state it was leaving, and [`StateError::Cancelled`] is returned.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::machine::StateMachine;
use super::map::StateKey;
use crate::error::StateError;

#[async_trait]
pub trait AsyncStateHandler<C: Send>: Send + Sync {
    async fn on_enter(&self, _ctx: &mut C) -> Result<(), StateError> {
        Ok(())
    }

    async fn on_exit(&self, _ctx: &mut C) -> Result<(), StateError> {
        Ok(())
    }
}

/// Context driven by an asynchronous state machine.
pub trait AsyncStateContext: Send + Sized {
    type State: ?Sized + AsyncStateHandler<Self> + 'static;

    fn machine(&self) -> &StateMachine<Self::State>;
    fn machine_mut(&mut self) -> &mut StateMachine<Self::State>;
}

/// Run the enter hook of the initial state.
pub async fn initialize<C: AsyncStateContext>(
    ctx: &mut C,
    cancel: &CancellationToken,
) -> Result<(), StateError> {
    let initial = ctx.machine().current();
    ctx.machine_mut().begin();
    let entered = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = initial.on_enter(ctx) => Some(result),
    };
    let result = match entered {
        None => Err(StateError::Cancelled {
            state: ctx.machine().name(),
        }),
        Some(Err(err)) => Err(err),
        Some(Ok(())) => match ctx.machine_mut().take_queued() {
            Some(key) => run_transitions(ctx, key, cancel).await,
            None => Ok(()),
        },
    };
    ctx.machine_mut().finish();
    result
}

/// Move `ctx` to the state identified by `key`, awaiting the exit hook of the
/// current state and the enter hook of the new one.
pub async fn next_state<C: AsyncStateContext>(
    ctx: &mut C,
    key: StateKey,
    cancel: &CancellationToken,
) -> Result<(), StateError> {
    if ctx.machine().is_in_transition() {
        return Err(StateError::TransitionInFlight);
    }
    ctx.machine_mut().begin();
    let result = run_transitions(ctx, key, cancel).await;
    ctx.machine_mut().finish();
    result
}

/// Request a follow-up transition from inside a hook. Applied once the
/// running transition completes.
pub fn request_state<C: AsyncStateContext>(ctx: &mut C, key: StateKey) -> Result<(), StateError> {
    if !ctx.machine().is_in_transition() {
        return Err(StateError::Hook(
            "follow-up transitions can only be requested from a hook".into(),
        ));
    }
    ctx.machine_mut().queue(key)
}

pub fn invalid_state<C: AsyncStateContext>(ctx: &C, operation: &'static str) -> StateError {
    StateError::InvalidState {
        state: ctx.machine().name(),
        operation,
    }
}

async fn run_transitions<C: AsyncStateContext>(
    ctx: &mut C,
    mut key: StateKey,
    cancel: &CancellationToken,
) -> Result<(), StateError> {
    loop {
        transition(ctx, key, cancel).await?;
        match ctx.machine_mut().take_queued() {
            Some(next) => key = next,
            None => return Ok(()),
        }
    }
}

async fn transition<C: AsyncStateContext>(
    ctx: &mut C,
    key: StateKey,
    cancel: &CancellationToken,
) -> Result<(), StateError> {
    let incoming = ctx.machine_mut().resolve(key)?;
    let outgoing = ctx.machine().current();
    let from = ctx.machine().key();
    let from_name = ctx.machine().name();
    let to_name = ctx.machine().name_of(key);

    if cancel.is_cancelled() {
        return Err(StateError::Cancelled { state: from_name });
    }

    let exited = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = outgoing.on_exit(ctx) => Some(result),
    };
    match exited {
        None => {
            ctx.machine_mut().take_queued();
            debug!(from = from_name, to = to_name, "exit hook cancelled");
            return Err(StateError::Cancelled { state: from_name });
        }
        Some(Err(err)) => {
            warn!(from = from_name, to = to_name, error = %err, "exit hook failed");
        }
        Some(Ok(())) => {}
    }

    ctx.machine_mut().set_state(key, Arc::clone(&incoming));
    debug!(from = from_name, to = to_name, "state transition");

    let entered = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = incoming.on_enter(ctx) => Some(result),
    };
    match entered {
        Some(Ok(())) => Ok(()),
        None => {
            ctx.machine_mut().take_queued();
            ctx.machine_mut().set_state(from, outgoing);
            debug!(state = to_name, restored = from_name, "enter hook cancelled, rolled back");
            Err(StateError::Cancelled { state: from_name })
        }
        Some(Err(err)) => {
            ctx.machine_mut().take_queued();
            let fallback = ctx.machine().map().fallback_key().filter(|f| *f != key);
            match fallback {
                Some(fallback) => {
                    let handler = ctx.machine_mut().resolve(fallback)?;
                    ctx.machine_mut().set_state(fallback, Arc::clone(&handler));
                    warn!(state = to_name, fallback = ctx.machine().name(), error = %err, "enter hook failed, moved to fallback");
                    if let Err(hook) = handler.on_enter(ctx).await {
                        warn!(state = ctx.machine().name(), error = %hook, "fallback enter hook failed");
                    }
                    ctx.machine_mut().take_queued();
                }
                None => {
                    ctx.machine_mut().set_state(from, outgoing);
                    warn!(state = to_name, restored = from_name, error = %err, "enter hook failed, rolled back");
                }
            }
            Err(StateError::TransitionFailed {
                from: from_name,
                to: to_name,
                reason: err.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;
    use std::time::Duration;

    use super::*;
    use crate::state_machine::{StateClassification, StateMap};

    const IDLE: StateKey = 0;
    const PRIMING: StateKey = 1;
    const PUMPING: StateKey = 2;
    const FAULT: StateKey = 3;

    struct Pump {
        machine: StateMachine<dyn PumpState>,
        log: Vec<&'static str>,
        prime_ms: u64,
        prime_fails: bool,
        drain_ms: u64,
        drain_fails: bool,
    }

    impl AsyncStateContext for Pump {
        type State = dyn PumpState;

        fn machine(&self) -> &StateMachine<dyn PumpState> {
            &self.machine
        }

        fn machine_mut(&mut self) -> &mut StateMachine<dyn PumpState> {
            &mut self.machine
        }
    }

    #[async_trait]
    trait PumpState: AsyncStateHandler<Pump> {
        async fn start(&self, ctx: &mut Pump, cancel: &CancellationToken) -> Result<(), StateError> {
            let _ = cancel;
            Err(invalid_state(ctx, "start"))
        }
    }

    struct Idle;
    #[async_trait]
    impl AsyncStateHandler<Pump> for Idle {
        async fn on_exit(&self, ctx: &mut Pump) -> Result<(), StateError> {
            // Draining the line before priming.
            tokio::time::sleep(Duration::from_millis(ctx.drain_ms)).await;
            ctx.log.push("exit idle");
            if ctx.drain_fails {
                return Err(StateError::Hook("valve stuck".into()));
            }
            Ok(())
        }
    }
    #[async_trait]
    impl PumpState for Idle {
        async fn start(&self, ctx: &mut Pump, cancel: &CancellationToken) -> Result<(), StateError> {
            next_state(ctx, PRIMING, cancel).await
        }
    }

    // Priming takes a while and then hands over to Pumping.
    struct Priming;
    #[async_trait]
    impl AsyncStateHandler<Pump> for Priming {
        async fn on_enter(&self, ctx: &mut Pump) -> Result<(), StateError> {
            tokio::time::sleep(Duration::from_millis(ctx.prime_ms)).await;
            if ctx.prime_fails {
                return Err(StateError::Hook("no pressure".into()));
            }
            ctx.log.push("primed");
            request_state(ctx, PUMPING)
        }
    }
    impl PumpState for Priming {}

    struct Pumping;
    #[async_trait]
    impl AsyncStateHandler<Pump> for Pumping {
        async fn on_enter(&self, ctx: &mut Pump) -> Result<(), StateError> {
            ctx.log.push("pumping");
            Ok(())
        }
    }
    impl PumpState for Pumping {}

    struct Fault;
    impl AsyncStateHandler<Pump> for Fault {}
    impl PumpState for Fault {}

    static PUMP_STATES: LazyLock<StateMap<dyn PumpState>> = LazyLock::new(|| {
        StateMap::new()
            .initial(IDLE, "Idle", StateClassification::Stopped, || {
                Arc::new(Idle) as Arc<dyn PumpState>
            })
            .state(PRIMING, "Priming", StateClassification::Initializing, || {
                Arc::new(Priming) as Arc<dyn PumpState>
            })
            .state(PUMPING, "Pumping", StateClassification::Running, || {
                Arc::new(Pumping) as Arc<dyn PumpState>
            })
            .state(FAULT, "Fault", StateClassification::Failure, || {
                Arc::new(Fault) as Arc<dyn PumpState>
            })
            .fallback(FAULT)
    });

    async fn pump(prime_ms: u64, prime_fails: bool) -> Pump {
        let mut pump = Pump {
            machine: StateMachine::new(&PUMP_STATES).unwrap(),
            log: Vec::new(),
            prime_ms,
            prime_fails,
            drain_ms: 0,
            drain_fails: false,
        };
        initialize(&mut pump, &CancellationToken::new()).await.unwrap();
        pump
    }

    async fn start(pump: &mut Pump, cancel: &CancellationToken) -> Result<(), StateError> {
        let state = pump.machine().current();
        state.start(pump, cancel).await
    }

    #[tokio::test(start_paused = true)]
    async fn awaits_hooks_and_applies_follow_up() {
        let mut pump = pump(50, false).await;
        start(&mut pump, &CancellationToken::new()).await.unwrap();
        assert_eq!(pump.machine().key(), PUMPING);
        assert_eq!(pump.log, vec!["exit idle", "primed", "pumping"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_enter_hook_rolls_back() {
        let mut pump = pump(1_000, false).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = start(&mut pump, &cancel).await.unwrap_err();
        assert_eq!(err, StateError::Cancelled { state: "Idle" });
        assert_eq!(pump.machine().key(), IDLE);
        assert!(!pump.machine().is_in_transition());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_exit_hook_stays_in_outgoing_state() {
        let mut pump = pump(0, false).await;
        pump.drain_ms = 1_000;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = start(&mut pump, &cancel).await.unwrap_err();
        assert_eq!(err, StateError::Cancelled { state: "Idle" });
        assert_eq!(pump.machine().key(), IDLE);
        assert!(pump.log.is_empty());
        assert!(!pump.machine().is_in_transition());

        // Nothing is left queued; a fresh start goes through.
        pump.drain_ms = 0;
        start(&mut pump, &CancellationToken::new()).await.unwrap();
        assert_eq!(pump.machine().key(), PUMPING);
    }

    #[tokio::test]
    async fn failed_exit_hook_still_transitions() {
        let mut pump = pump(0, false).await;
        pump.drain_fails = true;
        start(&mut pump, &CancellationToken::new()).await.unwrap();
        assert_eq!(pump.machine().key(), PUMPING);
        assert_eq!(pump.log, vec!["exit idle", "primed", "pumping"]);
    }

    #[tokio::test]
    async fn already_cancelled_token_leaves_state_untouched() {
        let mut pump = pump(0, false).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = start(&mut pump, &cancel).await.unwrap_err();
        assert_eq!(err, StateError::Cancelled { state: "Idle" });
        assert!(pump.log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_enter_hook_moves_to_fallback() {
        let mut pump = pump(5, true).await;
        let err = start(&mut pump, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StateError::TransitionFailed { to: "Priming", .. }));
        assert_eq!(pump.machine().key(), FAULT);
        assert_eq!(pump.machine().classification(), StateClassification::Failure);
    }

    #[tokio::test]
    async fn invalid_operation_is_reported() {
        let mut pump = pump(0, false).await;
        start(&mut pump, &CancellationToken::new()).await.unwrap();
        let err = start(&mut pump, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidState {
                state: "Pumping",
                operation: "start"
            }
        );
    }

    #[test]
    fn request_outside_transition_is_rejected() {
        let mut pump = Pump {
            machine: StateMachine::new(&PUMP_STATES).unwrap(),
            log: Vec::new(),
            prime_ms: 0,
            prime_fails: false,
            drain_ms: 0,
            drain_fails: false,
        };
        assert!(request_state(&mut pump, PUMPING).is_err());
    }
}
