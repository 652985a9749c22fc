use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::map::{StateClassification, StateKey, StateMap};
use crate::error::StateError;

/// Enter/exit hooks shared by every synchronous state handler of context `C`.
///
/// Capability traits (e.g. `ListenerState`) extend this trait and give each
/// operation a default body returning [`invalid_state`].
pub trait StateHandler<C>: Send + Sync {
    fn on_enter(&self, _ctx: &mut C) -> Result<(), StateError> {
        Ok(())
    }

    fn on_exit(&self, _ctx: &mut C) -> Result<(), StateError> {
        Ok(())
    }
}

/// An object whose behavior varies by state.
///
/// The context owns its [`StateMachine`]; `machine_mut` is the set-state
/// channel and must only be used by this module.
pub trait StateContext: Sized {
    type State: ?Sized + StateHandler<Self> + 'static;

    fn machine(&self) -> &StateMachine<Self::State>;
    fn machine_mut(&mut self) -> &mut StateMachine<Self::State>;
}

/// Current-state slot of a context plus its lazily built handler cache.
pub struct StateMachine<H: ?Sized + 'static> {
    map: &'static StateMap<H>,
    key: StateKey,
    current: Arc<H>,
    cache: HashMap<StateKey, Arc<H>>,
    in_transition: bool,
    queued: Option<StateKey>,
}

impl<H: ?Sized + 'static> StateMachine<H> {
    /// Resolve the initial state of `map`. The initial enter hook runs in
    /// [`initialize`].
    pub fn new(map: &'static StateMap<H>) -> Result<Self, StateError> {
        map.validate()?;
        let entry = map.initial_entry()?;
        let current = entry.create();
        let mut cache = HashMap::new();
        cache.insert(entry.key, Arc::clone(&current));
        Ok(Self {
            map,
            key: entry.key,
            current,
            cache,
            in_transition: false,
            queued: None,
        })
    }

    pub fn key(&self) -> StateKey {
        self.key
    }

    pub fn name(&self) -> &'static str {
        self.name_of(self.key)
    }

    pub fn classification(&self) -> StateClassification {
        self.map
            .entry(self.key)
            .map(|e| e.classification)
            .unwrap_or(StateClassification::Failure)
    }

    pub fn is_in_transition(&self) -> bool {
        self.in_transition
    }

    pub(crate) fn map(&self) -> &'static StateMap<H> {
        self.map
    }

    pub(crate) fn current(&self) -> Arc<H> {
        Arc::clone(&self.current)
    }

    pub(crate) fn name_of(&self, key: StateKey) -> &'static str {
        self.map.entry(key).map(|e| e.name).unwrap_or("<unknown>")
    }

    pub(crate) fn resolve(&mut self, key: StateKey) -> Result<Arc<H>, StateError> {
        if let Some(handler) = self.cache.get(&key) {
            return Ok(Arc::clone(handler));
        }
        let handler = self.map.entry(key)?.create();
        self.cache.insert(key, Arc::clone(&handler));
        Ok(handler)
    }

    pub(crate) fn set_state(&mut self, key: StateKey, handler: Arc<H>) {
        self.key = key;
        self.current = handler;
    }

    pub(crate) fn begin(&mut self) {
        self.in_transition = true;
    }

    pub(crate) fn finish(&mut self) {
        self.in_transition = false;
        self.queued = None;
    }

    pub(crate) fn queue(&mut self, key: StateKey) -> Result<(), StateError> {
        if self.queued.is_some() {
            return Err(StateError::TransitionInFlight);
        }
        self.map.entry(key)?;
        self.queued = Some(key);
        Ok(())
    }

    pub(crate) fn take_queued(&mut self) -> Option<StateKey> {
        self.queued.take()
    }
}

/// Run the enter hook of the initial state.
pub fn initialize<C: StateContext>(ctx: &mut C) -> Result<(), StateError> {
    let initial = ctx.machine().current();
    debug!(state = ctx.machine().name(), "entering initial state");
    ctx.machine_mut().begin();
    let result = initial.on_enter(ctx).and_then(|_| match ctx.machine_mut().take_queued() {
        Some(key) => run_transitions(ctx, key),
        None => Ok(()),
    });
    ctx.machine_mut().finish();
    result
}

/// Move `ctx` to the state identified by `key`.
///
/// Called from an enter hook, the request is queued and applied once the
/// running transition completes.
pub fn next_state<C: StateContext>(ctx: &mut C, key: StateKey) -> Result<(), StateError> {
    if ctx.machine().is_in_transition() {
        return ctx.machine_mut().queue(key);
    }
    ctx.machine_mut().begin();
    let result = run_transitions(ctx, key);
    ctx.machine_mut().finish();
    result
}

/// The error every unsupported capability returns.
pub fn invalid_state<C: StateContext>(ctx: &C, operation: &'static str) -> StateError {
    StateError::InvalidState {
        state: ctx.machine().name(),
        operation,
    }
}

fn run_transitions<C: StateContext>(ctx: &mut C, mut key: StateKey) -> Result<(), StateError> {
    loop {
        transition(ctx, key)?;
        match ctx.machine_mut().take_queued() {
            Some(next) => key = next,
            None => return Ok(()),
        }
    }
}

fn transition<C: StateContext>(ctx: &mut C, key: StateKey) -> Result<(), StateError> {
    let incoming = ctx.machine_mut().resolve(key)?;
    let outgoing = ctx.machine().current();
    let from = ctx.machine().key();
    let from_name = ctx.machine().name();
    let to_name = ctx.machine().name_of(key);

    if let Err(err) = outgoing.on_exit(ctx) {
        warn!(from = from_name, to = to_name, error = %err, "exit hook failed");
    }

    ctx.machine_mut().set_state(key, Arc::clone(&incoming));
    debug!(from = from_name, to = to_name, "state transition");

    if let Err(err) = incoming.on_enter(ctx) {
        ctx.machine_mut().take_queued();
        let fallback = ctx.machine().map().fallback_key().filter(|f| *f != key);
        match fallback {
            Some(fallback) => {
                let handler = ctx.machine_mut().resolve(fallback)?;
                ctx.machine_mut().set_state(fallback, Arc::clone(&handler));
                warn!(state = to_name, fallback = ctx.machine().name(), error = %err, "enter hook failed, moved to fallback");
                if let Err(hook) = handler.on_enter(ctx) {
                    warn!(state = ctx.machine().name(), error = %hook, "fallback enter hook failed");
                }
                ctx.machine_mut().take_queued();
            }
            None => {
                ctx.machine_mut().set_state(from, outgoing);
                warn!(state = to_name, restored = from_name, error = %err, "enter hook failed, rolled back");
            }
        }
        return Err(StateError::TransitionFailed {
            from: from_name,
            to: to_name,
            reason: err.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use super::*;

    // A door: Closed -> Open -> Closed, Closed -> Locked, Jammed as fallback.
    const CLOSED: StateKey = 0;
    const OPEN: StateKey = 1;
    const LOCKED: StateKey = 2;
    const JAMMED: StateKey = 3;
    const SWINGING: StateKey = 4;

    #[derive(Default)]
    struct Door {
        machine: Option<StateMachine<dyn DoorState>>,
        log: Vec<String>,
        fail_lock: bool,
        fail_exit: bool,
    }

    impl StateContext for Door {
        type State = dyn DoorState;

        fn machine(&self) -> &StateMachine<dyn DoorState> {
            self.machine.as_ref().unwrap()
        }

        fn machine_mut(&mut self) -> &mut StateMachine<dyn DoorState> {
            self.machine.as_mut().unwrap()
        }
    }

    trait DoorState: StateHandler<Door> {
        fn open(&self, ctx: &mut Door) -> Result<(), StateError> {
            Err(invalid_state(ctx, "open"))
        }
        fn close(&self, ctx: &mut Door) -> Result<(), StateError> {
            Err(invalid_state(ctx, "close"))
        }
        fn lock(&self, ctx: &mut Door) -> Result<(), StateError> {
            Err(invalid_state(ctx, "lock"))
        }
        fn push(&self, ctx: &mut Door) -> Result<(), StateError> {
            Err(invalid_state(ctx, "push"))
        }
    }

    struct Closed;
    impl StateHandler<Door> for Closed {
        fn on_enter(&self, ctx: &mut Door) -> Result<(), StateError> {
            ctx.log.push("enter closed".into());
            Ok(())
        }
        fn on_exit(&self, ctx: &mut Door) -> Result<(), StateError> {
            ctx.log.push("exit closed".into());
            if ctx.fail_exit {
                return Err(StateError::Hook("hinge stuck".into()));
            }
            Ok(())
        }
    }
    impl DoorState for Closed {
        fn open(&self, ctx: &mut Door) -> Result<(), StateError> {
            next_state(ctx, OPEN)
        }
        fn lock(&self, ctx: &mut Door) -> Result<(), StateError> {
            next_state(ctx, LOCKED)
        }
        fn push(&self, ctx: &mut Door) -> Result<(), StateError> {
            next_state(ctx, SWINGING)
        }
    }

    struct Open;
    impl StateHandler<Door> for Open {}
    impl DoorState for Open {
        fn close(&self, ctx: &mut Door) -> Result<(), StateError> {
            next_state(ctx, CLOSED)
        }
    }

    struct Locked;
    impl StateHandler<Door> for Locked {
        fn on_enter(&self, ctx: &mut Door) -> Result<(), StateError> {
            if ctx.fail_lock {
                return Err(StateError::Hook("bolt missing".into()));
            }
            Ok(())
        }
    }
    impl DoorState for Locked {}

    struct Jammed;
    impl StateHandler<Door> for Jammed {
        fn on_enter(&self, ctx: &mut Door) -> Result<(), StateError> {
            ctx.log.push("enter jammed".into());
            Ok(())
        }
    }
    impl DoorState for Jammed {}

    // Swings open and immediately requests to fall shut again.
    struct Swinging;
    impl StateHandler<Door> for Swinging {
        fn on_enter(&self, ctx: &mut Door) -> Result<(), StateError> {
            ctx.log.push("swing".into());
            next_state(ctx, CLOSED)
        }
    }
    impl DoorState for Swinging {}

    static DOOR_STATES: LazyLock<StateMap<dyn DoorState>> = LazyLock::new(|| {
        StateMap::new()
            .initial(CLOSED, "Closed", StateClassification::Running, || {
                Arc::new(Closed) as Arc<dyn DoorState>
            })
            .state(OPEN, "Open", StateClassification::Running, || {
                Arc::new(Open) as Arc<dyn DoorState>
            })
            .state(LOCKED, "Locked", StateClassification::Stopped, || {
                Arc::new(Locked) as Arc<dyn DoorState>
            })
            .state(JAMMED, "Jammed", StateClassification::Failure, || {
                Arc::new(Jammed) as Arc<dyn DoorState>
            })
            .state(SWINGING, "Swinging", StateClassification::Busy, || {
                Arc::new(Swinging) as Arc<dyn DoorState>
            })
            .fallback(JAMMED)
    });

    fn door() -> Door {
        let mut door = Door {
            machine: Some(StateMachine::new(&DOOR_STATES).unwrap()),
            ..Default::default()
        };
        initialize(&mut door).unwrap();
        door
    }

    fn open(door: &mut Door) -> Result<(), StateError> {
        let state = door.machine().current();
        state.open(door)
    }

    fn close(door: &mut Door) -> Result<(), StateError> {
        let state = door.machine().current();
        state.close(door)
    }

    fn lock(door: &mut Door) -> Result<(), StateError> {
        let state = door.machine().current();
        state.lock(door)
    }

    #[test]
    fn initialize_enters_initial_state() {
        let door = door();
        assert_eq!(door.machine().key(), CLOSED);
        assert_eq!(door.log, vec!["enter closed"]);
    }

    #[test]
    fn declared_transitions_move_the_context() {
        let mut door = door();
        open(&mut door).unwrap();
        assert_eq!(door.machine().name(), "Open");
        close(&mut door).unwrap();
        assert_eq!(door.machine().name(), "Closed");
        assert_eq!(
            door.log,
            vec!["enter closed", "exit closed", "enter closed"]
        );
    }

    #[test]
    fn unsupported_operation_is_rejected_without_side_effects() {
        let mut door = door();
        open(&mut door).unwrap();
        let log_before = door.log.clone();

        let err = open(&mut door).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidState {
                state: "Open",
                operation: "open"
            }
        );
        assert_eq!(door.machine().key(), OPEN);
        assert_eq!(door.log, log_before);
    }

    #[test]
    fn every_state_is_declared_after_each_step() {
        let mut door = door();
        let declared: Vec<StateKey> = DOOR_STATES.keys().collect();
        for step in [open, close, lock, open] {
            let _ = step(&mut door);
            assert!(declared.contains(&door.machine().key()));
        }
    }

    #[test]
    fn exit_hook_failure_still_transitions() {
        let mut door = door();
        door.fail_exit = true;
        open(&mut door).unwrap();
        assert_eq!(door.machine().key(), OPEN);
    }

    #[test]
    fn enter_hook_failure_moves_to_fallback() {
        let mut door = door();
        door.fail_lock = true;
        let err = lock(&mut door).unwrap_err();
        assert!(matches!(
            err,
            StateError::TransitionFailed {
                from: "Closed",
                to: "Locked",
                ..
            }
        ));
        assert_eq!(door.machine().key(), JAMMED);
        assert_eq!(door.machine().classification(), StateClassification::Failure);
        assert_eq!(door.log.last().unwrap(), "enter jammed");
    }

    #[test]
    fn transition_requested_by_enter_hook_is_queued() {
        let mut door = door();
        let state = door.machine().current();
        state.push(&mut door).unwrap();
        assert_eq!(door.machine().key(), CLOSED);
        assert_eq!(
            door.log,
            vec!["enter closed", "exit closed", "swing", "enter closed"]
        );
        assert!(!door.machine().is_in_transition());
    }

    #[test]
    fn unknown_target_is_rejected() {
        let mut door = door();
        assert_eq!(next_state(&mut door, 42), Err(StateError::UnknownState(42)));
        assert_eq!(door.machine().key(), CLOSED);
    }

    #[test]
    fn handlers_are_cached_per_context() {
        let mut door = door();
        open(&mut door).unwrap();
        let first = door.machine().current();
        close(&mut door).unwrap();
        open(&mut door).unwrap();
        assert!(Arc::ptr_eq(&first, &door.machine().current()));
    }
}
