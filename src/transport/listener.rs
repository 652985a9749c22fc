//! Listener context modelled on a TCP listener.
//!
//! ```text
//! NotListening --reconnect(0)--> Listening --accept--> Connected
//!      |                          ^     ^                  |
//!      +--reconnect(ms)--> Reconnecting  +---disconnect----+
//! ```
//!
//! `stop` returns every state except `NotListening` to `NotListening`.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StateError;
use crate::state_machine::{
    HealthProbe, StateClassification, StateContext, StateHandler, StateKey, StateMachine,
    StateMap, initialize, invalid_state, next_state,
};

pub const NOT_LISTENING: StateKey = 0;
pub const RECONNECTING: StateKey = 1;
pub const LISTENING: StateKey = 2;
pub const CONNECTED: StateKey = 3;

/// Where listeners announce the port they serve.
pub trait ConnectionRegistry: Send + Sync {
    fn register(&self, port: u16) -> Result<(), StateError>;
    fn unregister(&self, port: u16);
}

/// In-memory registry that allows one listener per port.
#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: Mutex<HashSet<u16>>,
}

impl PortRegistry {
    pub fn is_registered(&self, port: u16) -> bool {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }
}

impl ConnectionRegistry for PortRegistry {
    fn register(&self, port: u16) -> Result<(), StateError> {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        if !ports.insert(port) {
            return Err(StateError::Hook(format!("port {port} is already registered")));
        }
        Ok(())
    }

    fn unregister(&self, port: u16) {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
    }
}

/// State-dependent data of a [`Listener`]. Only reachable through the
/// listener's lock.
pub struct ListenerCore {
    machine: StateMachine<dyn ListenerState>,
    port: u16,
    registry: Arc<dyn ConnectionRegistry>,
    registered: bool,
    reconnect_delay: Duration,
    timer: Option<JoinHandle<()>>,
    timer_epoch: u64,
    peer: Option<String>,
    sink: Option<mpsc::UnboundedSender<Vec<u8>>>,
    this: Weak<Mutex<ListenerCore>>,
}

impl StateContext for ListenerCore {
    type State = dyn ListenerState;

    fn machine(&self) -> &StateMachine<dyn ListenerState> {
        &self.machine
    }

    fn machine_mut(&mut self) -> &mut StateMachine<dyn ListenerState> {
        &mut self.machine
    }
}

impl ListenerCore {
    fn unregister(&mut self) {
        if self.registered {
            self.registry.unregister(self.port);
            self.registered = false;
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Capabilities of a listener. Every operation is invalid unless the
/// active state overrides it.
pub trait ListenerState: StateHandler<ListenerCore> {
    fn reconnect(&self, ctx: &mut ListenerCore, delay_ms: u64) -> Result<(), StateError> {
        let _ = delay_ms;
        Err(invalid_state(ctx, "reconnect"))
    }

    fn stop(&self, ctx: &mut ListenerCore) -> Result<(), StateError> {
        Err(invalid_state(ctx, "stop"))
    }

    fn timer_elapsed(&self, ctx: &mut ListenerCore, epoch: u64) -> Result<(), StateError> {
        let _ = epoch;
        Err(invalid_state(ctx, "timer_elapsed"))
    }

    fn accept(
        &self,
        ctx: &mut ListenerCore,
        peer: String,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, StateError> {
        let _ = peer;
        Err(invalid_state(ctx, "accept"))
    }

    fn send(&self, ctx: &mut ListenerCore, frame: Vec<u8>) -> Result<(), StateError> {
        let _ = frame;
        Err(invalid_state(ctx, "send"))
    }

    fn disconnect(&self, ctx: &mut ListenerCore) -> Result<(), StateError> {
        Err(invalid_state(ctx, "disconnect"))
    }
}

fn reconnect_to(ctx: &mut ListenerCore, delay_ms: u64) -> Result<(), StateError> {
    if delay_ms == 0 {
        next_state(ctx, LISTENING)
    } else {
        ctx.reconnect_delay = Duration::from_millis(delay_ms);
        next_state(ctx, RECONNECTING)
    }
}

struct NotListening;

impl StateHandler<ListenerCore> for NotListening {
    fn on_enter(&self, ctx: &mut ListenerCore) -> Result<(), StateError> {
        ctx.cancel_timer();
        ctx.unregister();
        Ok(())
    }
}

impl ListenerState for NotListening {
    fn reconnect(&self, ctx: &mut ListenerCore, delay_ms: u64) -> Result<(), StateError> {
        reconnect_to(ctx, delay_ms)
    }
}

struct Reconnecting;

impl StateHandler<ListenerCore> for Reconnecting {
    fn on_enter(&self, ctx: &mut ListenerCore) -> Result<(), StateError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StateError::Hook(format!("cannot schedule reconnect: {e}")))?;
        ctx.timer_epoch += 1;
        let epoch = ctx.timer_epoch;
        let delay = ctx.reconnect_delay;
        let this = ctx.this.clone();
        debug!(port = ctx.port, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        ctx.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(core) = this.upgrade() else {
                return;
            };
            let mut core = lock(&core);
            let state = core.machine.current();
            if let Err(err) = state.timer_elapsed(&mut core, epoch) {
                debug!(error = %err, "reconnect timer dropped");
            }
        }));
        Ok(())
    }

    fn on_exit(&self, ctx: &mut ListenerCore) -> Result<(), StateError> {
        ctx.cancel_timer();
        Ok(())
    }
}

impl ListenerState for Reconnecting {
    fn reconnect(&self, ctx: &mut ListenerCore, delay_ms: u64) -> Result<(), StateError> {
        reconnect_to(ctx, delay_ms)
    }

    fn stop(&self, ctx: &mut ListenerCore) -> Result<(), StateError> {
        next_state(ctx, NOT_LISTENING)
    }

    fn timer_elapsed(&self, ctx: &mut ListenerCore, epoch: u64) -> Result<(), StateError> {
        if epoch != ctx.timer_epoch {
            return Err(invalid_state(ctx, "timer_elapsed"));
        }
        ctx.timer = None;
        next_state(ctx, LISTENING)
    }
}

struct Listening;

impl StateHandler<ListenerCore> for Listening {
    fn on_enter(&self, ctx: &mut ListenerCore) -> Result<(), StateError> {
        if !ctx.registered {
            ctx.registry.register(ctx.port)?;
            ctx.registered = true;
            info!(port = ctx.port, "listening");
        }
        Ok(())
    }
}

impl ListenerState for Listening {
    fn stop(&self, ctx: &mut ListenerCore) -> Result<(), StateError> {
        next_state(ctx, NOT_LISTENING)
    }

    fn accept(
        &self,
        ctx: &mut ListenerCore,
        peer: String,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, StateError> {
        let (tx, rx) = mpsc::unbounded_channel();
        ctx.sink = Some(tx);
        ctx.peer = Some(peer);
        next_state(ctx, CONNECTED)?;
        Ok(rx)
    }
}

struct Connected;

impl StateHandler<ListenerCore> for Connected {
    fn on_exit(&self, ctx: &mut ListenerCore) -> Result<(), StateError> {
        ctx.sink = None;
        if let Some(peer) = ctx.peer.take() {
            debug!(port = ctx.port, peer = %peer, "peer released");
        }
        Ok(())
    }
}

impl ListenerState for Connected {
    fn stop(&self, ctx: &mut ListenerCore) -> Result<(), StateError> {
        next_state(ctx, NOT_LISTENING)
    }

    fn send(&self, ctx: &mut ListenerCore, frame: Vec<u8>) -> Result<(), StateError> {
        let delivered = ctx
            .sink
            .as_ref()
            .is_some_and(|sink| sink.send(frame).is_ok());
        if delivered {
            return Ok(());
        }
        warn!(port = ctx.port, "peer closed while sending");
        next_state(ctx, LISTENING)?;
        Err(invalid_state(ctx, "send"))
    }

    fn disconnect(&self, ctx: &mut ListenerCore) -> Result<(), StateError> {
        next_state(ctx, LISTENING)
    }
}

static LISTENER_STATES: LazyLock<StateMap<dyn ListenerState>> = LazyLock::new(|| {
    StateMap::new()
        .initial(NOT_LISTENING, "NotListening", StateClassification::Offline, || {
            Arc::new(NotListening) as Arc<dyn ListenerState>
        })
        .state(RECONNECTING, "Reconnecting", StateClassification::Initializing, || {
            Arc::new(Reconnecting) as Arc<dyn ListenerState>
        })
        .state(LISTENING, "Listening", StateClassification::Running, || {
            Arc::new(Listening) as Arc<dyn ListenerState>
        })
        .state(CONNECTED, "Connected", StateClassification::Busy, || {
            Arc::new(Connected) as Arc<dyn ListenerState>
        })
        .fallback(NOT_LISTENING)
});

fn lock(core: &Mutex<ListenerCore>) -> MutexGuard<'_, ListenerCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A listener whose public operations are serialized through one lock.
#[derive(Clone)]
pub struct Listener {
    core: Arc<Mutex<ListenerCore>>,
}

impl Listener {
    pub fn new(port: u16, registry: Arc<dyn ConnectionRegistry>) -> Result<Self, StateError> {
        let machine = StateMachine::new(&LISTENER_STATES)?;
        let core = Arc::new_cyclic(|this| {
            Mutex::new(ListenerCore {
                machine,
                port,
                registry,
                registered: false,
                reconnect_delay: Duration::ZERO,
                timer: None,
                timer_epoch: 0,
                peer: None,
                sink: None,
                this: this.clone(),
            })
        });
        initialize(&mut *lock(&core))?;
        Ok(Self { core })
    }

    fn with_state<R>(
        &self,
        op: impl FnOnce(&dyn ListenerState, &mut ListenerCore) -> Result<R, StateError>,
    ) -> Result<R, StateError> {
        let mut core = lock(&self.core);
        let state = core.machine.current();
        op(state.as_ref(), &mut core)
    }

    /// Start listening after `delay_ms`; `0` listens immediately.
    pub fn reconnect(&self, delay_ms: u64) -> Result<(), StateError> {
        self.with_state(|state, core| state.reconnect(core, delay_ms))
    }

    pub fn stop(&self) -> Result<(), StateError> {
        self.with_state(|state, core| state.stop(core))
    }

    /// Hand an incoming peer to the listener. Frames passed to
    /// [`send`](Self::send) arrive on the returned receiver.
    pub fn accept(
        &self,
        peer: impl Into<String>,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, StateError> {
        let peer = peer.into();
        self.with_state(|state, core| state.accept(core, peer))
    }

    pub fn send(&self, frame: Vec<u8>) -> Result<(), StateError> {
        self.with_state(|state, core| state.send(core, frame))
    }

    pub fn disconnect(&self) -> Result<(), StateError> {
        self.with_state(|state, core| state.disconnect(core))
    }

    pub fn port(&self) -> u16 {
        lock(&self.core).port
    }

    pub fn is_available(&self) -> bool {
        matches!(lock(&self.core).machine.key(), LISTENING | CONNECTED)
    }
}

impl HealthProbe for Listener {
    fn state_name(&self) -> &'static str {
        lock(&self.core).machine.name()
    }

    fn classification(&self) -> StateClassification {
        lock(&self.core).machine.classification()
    }
}
