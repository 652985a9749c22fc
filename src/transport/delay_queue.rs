//! Delay queue that spaces out deliveries by a minimum interval.
//!
//! Driven by the asynchronous state machine. Handlers only see the
//! non-generic [`QueueControl`]; they decide how many buffered items may be
//! released and the generic [`DelayQueue`] moves those items to the receiver.

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StateError;
use crate::state_machine::asynchronous::{initialize, invalid_state, next_state};
use crate::state_machine::{
    AsyncStateContext, AsyncStateHandler, StateClassification, StateKey, StateMachine, StateMap,
};

pub const STOPPED: StateKey = 0;
pub const IDLE: StateKey = 1;
pub const WAITING: StateKey = 2;

pub struct QueueControl {
    machine: StateMachine<dyn QueueState>,
    delay: Duration,
    last_release: Instant,
    pending: usize,
    releasable: usize,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
    ticks: mpsc::UnboundedSender<u64>,
}

impl AsyncStateContext for QueueControl {
    type State = dyn QueueState;

    fn machine(&self) -> &StateMachine<dyn QueueState> {
        &self.machine
    }

    fn machine_mut(&mut self) -> &mut StateMachine<dyn QueueState> {
        &mut self.machine
    }
}

impl QueueControl {
    fn release_one(&mut self) {
        if self.pending > 0 {
            self.pending -= 1;
            self.releasable += 1;
            self.last_release = Instant::now();
        }
    }

    fn due(&self) -> Instant {
        self.last_release + self.delay
    }
}

#[async_trait]
pub trait QueueState: AsyncStateHandler<QueueControl> {
    async fn start(&self, ctx: &mut QueueControl, cancel: &CancellationToken) -> Result<(), StateError> {
        let _ = cancel;
        Err(invalid_state(ctx, "start"))
    }

    async fn stop(&self, ctx: &mut QueueControl, cancel: &CancellationToken) -> Result<(), StateError> {
        let _ = cancel;
        Err(invalid_state(ctx, "stop"))
    }

    /// Called after a new item was buffered.
    async fn enqueue(&self, ctx: &mut QueueControl, cancel: &CancellationToken) -> Result<(), StateError> {
        let _ = cancel;
        Err(invalid_state(ctx, "enqueue"))
    }

    async fn elapsed(
        &self,
        ctx: &mut QueueControl,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Result<(), StateError> {
        let _ = (epoch, cancel);
        Err(invalid_state(ctx, "elapsed"))
    }
}

struct Stopped;

#[async_trait]
impl AsyncStateHandler<QueueControl> for Stopped {
    async fn on_enter(&self, ctx: &mut QueueControl) -> Result<(), StateError> {
        ctx.pending = 0;
        if let Some(timer) = ctx.timer.take() {
            timer.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl QueueState for Stopped {
    async fn start(&self, ctx: &mut QueueControl, cancel: &CancellationToken) -> Result<(), StateError> {
        ctx.last_release = Instant::now();
        next_state(ctx, IDLE, cancel).await
    }
}

struct Idle;

impl AsyncStateHandler<QueueControl> for Idle {}

#[async_trait]
impl QueueState for Idle {
    async fn stop(&self, ctx: &mut QueueControl, cancel: &CancellationToken) -> Result<(), StateError> {
        next_state(ctx, STOPPED, cancel).await
    }

    async fn enqueue(&self, ctx: &mut QueueControl, cancel: &CancellationToken) -> Result<(), StateError> {
        if Instant::now() >= ctx.due() {
            ctx.release_one();
            return Ok(());
        }
        next_state(ctx, WAITING, cancel).await
    }
}

struct Waiting;

#[async_trait]
impl AsyncStateHandler<QueueControl> for Waiting {
    async fn on_enter(&self, ctx: &mut QueueControl) -> Result<(), StateError> {
        ctx.epoch += 1;
        let epoch = ctx.epoch;
        let due = ctx.due();
        let ticks = ctx.ticks.clone();
        ctx.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(due).await;
            let _ = ticks.send(epoch);
        }));
        Ok(())
    }

    async fn on_exit(&self, ctx: &mut QueueControl) -> Result<(), StateError> {
        if let Some(timer) = ctx.timer.take() {
            timer.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl QueueState for Waiting {
    async fn stop(&self, ctx: &mut QueueControl, cancel: &CancellationToken) -> Result<(), StateError> {
        next_state(ctx, STOPPED, cancel).await
    }

    async fn enqueue(&self, _ctx: &mut QueueControl, _cancel: &CancellationToken) -> Result<(), StateError> {
        Ok(())
    }

    async fn elapsed(
        &self,
        ctx: &mut QueueControl,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Result<(), StateError> {
        if epoch != ctx.epoch {
            return Err(invalid_state(ctx, "elapsed"));
        }
        ctx.release_one();
        if ctx.pending > 0 {
            next_state(ctx, WAITING, cancel).await
        } else {
            next_state(ctx, IDLE, cancel).await
        }
    }
}

static QUEUE_STATES: LazyLock<StateMap<dyn QueueState>> = LazyLock::new(|| {
    StateMap::new()
        .initial(STOPPED, "Stopped", StateClassification::Stopped, || {
            Arc::new(Stopped) as Arc<dyn QueueState>
        })
        .state(IDLE, "Idle", StateClassification::Running, || {
            Arc::new(Idle) as Arc<dyn QueueState>
        })
        .state(WAITING, "Waiting", StateClassification::Busy, || {
            Arc::new(Waiting) as Arc<dyn QueueState>
        })
        .fallback(STOPPED)
});

struct QueueCore<T> {
    control: QueueControl,
    items: VecDeque<T>,
    out: mpsc::UnboundedSender<T>,
    ticks: Option<mpsc::UnboundedReceiver<u64>>,
}

impl<T> QueueCore<T> {
    /// Deliver released items and drop the ones discarded by a stop.
    fn flush(&mut self) {
        for _ in 0..std::mem::take(&mut self.control.releasable) {
            let Some(item) = self.items.pop_front() else {
                break;
            };
            if self.out.send(item).is_err() {
                debug!("delay queue receiver dropped");
            }
        }
        self.items.truncate(self.control.pending);
    }
}

/// Queue releasing at most one item per `delay`.
pub struct DelayQueue<T: Send + 'static> {
    core: Arc<Mutex<QueueCore<T>>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> DelayQueue<T> {
    /// Create a stopped queue and the receiver its items are delivered to.
    pub async fn new(delay: Duration) -> Result<(Self, mpsc::UnboundedReceiver<T>), StateError> {
        let (out, rx) = mpsc::unbounded_channel();
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let mut control = QueueControl {
            machine: StateMachine::new(&QUEUE_STATES)?,
            delay,
            last_release: Instant::now(),
            pending: 0,
            releasable: 0,
            epoch: 0,
            timer: None,
            ticks: ticks_tx,
        };
        let cancel = CancellationToken::new();
        initialize(&mut control, &cancel).await?;
        let core = Arc::new(Mutex::new(QueueCore {
            control,
            items: VecDeque::new(),
            out,
            ticks: Some(ticks_rx),
        }));
        Ok((Self { core, cancel }, rx))
    }

    pub async fn start(&self) -> Result<(), StateError> {
        let mut core = self.core.lock().await;
        let state = core.control.machine.current();
        state.start(&mut core.control, &self.cancel).await?;
        if let Some(ticks) = core.ticks.take() {
            tokio::spawn(drive(Arc::downgrade(&self.core), ticks, self.cancel.clone()));
        }
        Ok(())
    }

    /// Stop the queue; buffered items are discarded.
    pub async fn stop(&self) -> Result<(), StateError> {
        let mut core = self.core.lock().await;
        let state = core.control.machine.current();
        state.stop(&mut core.control, &self.cancel).await?;
        core.flush();
        Ok(())
    }

    pub async fn enqueue(&self, item: T) -> Result<(), StateError> {
        let mut core = self.core.lock().await;
        core.items.push_back(item);
        core.control.pending += 1;
        let state = core.control.machine.current();
        if let Err(err) = state.enqueue(&mut core.control, &self.cancel).await {
            core.items.pop_back();
            core.control.pending = core.control.pending.saturating_sub(1);
            return Err(err);
        }
        core.flush();
        Ok(())
    }

    pub async fn pending(&self) -> usize {
        self.core.lock().await.items.len()
    }

    pub async fn state_name(&self) -> &'static str {
        self.core.lock().await.control.machine.name()
    }

    pub async fn classification(&self) -> StateClassification {
        self.core.lock().await.control.machine.classification()
    }
}

impl<T: Send + 'static> Drop for DelayQueue<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive<T: Send + 'static>(
    shared: Weak<Mutex<QueueCore<T>>>,
    mut ticks: mpsc::UnboundedReceiver<u64>,
    cancel: CancellationToken,
) {
    loop {
        let epoch = tokio::select! {
            _ = cancel.cancelled() => return,
            epoch = ticks.recv() => match epoch {
                Some(epoch) => epoch,
                None => return,
            },
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut core = shared.lock().await;
        let state = core.control.machine.current();
        match state.elapsed(&mut core.control, epoch, &cancel).await {
            Ok(()) => core.flush(),
            Err(err) => debug!(error = %err, "delay timer dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(100);

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_item_waits_for_delay_after_start() {
        let (queue, mut rx) = DelayQueue::new(DELAY).await.unwrap();
        queue.start().await.unwrap();

        advance(10).await;
        queue.enqueue("first").await.unwrap();
        assert_eq!(queue.state_name().await, "Waiting");

        advance(89).await;
        assert!(rx.try_recv().is_err());

        advance(2).await;
        assert_eq!(rx.try_recv().unwrap(), "first");
        assert_eq!(queue.state_name().await, "Idle");
    }

    #[tokio::test(start_paused = true)]
    async fn second_item_is_buffered_until_first_completes() {
        let (queue, mut rx) = DelayQueue::new(DELAY).await.unwrap();
        queue.start().await.unwrap();

        advance(10).await;
        queue.enqueue(1).await.unwrap();
        advance(10).await;
        queue.enqueue(2).await.unwrap();
        assert_eq!(queue.pending().await, 2);

        advance(81).await;
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.pending().await, 1);

        advance(98).await;
        assert!(rx.try_recv().is_err());
        advance(2).await;
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(queue.state_name().await, "Idle");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_queue_delivers_immediately_once_delay_passed() {
        let (queue, mut rx) = DelayQueue::new(DELAY).await.unwrap();
        queue.start().await.unwrap();
        advance(150).await;

        queue.enqueue("now").await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), "now");
        assert_eq!(queue.state_name().await, "Idle");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_discards_buffered_items() {
        let (queue, mut rx) = DelayQueue::new(DELAY).await.unwrap();
        queue.start().await.unwrap();
        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();
        queue.stop().await.unwrap();

        assert_eq!(queue.pending().await, 0);
        assert_eq!(queue.classification().await, StateClassification::Stopped);
        advance(500).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn enqueue_on_stopped_queue_is_rejected() {
        let (queue, _rx) = DelayQueue::<u32>::new(DELAY).await.unwrap();
        let err = queue.enqueue(7).await.unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidState {
                state: "Stopped",
                operation: "enqueue"
            }
        );
        assert_eq!(queue.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_keeps_working() {
        let (queue, mut rx) = DelayQueue::new(DELAY).await.unwrap();
        queue.start().await.unwrap();
        queue.stop().await.unwrap();
        queue.start().await.unwrap();
        queue.enqueue('a').await.unwrap();
        advance(101).await;
        assert_eq!(rx.try_recv().unwrap(), 'a');
    }
}
