use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::activity::{ActivityExecutor, ActivityRequest, ActivityResult};
use super::event::{InstanceEvent, InstanceOutcome, InstanceStatus};
use super::lifecycle::{LIFECYCLE, LifecycleState, RUNNING, status_of};
use super::place::{Place, PlaceState};
use super::snapshot::{InstanceSnapshot, PendingHandoff, PlaceSnapshot, TransitionSnapshot};
use super::transition::{Firing, Transition};
use crate::error::{EngineError, WorkplanError};
use crate::state_machine::{
    HealthProbe, StateClassification, StateContext, StateMachine, initialize,
};
use crate::workplan::{NodeId, StepKind, Token, Workplan};

/// Collaborators shared by an instance and every instance nested in it.
#[derive(Clone)]
pub(crate) struct Services {
    pub executor: Arc<dyn ActivityExecutor>,
    pub events: broadcast::Sender<InstanceEvent>,
}

/// The transition of a parent instance that runs this instance.
pub(crate) struct ParentLink {
    pub core: Weak<Mutex<InstanceCore>>,
    pub transition: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cascade {
    Pause,
    Resume,
    Abort,
}

/// Work an instance hands out once its lock is released.
pub(crate) enum Launch {
    Activity {
        instance: Weak<Mutex<InstanceCore>>,
        transition: usize,
        request: ActivityRequest,
        executor: Arc<dyn ActivityExecutor>,
        cancel: CancellationToken,
    },
    StartChild {
        parent: Weak<Mutex<InstanceCore>>,
        child: InstanceHandle,
        token: Token,
    },
    Handoff {
        parent: Weak<Mutex<InstanceCore>>,
        transition: usize,
        exit: usize,
        token: Token,
    },
    ParentFault {
        parent: Weak<Mutex<InstanceCore>>,
        error: EngineError,
    },
    Cascade {
        children: Vec<InstanceHandle>,
        action: Cascade,
    },
}

/// Places, transitions and lifecycle of one instance. Only reachable
/// through the instance lock.
pub(crate) struct InstanceCore {
    machine: StateMachine<dyn LifecycleState>,
    pub id: Uuid,
    pub workplan: Arc<Workplan>,
    pub start: usize,
    pub places: Vec<Place>,
    pub transitions: Vec<Transition>,
    /// Places whose observers must be evaluated, in arrival order.
    pub pending: VecDeque<usize>,
    pub outcome: Option<InstanceOutcome>,
    pub error: Option<EngineError>,
    /// Exit position and token handed to the parent, kept so a snapshot
    /// taken before the parent picks the token up still records it.
    pub handed_off: Option<(usize, Token)>,
    outbox: Vec<Launch>,
    services: Services,
    status: watch::Sender<InstanceStatus>,
    cancel: CancellationToken,
    parent: Option<ParentLink>,
    this: Weak<Mutex<InstanceCore>>,
}

impl StateContext for InstanceCore {
    type State = dyn LifecycleState;

    fn machine(&self) -> &StateMachine<dyn LifecycleState> {
        &self.machine
    }

    fn machine_mut(&mut self) -> &mut StateMachine<dyn LifecycleState> {
        &mut self.machine
    }
}

pub(crate) fn lock(core: &Mutex<InstanceCore>) -> MutexGuard<'_, InstanceCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InstanceCore {
    /// Wire places and transitions for `workplan`. The instance starts in
    /// `Created`.
    pub fn create(
        id: Uuid,
        workplan: Arc<Workplan>,
        services: Services,
        cancel: CancellationToken,
        parent: Option<ParentLink>,
    ) -> Result<InstanceHandle, EngineError> {
        if !workplan.is_released() {
            return Err(WorkplanError::NotReleased(workplan.name.clone()).into());
        }
        // The released flag is serialized; loaded graphs are checked again.
        workplan.validate()?;

        let exits: HashMap<NodeId, usize> = workplan
            .exits()
            .enumerate()
            .map(|(index, exit)| (exit.id, index))
            .collect();
        let mut places: Vec<Place> = workplan
            .connectors()
            .iter()
            .map(|c| Place::new(c, exits.get(&c.id).copied()))
            .collect();
        let index: HashMap<NodeId, usize> = places
            .iter()
            .enumerate()
            .map(|(i, p)| (p.connector, i))
            .collect();
        let transitions = workplan
            .steps()
            .iter()
            .map(|step| Transition::new(step, &index))
            .collect::<Result<Vec<_>, _>>()?;
        for (t, transition) in transitions.iter().enumerate() {
            for &input in &transition.inputs {
                places[input].observe(t);
            }
        }
        let start = workplan
            .start()
            .and_then(|c| index.get(&c.id))
            .copied()
            .ok_or_else(|| WorkplanError::MissingStart(workplan.name.clone()))?;

        let machine = StateMachine::new(&LIFECYCLE)?;
        let (status, _) = watch::channel(InstanceStatus::Created);
        let core = Arc::new_cyclic(|this| {
            Mutex::new(InstanceCore {
                machine,
                id,
                workplan,
                start,
                places,
                transitions,
                pending: VecDeque::new(),
                outcome: None,
                error: None,
                handed_off: None,
                outbox: Vec::new(),
                services,
                status,
                cancel,
                parent,
                this: this.clone(),
            })
        });
        initialize(&mut *lock(&core))?;
        Ok(InstanceHandle { id, core })
    }

    pub fn state_name(&self) -> &'static str {
        self.machine.name()
    }

    pub fn status(&self) -> InstanceStatus {
        status_of(self.machine.key())
    }

    pub fn place_index(&self, connector: NodeId) -> Option<usize> {
        self.places.iter().position(|p| p.connector == connector)
    }

    pub fn transition_index(&self, step: NodeId) -> Option<usize> {
        self.transitions.iter().position(|t| t.step.id == step)
    }

    pub fn publish_status(&self) {
        self.status.send_replace(self.status());
    }

    pub fn emit(&self, event: InstanceEvent) {
        // No subscribers is fine.
        let _ = self.services.events.send(event);
    }

    pub fn cascade(&mut self, action: Cascade) {
        let children: Vec<InstanceHandle> = self
            .transitions
            .iter()
            .filter_map(|t| t.child.clone())
            .collect();
        if !children.is_empty() {
            self.outbox.push(Launch::Cascade { children, action });
        }
    }

    /// Stop running activities and nested instances.
    pub fn shut_down(&mut self) {
        self.cancel.cancel();
        self.pending.clear();
        self.cascade(Cascade::Abort);
    }

    pub fn notify_parent_fault(&mut self, error: EngineError) {
        if let Some(parent) = &self.parent {
            self.outbox.push(Launch::ParentFault {
                parent: parent.core.clone(),
                error,
            });
        }
    }

    fn take_outbox(&mut self) -> Vec<Launch> {
        std::mem::take(&mut self.outbox)
    }

    pub fn add_token(&mut self, place: usize, token: Token) {
        self.emit(InstanceEvent::TokenAdded {
            instance: self.id,
            connector: self.places[place].connector,
            token: token.id,
        });
        debug!(instance = %self.id, place = %self.places[place].name, token = %token.name, "token added");
        if self.places[place].push(token) {
            self.pending.push_back(place);
        }
    }

    fn token_removed(&self, place: usize, token: Uuid) {
        self.emit(InstanceEvent::TokenRemoved {
            instance: self.id,
            connector: self.places[place].connector,
            token,
        });
    }

    /// Re-evaluate the inputs of a transition that finished executing.
    fn retry_inputs(&mut self, transition: usize) {
        for position in 0..self.transitions[transition].inputs.len() {
            let input = self.transitions[transition].inputs[position];
            if !self.places[input].is_empty() && self.places[input].signal() {
                self.pending.push_back(input);
            }
        }
    }

    fn fail(&mut self, error: EngineError) {
        let state = self.machine.current();
        if let Err(err) = state.fault(self, error) {
            debug!(instance = %self.id, error = %err, "fault ignored");
        }
    }

    /// Evaluate pending places until none is left or the instance stops
    /// running.
    fn pump(&mut self) {
        while self.machine.key() == RUNNING {
            let Some(place) = self.pending.pop_front() else {
                return;
            };
            if self.places[place].classification.is_exit() {
                self.reach_exit(place);
                continue;
            }
            let observers = self.places[place].observers().to_vec();
            for transition in observers {
                match self.transitions[transition].try_fire(&mut self.places) {
                    Ok(Some(firing)) => self.fired(transition, firing),
                    Ok(None) => {}
                    Err(err) => {
                        debug!(instance = %self.id, step = self.transitions[transition].name(), error = %err, "token stays queued");
                    }
                }
            }
        }
    }

    fn reach_exit(&mut self, place: usize) {
        let exit = &self.places[place];
        let Some(token) = exit.tokens().next().map(|t| t.id) else {
            return;
        };
        self.outcome = Some(InstanceOutcome {
            instance: self.id,
            connector: exit.connector,
            name: exit.name.clone(),
            classification: exit.classification,
            token,
        });
        let handoff = match (&self.parent, exit.exit_index) {
            (Some(parent), Some(index)) => Some((parent.core.clone(), parent.transition, index)),
            _ => None,
        };

        let state = self.machine.current();
        if let Err(err) = state.complete(self) {
            warn!(instance = %self.id, error = %err, "completion rejected");
            return;
        }
        // The token leaves a nested instance through its parent's output.
        if let Some((parent, transition, exit)) = handoff
            && let Some(token) = self.places[place].take()
        {
            self.token_removed(place, token.id);
            self.handed_off = Some((exit, token.clone()));
            self.outbox.push(Launch::Handoff {
                parent,
                transition,
                exit,
                token,
            });
        }
    }

    fn fired(&mut self, transition: usize, firing: Firing) {
        let inputs = self.transitions[transition].inputs.clone();
        let step = self.transitions[transition].step.id;
        match firing {
            Firing::Produced { consumed, produced } => {
                for (&place, token) in inputs.iter().zip(&consumed) {
                    self.token_removed(place, *token);
                }
                debug!(instance = %self.id, step = self.transitions[transition].name(), consumed = consumed.len(), produced = produced.len(), "transition fired");
                self.emit(InstanceEvent::TransitionFired {
                    instance: self.id,
                    step,
                    consumed: consumed.len(),
                    produced: produced.len(),
                });
                for (position, token) in produced {
                    let Some(&output) = self.transitions[transition].outputs.get(position) else {
                        let step = self.transitions[transition].step.name.clone();
                        self.fail(EngineError::Activity {
                            step,
                            message: format!("no output at position {position}"),
                        });
                        return;
                    };
                    self.add_token(output, token);
                }
            }
            Firing::Activity(token) => {
                self.token_removed(inputs[0], token.id);
                self.emit(InstanceEvent::ActivityStarted {
                    instance: self.id,
                    step,
                    name: self.transitions[transition].step.name.clone(),
                    token: token.id,
                });
                self.launch_activity(transition, token);
            }
            Firing::Nested(token) => {
                self.token_removed(inputs[0], token.id);
                self.launch_child(transition, token);
            }
        }
    }

    fn launch_activity(&mut self, transition: usize, token: Token) {
        let t = &mut self.transitions[transition];
        let StepKind::Task {
            activity,
            parameters,
            ..
        } = &t.step.kind
        else {
            return;
        };
        debug!(instance = %self.id, step = %t.step.name, activity = %activity, token = %token.name, "activity started");
        let request = ActivityRequest {
            instance: self.id,
            step: t.step.id,
            step_name: t.step.name.clone(),
            activity: activity.clone(),
            parameters: parameters.clone(),
            token: token.clone(),
        };
        t.in_flight = Some(token);
        self.outbox.push(Launch::Activity {
            instance: self.this.clone(),
            transition,
            request,
            executor: Arc::clone(&self.services.executor),
            cancel: self.cancel.clone(),
        });
    }

    fn launch_child(&mut self, transition: usize, token: Token) {
        let StepKind::Subworkplan { workplan } = &self.transitions[transition].step.kind else {
            return;
        };
        let child = InstanceCore::create(
            Uuid::new_v4(),
            Arc::clone(workplan),
            self.services.clone(),
            self.cancel.child_token(),
            Some(ParentLink {
                core: self.this.clone(),
                transition,
            }),
        );
        match child {
            Ok(child) => {
                debug!(instance = %self.id, child = %child.id, step = self.transitions[transition].name(), "nested instance created");
                self.transitions[transition].child = Some(child.clone());
                self.outbox.push(Launch::StartChild {
                    parent: self.this.clone(),
                    child,
                    token,
                });
            }
            Err(err) => {
                self.transitions[transition].in_flight = Some(token);
                self.fail(err);
            }
        }
    }

    fn activity_finished(&mut self, transition: usize, result: anyhow::Result<ActivityResult>) {
        if self.status().is_terminal() {
            return;
        }
        let t = &mut self.transitions[transition];
        let Some(token) = t.in_flight.take() else {
            return;
        };
        let step = t.step.id;
        let name = t.step.name.clone();

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                t.in_flight = Some(token);
                self.fail(EngineError::Activity {
                    step: name,
                    message: format!("{err:#}"),
                });
                return;
            }
        };
        let Some(output) = t
            .step
            .resolve_output(result.classification, result.code)
            .filter(|&o| o < t.outputs.len())
        else {
            t.in_flight = Some(token);
            self.fail(EngineError::Activity {
                message: format!("no output accepts a {} result", result.classification),
                step: name,
            });
            return;
        };

        t.executing = false;
        t.internal_state = result.payload;
        let place = t.outputs[output];
        debug!(instance = %self.id, step = %name, token = %token.name, output, "activity completed");
        self.emit(InstanceEvent::ActivityCompleted {
            instance: self.id,
            step,
            name,
            token: token.id,
            output,
        });
        self.emit(InstanceEvent::TransitionFired {
            instance: self.id,
            step,
            consumed: 1,
            produced: 1,
        });
        self.add_token(place, token);
        self.retry_inputs(transition);
        self.pump();
    }

    fn child_finished(&mut self, transition: usize, exit: usize, token: Token) {
        if self.status().is_terminal() {
            return;
        }
        let t = &mut self.transitions[transition];
        if !t.executing {
            return;
        }
        t.executing = false;
        t.child = None;
        let step = t.step.id;
        let Some(&place) = t.outputs.get(exit) else {
            let name = t.step.name.clone();
            self.fail(EngineError::Activity {
                step: name,
                message: format!("nested instance left through unknown exit {exit}"),
            });
            return;
        };
        self.emit(InstanceEvent::TransitionFired {
            instance: self.id,
            step,
            consumed: 1,
            produced: 1,
        });
        self.add_token(place, token);
        self.retry_inputs(transition);
        self.pump();
    }

    /// Copy of places and transitions. Nested instances are collected
    /// separately so their locks are never taken under this one.
    fn snapshot_shallow(&self) -> (InstanceSnapshot, Vec<(usize, InstanceHandle)>) {
        let places = self
            .places
            .iter()
            .map(|p| PlaceSnapshot {
                connector: p.connector,
                tokens: p.tokens().cloned().collect(),
            })
            .collect();
        let mut children = Vec::new();
        let transitions = self
            .transitions
            .iter()
            .enumerate()
            .map(|(index, t)| {
                if let Some(child) = &t.child {
                    children.push((index, child.clone()));
                }
                TransitionSnapshot {
                    step: t.step.id,
                    fired: t.fired,
                    internal_state: t.internal_state.clone(),
                    in_flight: t.in_flight.clone(),
                    child: None,
                    handoff: None,
                }
            })
            .collect();
        let snapshot = InstanceSnapshot {
            instance: self.id,
            workplan: self.workplan.id,
            version: self.workplan.version,
            status: self.status(),
            taken_at: chrono::Utc::now(),
            places,
            transitions,
        };
        (snapshot, children)
    }
}

/// Handle to a running workplan instance. Cheap to clone.
///
/// Every operation takes the instance lock, lets the active lifecycle state
/// handle it and pumps pending tokens; activities and nested instances are
/// started after the lock is released.
#[derive(Clone)]
pub struct InstanceHandle {
    id: Uuid,
    core: Arc<Mutex<InstanceCore>>,
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle").field("id", &self.id).finish()
    }
}

impl InstanceHandle {
    fn from_core(core: Arc<Mutex<InstanceCore>>) -> Self {
        let id = lock(&core).id;
        Self { id, core }
    }

    pub(crate) fn core(&self) -> &Arc<Mutex<InstanceCore>> {
        &self.core
    }

    fn with_core<R>(&self, op: impl FnOnce(&mut InstanceCore) -> R) -> R {
        let (result, launches) = {
            let mut core = lock(&self.core);
            let result = op(&mut core);
            (result, core.take_outbox())
        };
        dispatch(launches);
        result
    }

    fn with_state(
        &self,
        op: impl FnOnce(&dyn LifecycleState, &mut InstanceCore) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        self.with_core(|core| {
            let state = core.machine.current();
            let result = op(state.as_ref(), core);
            core.pump();
            result
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn workplan(&self) -> Arc<Workplan> {
        Arc::clone(&lock(&self.core).workplan)
    }

    /// Put `token` on the start place and begin firing.
    pub fn start(&self, token: Token) -> Result<(), EngineError> {
        self.with_state(|state, core| state.start(core, token))
    }

    /// Add another token to the start place of a running or paused instance.
    pub fn inject(&self, token: Token) -> Result<(), EngineError> {
        self.with_state(|state, core| state.inject(core, token))
    }

    /// Freeze token forwarding. Running activities finish, their output
    /// tokens wait in the paused places. Nested instances pause as well.
    pub fn pause(&self) -> Result<(), EngineError> {
        self.with_state(|state, core| state.pause(core))
    }

    /// Replay everything that arrived while paused, in arrival order.
    pub fn resume(&self) -> Result<(), EngineError> {
        self.with_state(|state, core| state.resume(core))
    }

    /// Stop the instance and every nested instance. Running activities are
    /// cancelled and their results dropped.
    pub fn abort(&self) -> Result<(), EngineError> {
        self.with_state(|state, core| state.abort(core))
    }

    pub(crate) fn hold(&self) -> Result<(), EngineError> {
        self.with_state(|state, core| state.hold(core))
    }

    pub fn status(&self) -> InstanceStatus {
        lock(&self.core).status()
    }

    /// Wait until the instance reaches a terminal state.
    pub async fn completion(&self) -> Result<InstanceOutcome, EngineError> {
        let mut status = lock(&self.core).status.subscribe();
        let reached = *status
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| EngineError::Aborted)?;
        let core = lock(&self.core);
        match reached {
            InstanceStatus::Completed => core
                .outcome
                .clone()
                .ok_or_else(|| EngineError::Snapshot("completed without outcome".into())),
            InstanceStatus::Faulted => Err(core.error.clone().unwrap_or(EngineError::Aborted)),
            _ => Err(EngineError::Aborted),
        }
    }

    /// Tokens currently held by the place of `connector`, oldest first.
    pub fn tokens_at(&self, connector: NodeId) -> Vec<Token> {
        let core = lock(&self.core);
        core.place_index(connector)
            .map(|p| core.places[p].tokens().cloned().collect())
            .unwrap_or_default()
    }

    pub fn place_state(&self, connector: NodeId) -> Option<PlaceState> {
        let core = lock(&self.core);
        core.place_index(connector).map(|p| core.places[p].state())
    }

    /// Events of this instance and of every instance nested in it.
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        lock(&self.core).services.events.subscribe()
    }

    /// Capture places, transitions and nested instances. Take it while
    /// paused for a consistent picture across nesting levels.
    ///
    /// A nested instance that already finished but whose token has not yet
    /// reached this instance is recorded as a pending handoff instead.
    pub fn snapshot(&self) -> InstanceSnapshot {
        let (mut snapshot, children) = lock(&self.core).snapshot_shallow();
        for (index, child) in children {
            let handed_off = lock(child.core()).handed_off.clone();
            let transition = &mut snapshot.transitions[index];
            match handed_off {
                Some((exit, token)) => transition.handoff = Some(PendingHandoff { exit, token }),
                None => transition.child = Some(Box::new(child.snapshot())),
            }
        }
        snapshot
    }

    fn finish_activity(&self, transition: usize, result: anyhow::Result<ActivityResult>) {
        self.with_core(|core| core.activity_finished(transition, result));
    }

    fn finish_child(&self, transition: usize, exit: usize, token: Token) {
        self.with_core(|core| core.child_finished(transition, exit, token));
    }

    fn fail(&self, error: EngineError) {
        self.with_core(|core| core.fail(error));
    }
}

impl HealthProbe for InstanceHandle {
    fn state_name(&self) -> &'static str {
        lock(&self.core).state_name()
    }

    fn classification(&self) -> StateClassification {
        lock(&self.core).machine.classification()
    }
}

fn upgrade(core: &Weak<Mutex<InstanceCore>>) -> Option<InstanceHandle> {
    core.upgrade().map(InstanceHandle::from_core)
}

fn dispatch(launches: Vec<Launch>) {
    for launch in launches {
        match launch {
            Launch::Activity {
                instance,
                transition,
                request,
                executor,
                cancel,
            } => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    if let Some(handle) = upgrade(&instance) {
                        handle.fail(EngineError::Activity {
                            step: request.step_name,
                            message: "no async runtime to run the activity".into(),
                        });
                    }
                    continue;
                };
                runtime.spawn(async move {
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        result = executor.execute(request) => result,
                    };
                    if let Some(handle) = upgrade(&instance) {
                        handle.finish_activity(transition, result);
                    }
                });
            }
            Launch::StartChild {
                parent,
                child,
                token,
            } => {
                let started = child.start(token);
                let Some(parent) = upgrade(&parent) else {
                    continue;
                };
                match started {
                    Ok(()) => {
                        if parent.status() == InstanceStatus::Paused {
                            let _ = child.pause();
                        }
                    }
                    Err(err) => parent.fail(err),
                }
            }
            Launch::Handoff {
                parent,
                transition,
                exit,
                token,
            } => {
                if let Some(parent) = upgrade(&parent) {
                    parent.finish_child(transition, exit, token);
                }
            }
            Launch::ParentFault { parent, error } => {
                if let Some(parent) = upgrade(&parent) {
                    parent.fail(error);
                }
            }
            Launch::Cascade { children, action } => {
                for child in children {
                    let result = match action {
                        Cascade::Pause => child.pause(),
                        Cascade::Resume => child.resume(),
                        Cascade::Abort => child.abort(),
                    };
                    if let Err(err) = result {
                        debug!(child = %child.id, ?action, error = %err, "cascade skipped");
                    }
                }
            }
        }
    }
}
