use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Identifier of a state, unique within one state map.
pub type StateKey = u16;

/// Engine-agnostic label of a state, read by health dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateClassification {
    Initializing,
    Running,
    Busy,
    Offline,
    Stopped,
    Failure,
}

impl fmt::Display for StateClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateClassification::Initializing => write!(f, "INITIALIZING"),
            StateClassification::Running => write!(f, "RUNNING"),
            StateClassification::Busy => write!(f, "BUSY"),
            StateClassification::Offline => write!(f, "OFFLINE"),
            StateClassification::Stopped => write!(f, "STOPPED"),
            StateClassification::Failure => write!(f, "FAILURE"),
        }
    }
}

/// One row of the registration table.
pub struct StateEntry<H: ?Sized> {
    pub key: StateKey,
    pub name: &'static str,
    pub initial: bool,
    pub classification: StateClassification,
    factory: fn() -> Arc<H>,
}

impl<H: ?Sized> StateEntry<H> {
    /// Construct a fresh handler for this state.
    pub fn create(&self) -> Arc<H> {
        (self.factory)()
    }
}

/// Registration table mapping state keys to handler factories.
///
/// Built once per handler base type, usually inside a `LazyLock` static:
///
/// ```ignore
/// static MAP: LazyLock<StateMap<dyn ListenerState>> = LazyLock::new(|| {
///     StateMap::new()
///         .initial(NOT_LISTENING, "NotListening", StateClassification::Offline, || {
///             Arc::new(NotListening) as Arc<dyn ListenerState>
///         })
///         .fallback(NOT_LISTENING)
/// });
/// ```
pub struct StateMap<H: ?Sized> {
    entries: Vec<StateEntry<H>>,
    fallback: Option<StateKey>,
}

impl<H: ?Sized> Default for StateMap<H> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            fallback: None,
        }
    }
}

impl<H: ?Sized> StateMap<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the initial state.
    pub fn initial(
        self,
        key: StateKey,
        name: &'static str,
        classification: StateClassification,
        factory: fn() -> Arc<H>,
    ) -> Self {
        self.push(key, name, true, classification, factory)
    }

    /// Declare a regular state.
    pub fn state(
        self,
        key: StateKey,
        name: &'static str,
        classification: StateClassification,
        factory: fn() -> Arc<H>,
    ) -> Self {
        self.push(key, name, false, classification, factory)
    }

    /// Declare the state a context falls back to when an enter hook fails.
    pub fn fallback(mut self, key: StateKey) -> Self {
        self.fallback = Some(key);
        self
    }

    fn push(
        mut self,
        key: StateKey,
        name: &'static str,
        initial: bool,
        classification: StateClassification,
        factory: fn() -> Arc<H>,
    ) -> Self {
        self.entries.push(StateEntry {
            key,
            name,
            initial,
            classification,
            factory,
        });
        self
    }

    /// Check that exactly one state is initial, keys are unique and the
    /// fallback (if any) is declared.
    pub fn validate(&self) -> Result<(), StateError> {
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.key) {
                return Err(StateError::DuplicateState(entry.key));
            }
        }
        match self.entries.iter().filter(|e| e.initial).count() {
            0 => return Err(StateError::NoInitialState),
            1 => {}
            _ => return Err(StateError::MultipleInitialStates),
        }
        if let Some(fallback) = self.fallback
            && !seen.contains(&fallback)
        {
            return Err(StateError::UnknownFallback(fallback));
        }
        Ok(())
    }

    pub fn entry(&self, key: StateKey) -> Result<&StateEntry<H>, StateError> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .ok_or(StateError::UnknownState(key))
    }

    pub fn initial_entry(&self) -> Result<&StateEntry<H>, StateError> {
        self.entries
            .iter()
            .find(|e| e.initial)
            .ok_or(StateError::NoInitialState)
    }

    pub fn fallback_key(&self) -> Option<StateKey> {
        self.fallback
    }

    pub fn keys(&self) -> impl Iterator<Item = StateKey> + '_ {
        self.entries.iter().map(|e| e.key)
    }
}

/// Read-only view on a context's state for health and telemetry.
pub trait HealthProbe {
    fn state_name(&self) -> &'static str;
    fn classification(&self) -> StateClassification;
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Dummy: Send + Sync {}
    struct A;
    impl Dummy for A {}

    fn make() -> Arc<dyn Dummy> {
        Arc::new(A)
    }

    #[test]
    fn valid_map_passes() {
        let map: StateMap<dyn Dummy> = StateMap::new()
            .initial(0, "Off", StateClassification::Offline, make)
            .state(1, "On", StateClassification::Running, make)
            .fallback(0);
        assert!(map.validate().is_ok());
        assert_eq!(map.initial_entry().unwrap().name, "Off");
        assert_eq!(map.entry(1).unwrap().classification, StateClassification::Running);
        assert_eq!(map.keys().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn missing_initial_is_rejected() {
        let map: StateMap<dyn Dummy> =
            StateMap::new().state(0, "Off", StateClassification::Offline, make);
        assert_eq!(map.validate(), Err(StateError::NoInitialState));
    }

    #[test]
    fn two_initials_are_rejected() {
        let map: StateMap<dyn Dummy> = StateMap::new()
            .initial(0, "Off", StateClassification::Offline, make)
            .initial(1, "On", StateClassification::Running, make);
        assert_eq!(map.validate(), Err(StateError::MultipleInitialStates));
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let map: StateMap<dyn Dummy> = StateMap::new()
            .initial(0, "Off", StateClassification::Offline, make)
            .state(0, "On", StateClassification::Running, make);
        assert_eq!(map.validate(), Err(StateError::DuplicateState(0)));
    }

    #[test]
    fn undeclared_fallback_is_rejected() {
        let map: StateMap<dyn Dummy> = StateMap::new()
            .initial(0, "Off", StateClassification::Offline, make)
            .fallback(7);
        assert_eq!(map.validate(), Err(StateError::UnknownFallback(7)));
    }

    #[test]
    fn unknown_key_lookup_fails() {
        let map: StateMap<dyn Dummy> =
            StateMap::new().initial(0, "Off", StateClassification::Offline, make);
        assert!(matches!(map.entry(3), Err(StateError::UnknownState(3))));
    }

    #[test]
    fn classification_display() {
        assert_eq!(StateClassification::Running.to_string(), "RUNNING");
        assert_eq!(StateClassification::Offline.to_string(), "OFFLINE");
    }
}
