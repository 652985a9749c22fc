use std::collections::VecDeque;

use crate::workplan::{Connector, NodeClassification, NodeId, Token};

/// Observable state of a place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceState {
    Idle,
    Holding(usize),
    /// Paused while holding this many tokens.
    Paused(usize),
}

/// Token holder instantiated from a connector.
///
/// A place does not fire anything itself. `push` and `signal` report whether
/// the observing transitions should be evaluated now; while paused the place
/// counts those notifications instead and hands them back on `resume`.
#[derive(Debug)]
pub(crate) struct Place {
    pub connector: NodeId,
    pub name: String,
    pub classification: NodeClassification,
    /// Position among the workplan's exits, for exit places.
    pub exit_index: Option<usize>,
    tokens: VecDeque<Token>,
    observers: Vec<usize>,
    paused: bool,
    buffered: usize,
}

impl Place {
    pub fn new(connector: &Connector, exit_index: Option<usize>) -> Self {
        Self {
            connector: connector.id,
            name: connector.name.clone(),
            classification: connector.classification,
            exit_index,
            tokens: VecDeque::new(),
            observers: Vec::new(),
            paused: false,
            buffered: 0,
        }
    }

    pub fn observe(&mut self, transition: usize) {
        if !self.observers.contains(&transition) {
            self.observers.push(transition);
        }
    }

    pub fn observers(&self) -> &[usize] {
        &self.observers
    }

    pub fn state(&self) -> PlaceState {
        match (self.paused, self.tokens.len()) {
            (true, n) => PlaceState::Paused(n),
            (false, 0) => PlaceState::Idle,
            (false, n) => PlaceState::Holding(n),
        }
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Holds a token and is allowed to hand it on.
    pub fn can_forward(&self) -> bool {
        !self.paused && !self.tokens.is_empty()
    }

    pub fn push(&mut self, token: Token) -> bool {
        self.tokens.push_back(token);
        self.signal()
    }

    /// Put a token ahead of every held token.
    pub fn push_front(&mut self, token: Token) -> bool {
        self.tokens.push_front(token);
        self.signal()
    }

    /// Ask for the observers to be evaluated again.
    pub fn signal(&mut self) -> bool {
        if self.paused {
            self.buffered += 1;
            return false;
        }
        true
    }

    pub fn take(&mut self) -> Option<Token> {
        if self.paused {
            return None;
        }
        self.tokens.pop_front()
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Leave the paused state; returns how many notifications to replay.
    pub fn resume(&mut self) -> usize {
        self.paused = false;
        std::mem::take(&mut self.buffered)
    }
}
