//! forgeflow: a generic state machine runtime and a Petri-net workplan
//! engine for manufacturing execution.
//!
//! - [`state_machine`] runs any context through a declared map of state
//!   handlers, synchronously or with async hooks.
//! - [`workplan`] describes process graphs; [`engine`] runs them as
//!   instances that move tokens between places.
//! - [`transport`] holds long-lived contexts built on the runtime.

pub mod config;
pub mod demo;
pub mod engine;
pub mod error;
pub mod logging;
pub mod repository;
pub mod state_machine;
pub mod transport;
pub mod workplan;
