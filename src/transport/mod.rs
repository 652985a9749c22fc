//! Long-lived contexts driven by the state machine runtime.

pub mod delay_queue;
pub mod listener;

pub use delay_queue::DelayQueue;
pub use listener::{ConnectionRegistry, Listener, PortRegistry};
