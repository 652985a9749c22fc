pub mod asynchronous;
mod machine;
mod map;

pub use asynchronous::{AsyncStateContext, AsyncStateHandler};
pub use machine::{StateContext, StateHandler, StateMachine, initialize, invalid_state, next_state};
pub use map::{HealthProbe, StateClassification, StateEntry, StateKey, StateMap};
