//! Process graph definitions: connectors, steps and the tokens that flow
//! through them.

mod model;
mod step;
mod token;

pub use model::{Connector, NodeClassification, NodeId, Workplan, WorkplanState};
pub use step::{OutputClassification, OutputDescription, Step, StepKind};
pub use token::{Token, TokenKind};
