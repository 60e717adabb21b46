//! Scripted scenarios: provider answers plus a timeline of commands and
//! external events, replayed against a live flow.

pub mod model;
pub mod reader;
pub mod runner;

use crate::infrastructure::in_memory::{
    OP_CANCEL, OP_CLIENT_CONFIRM, OP_CONFIRM, OP_FINALIZE, OP_START, OP_STATUS,
};

pub use model::{Scenario, ScriptedOutcome, Step};
pub use reader::ScenarioReader;
pub use runner::{ScenarioReport, run_scenario};

const OPERATIONS: [&str; 6] = [
    OP_START,
    OP_CONFIRM,
    OP_CANCEL,
    OP_STATUS,
    OP_CLIENT_CONFIRM,
    OP_FINALIZE,
];

/// Static name of a gateway operation.
fn operation(name: &str) -> Option<&'static str> {
    OPERATIONS.iter().copied().find(|op| *op == name)
}
