//! Application layer: the payment flow engine and the fallback orchestrator
//! that coordinates provider switches across flows.

pub mod fallback;
pub mod flow;
