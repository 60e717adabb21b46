//! Payment flow state machine.
//!
//! # Data Flow
//! ```text
//! FlowHandle::send / notify
//!     → runtime.rs (actor queue, one event at a time)
//!     → machine.rs (transition table, guards in policy.rs)
//!     → Effects: provider calls, timers, notices, replays
//!     → runtime.rs (results and timer ticks re-enter the queue with tokens)
//! ```

pub mod config;
pub mod context;
pub mod events;
pub mod machine;
pub mod policy;
pub mod runtime;
pub mod state;

pub use config::FlowConfig;
pub use context::FlowMachineContext;
pub use events::{Command, FlowNotice, SystemEvent};
pub use runtime::{FlowDeps, FlowHandle};
pub use state::{FlowSnapshot, FlowState, StateTag};
