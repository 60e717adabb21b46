//! Provider fallback: eligibility, offers, automatic execution and the bridge
//! that feeds decisions back into a running flow.

pub mod bridge;
pub mod orchestrator;
pub mod state;

pub use bridge::attach;
pub use orchestrator::FallbackOrchestrator;
pub use state::{
    CancelReason, FallbackConfig, FallbackEvent, FallbackMode, FallbackResponse, FallbackState,
    FallbackStatus,
};
