use super::context::FlowMachineContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    #[default]
    Idle,
    Starting,
    Confirming,
    Cancelling,
    FetchingStatus,
    StatusRetrying,
    Polling,
    RequiresAction,
    ClientConfirming,
    Finalizing,
    Reconciling,
    Done,
    Failed,
    FallbackCandidate,
    FallbackConfirming,
}

impl FlowState {
    /// States with a provider call in flight. External events are deferred here.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            FlowState::Starting
                | FlowState::Confirming
                | FlowState::Cancelling
                | FlowState::FetchingStatus
                | FlowState::ClientConfirming
                | FlowState::Finalizing
                | FlowState::Reconciling
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Done | FlowState::Failed)
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, FlowState::FallbackCandidate | FlowState::FallbackConfirming)
    }
}

/// Coarse UI classification of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateTag {
    Idle,
    Loading,
    AwaitingAction,
    Ready,
    Error,
    Fallback,
    Resilience,
}

pub fn tags(state: FlowState, context: &FlowMachineContext, now: DateTime<Utc>) -> BTreeSet<StateTag> {
    let mut tags = BTreeSet::new();
    match state {
        FlowState::Idle => {
            tags.insert(StateTag::Idle);
        }
        FlowState::RequiresAction => {
            tags.insert(StateTag::AwaitingAction);
        }
        FlowState::Done => {
            tags.insert(StateTag::Ready);
        }
        FlowState::Failed => {
            tags.insert(StateTag::Error);
        }
        FlowState::FallbackCandidate | FlowState::FallbackConfirming => {
            tags.insert(StateTag::Fallback);
        }
        FlowState::StatusRetrying => {
            tags.insert(StateTag::Loading);
            tags.insert(StateTag::Resilience);
        }
        _ => {
            tags.insert(StateTag::Loading);
        }
    }
    if !state.is_terminal() && context.resilience.is_cooling_down(now) {
        tags.insert(StateTag::Resilience);
    }
    tags
}

/// Read-only view published after every processed event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSnapshot {
    pub state: FlowState,
    pub tags: BTreeSet<StateTag>,
    pub context: FlowMachineContext,
}

impl FlowSnapshot {
    pub fn has_tag(&self, tag: StateTag) -> bool {
        self.tags.contains(&tag)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
