use crate::application::flow::events::{Command, SystemEvent};
use crate::application::flow::state::FlowState;
use crate::domain::context::ReferenceKind;
use crate::domain::failure::FlowError;
use crate::domain::intent::PaymentIntent;
use crate::domain::ports::{ProviderDescriptor, ProviderResult};
use crate::domain::request::ProviderId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One scripted provider answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedOutcome {
    Intent(PaymentIntent),
    Error(FlowError),
}

impl From<ScriptedOutcome> for ProviderResult {
    fn from(outcome: ScriptedOutcome) -> Self {
        match outcome {
            ScriptedOutcome::Intent(intent) => Ok(intent),
            ScriptedOutcome::Error(error) => Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioProvider {
    #[serde(flatten)]
    pub descriptor: ProviderDescriptor,
    #[serde(default)]
    pub reference_kind: Option<ReferenceKind>,
    /// Outcomes per gateway operation name (`start_payment`, `get_status`, ...).
    #[serde(default)]
    pub responses: BTreeMap<String, Vec<ScriptedOutcome>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Command(Command),
    Event(SystemEvent),
    Sleep {
        ms: u64,
    },
    WaitFor {
        state: FlowState,
        #[serde(default = "default_wait_ms")]
        timeout_ms: u64,
    },
    /// Answers the pending fallback offer of the flow.
    RespondFallback {
        accepted: bool,
        #[serde(default)]
        selected_provider: Option<ProviderId>,
    },
}

fn default_wait_ms() -> u64 {
    60_000
}

/// A scripted run: provider catalog and answers, then a timeline of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub flow_id: Option<String>,
    pub providers: Vec<ScenarioProvider>,
    #[serde(default)]
    pub latency_ms: u64,
    /// Wraps the scripted gateway with circuit breaking and transport retries.
    #[serde(default)]
    pub resilient: bool,
    /// Lets the fallback orchestrator drive provider switches.
    #[serde(default)]
    pub fallback: bool,
    pub steps: Vec<Step>,
}
