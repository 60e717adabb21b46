use super::model::Scenario;
use crate::error::{PaymentError, Result};
use std::io::Read;

/// Reads a scenario from a JSON source.
pub struct ScenarioReader<R: Read> {
    source: R,
}

impl<R: Read> ScenarioReader<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    /// Parses the scenario and checks that every step refers to a known provider.
    pub fn read(self) -> Result<Scenario> {
        let scenario: Scenario = serde_json::from_reader(self.source)?;
        if scenario.providers.is_empty() {
            return Err(PaymentError::ValidationError(
                "scenario declares no providers".to_string(),
            ));
        }
        if let Some(unknown) = scenario
            .providers
            .iter()
            .flat_map(|p| p.responses.keys())
            .find(|op| !super::OPERATIONS.contains(&op.as_str()))
        {
            return Err(PaymentError::ValidationError(format!(
                "unknown gateway operation '{unknown}'"
            )));
        }
        Ok(scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::flow::events::Command;
    use crate::interfaces::scenario::model::{ScriptedOutcome, Step};

    const SCENARIO: &str = r#"{
        "providers": [{
            "id": "stripe",
            "supported_methods": ["card"],
            "responses": {
                "start_payment": [{"intent": {"id": "pi_1", "provider": "stripe", "status": "succeeded"}}],
                "get_status": [{"error": {"code": "provider_unavailable", "message_key": "payment.errors.provider_unavailable"}}]
            }
        }],
        "steps": [
            {"command": {"type": "START", "provider_id": "stripe",
                "request": {"amount": "12.50", "currency": "USD", "method": "card"}}},
            {"wait_for": {"state": "done"}},
            {"sleep": {"ms": 10}}
        ]
    }"#;

    #[test]
    fn test_reader_valid_scenario() {
        let scenario = ScenarioReader::new(SCENARIO.as_bytes()).read().unwrap();
        assert_eq!(scenario.providers[0].descriptor.id, "stripe");
        assert!(scenario.providers[0].descriptor.enabled);
        assert!(matches!(
            scenario.providers[0].responses["get_status"][0],
            ScriptedOutcome::Error(_)
        ));
        assert!(matches!(scenario.steps[0], Step::Command(Command::Start { .. })));
        assert!(matches!(scenario.steps[1], Step::WaitFor { timeout_ms: 60_000, .. }));
    }

    #[test]
    fn test_reader_rejects_unknown_operation() {
        let data = r#"{"providers": [{"id": "stripe", "supported_methods": ["card"],
            "responses": {"refund": []}}], "steps": []}"#;
        let err = ScenarioReader::new(data.as_bytes()).read().unwrap_err();
        assert!(matches!(err, PaymentError::ValidationError(msg) if msg.contains("refund")));
    }

    #[test]
    fn test_reader_malformed_json() {
        let err = ScenarioReader::new("{".as_bytes()).read().unwrap_err();
        assert!(matches!(err, PaymentError::JsonError(_)));
    }
}
