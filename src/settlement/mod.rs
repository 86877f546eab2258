//! Settlement runs: request shape, emitted events and the per-deal state machine
//!
//! A run goes `validate → approve → deposit → orchestrate → deliver → done`,
//! with `error` reachable from every state. In confirm checkout the run parks
//! on the [`ConfirmationGate`](crate::session::ConfirmationGate) before the
//! first chain step.

pub mod executor;
pub mod orchestrator;
pub mod timeline;

pub use executor::DefaultExecutorProvider;
pub use orchestrator::Orchestrator;
pub use timeline::{StepId, TimelineStep};

use crate::deal::{DealTerms, DealWire};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a run touches real chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Simulate,
    Testnet,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Simulate => "simulate",
            Mode::Testnet => "testnet",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckoutMode {
    #[default]
    Auto,
    /// Wait for an explicit `confirm_settlement` before any chain step
    Confirm,
}

/// Body of `POST /settle`
///
/// Carries either a fully identified `deal` or the `terms` to prepare one from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRequest {
    pub mode: Mode,
    #[serde(default)]
    pub checkout: CheckoutMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deal: Option<DealWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms: Option<DealTerms>,
}

/// Coarse run flags carried by `state` events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub mode: Mode,
    pub running: bool,
    pub settling: bool,
    pub awaiting_confirm: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Narration {
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub text: String,
}

/// Payload of the terminal `done` event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub deal_id: String,
    pub mode: Mode,
    pub elapsed_ms: u64,
    pub steps: Vec<TimelineStep>,
}

/// Payload of the terminal `error` event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub message: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<StepId>,
}

/// One outbound event of a run; serializes as its payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SettlementEvent {
    State(RunState),
    TimelineStep(TimelineStep),
    Message(Narration),
    Log(LogLine),
    Done(RunSummary),
    Error(RunFailure),
}

impl SettlementEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            SettlementEvent::State(_) => "state",
            SettlementEvent::TimelineStep(_) => "timeline_step",
            SettlementEvent::Message(_) => "message",
            SettlementEvent::Log(_) => "log",
            SettlementEvent::Done(_) => "done",
            SettlementEvent::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementEvent::Done(_) | SettlementEvent::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_to_auto_checkout() {
        let request: SettlementRequest =
            serde_json::from_str(r#"{"mode":"simulate","terms":null}"#).unwrap();
        assert_eq!(request.mode, Mode::Simulate);
        assert_eq!(request.checkout, CheckoutMode::Auto);
        assert!(request.deal.is_none());

        assert!(serde_json::from_str::<SettlementRequest>(r#"{"mode":"mainnet"}"#).is_err());
    }

    #[test]
    fn test_event_serializes_as_payload() {
        let event = SettlementEvent::State(RunState {
            mode: Mode::Simulate,
            running: true,
            settling: false,
            awaiting_confirm: true,
            session_id: Some("s-1".into()),
            deal_id: None,
        });
        assert_eq!(event.name(), "state");
        assert!(!event.is_terminal());
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "mode": "simulate",
                "running": true,
                "settling": false,
                "awaitingConfirm": true,
                "sessionId": "s-1"
            })
        );

        let failure = SettlementEvent::Error(RunFailure {
            message: "boom".into(),
            kind: "submission".into(),
            step: Some(StepId::Deposit),
        });
        assert!(failure.is_terminal());
        assert_eq!(
            serde_json::to_value(&failure).unwrap()["step"],
            serde_json::json!("deposit")
        );
    }
}
