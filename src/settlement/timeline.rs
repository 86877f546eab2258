//! Step timeline for a settlement run

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a timeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepId {
    Browse,
    Negotiate,
    Prepare,
    Confirm,
    Settle,
    Approve,
    Deposit,
    Orchestrate,
    Deliver,
}

impl StepId {
    /// Steps that touch a chain, in execution order
    pub const CHAIN: [StepId; 4] = [
        StepId::Approve,
        StepId::Deposit,
        StepId::Orchestrate,
        StepId::Deliver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::Browse => "browse",
            StepId::Negotiate => "negotiate",
            StepId::Prepare => "prepare",
            StepId::Confirm => "confirm",
            StepId::Settle => "settle",
            StepId::Approve => "approve",
            StepId::Deposit => "deposit",
            StepId::Orchestrate => "orchestrate",
            StepId::Deliver => "deliver",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Idle,
    Running,
    Done,
    Error,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Error)
    }
}

/// Payload of a `timeline_step` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineStep {
    pub id: StepId,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

impl TimelineStep {
    fn new(id: StepId, status: StepStatus, detail: Option<String>) -> Self {
        Self {
            id,
            status,
            detail,
            tx_hash: None,
        }
    }

    pub fn idle(id: StepId) -> Self {
        Self::new(id, StepStatus::Idle, None)
    }

    pub fn running(id: StepId, detail: impl Into<String>) -> Self {
        Self::new(id, StepStatus::Running, Some(detail.into()))
    }

    pub fn done(id: StepId, detail: impl Into<String>) -> Self {
        Self::new(id, StepStatus::Done, Some(detail.into()))
    }

    pub fn error(id: StepId, detail: impl Into<String>) -> Self {
        Self::new(id, StepStatus::Error, Some(detail.into()))
    }

    pub fn with_tx(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }
}

/// Latest known state of each step, in order of first appearance
///
/// Updates for the same step replace the previous one, except that a step
/// that reached `done` or `error` never goes back to `idle` or `running`.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    steps: Vec<TimelineStep>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an update; returns false when it was dropped as a regression
    pub fn apply(&mut self, update: TimelineStep) -> bool {
        match self.steps.iter_mut().find(|s| s.id == update.id) {
            Some(current) => {
                if current.status.is_terminal() && !update.status.is_terminal() {
                    return false;
                }
                *current = update;
            }
            None => self.steps.push(update),
        }
        true
    }

    #[cfg(test)]
    pub fn get(&self, id: StepId) -> Option<&TimelineStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn steps(&self) -> &[TimelineStep] {
        &self.steps
    }

    /// The step currently in progress, if any
    pub fn active(&self) -> Option<StepId> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Running)
            .map(|s| s.id)
    }
}
