//! Error types for the settlement engine

use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Main error type for settlement runs and the surrounding service
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettlementError {
    #[error("Missing configuration: {}", .missing.join(", "))]
    Configuration { missing: Vec<String> },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Malformed deal payload: {0}")]
    MalformedPayload(String),

    #[error("Submission rejected on {chain}: {reason}")]
    Submission { chain: String, reason: String },

    #[error("Timeout waiting for {operation}")]
    ObservationTimeout { operation: String },

    #[error("Settlement stream aborted")]
    StreamAbort,

    #[error("Chain connection error for {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("Nonce error on chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Unknown session {0}")]
    UnknownSession(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SettlementError {
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SettlementError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if error ends the run with an `error` event
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SettlementError::ObservationTimeout { .. } | SettlementError::StreamAbort
        )
    }

    /// Check if the client went away and the run should stop silently
    pub fn is_abort(&self) -> bool {
        matches!(self, SettlementError::StreamAbort)
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SettlementError::Configuration { .. } | SettlementError::InvalidConfig(_) => {
                "configuration"
            }
            SettlementError::InvalidField { .. } => "invalid_field",
            SettlementError::MalformedPayload(_) => "malformed_payload",
            SettlementError::Submission { .. } => "submission",
            SettlementError::ObservationTimeout { .. } => "observation_timeout",
            SettlementError::StreamAbort => "aborted",
            SettlementError::ChainConnection { .. } => "chain_connection",
            SettlementError::Nonce { .. } => "nonce",
            SettlementError::Wallet(_) => "wallet",
            SettlementError::UnknownSession(_) => "unknown_session",
            SettlementError::Internal(_) => "internal",
        }
    }
}

/// Result type for settlement operations
pub type SettlementResult<T> = Result<T, SettlementError>;

/// Race a chain call against the run's cancellation
///
/// Cancellation wins ties and drops the call.
pub async fn or_abort<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = SettlementResult<T>>,
) -> SettlementResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SettlementError::StreamAbort),
        result = call => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_lists_missing_keys() {
        let err = SettlementError::Configuration {
            missing: vec!["chains.origin.gateway".into(), "wallet.buyer_key_env".into()],
        };
        assert_eq!(
            err.to_string(),
            "Missing configuration: chains.origin.gateway, wallet.buyer_key_env"
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_soft_errors_are_not_fatal() {
        assert!(!SettlementError::StreamAbort.is_fatal());
        assert!(SettlementError::StreamAbort.is_abort());
        let timeout = SettlementError::ObservationTimeout {
            operation: "DealProcessed".into(),
        };
        assert!(!timeout.is_fatal());
        assert!(!timeout.is_abort());
    }

    #[tokio::test]
    async fn test_or_abort_prefers_cancellation() {
        let cancel = CancellationToken::new();
        assert_eq!(or_abort(&cancel, async { Ok(7) }).await, Ok(7));

        cancel.cancel();
        assert_eq!(
            or_abort(&cancel, async { Ok(7) }).await,
            Err(SettlementError::StreamAbort)
        );
    }
}
