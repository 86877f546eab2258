//! Session confirmation gate
//!
//! A settlement run in confirm-checkout mode registers a fresh session id and
//! suspends on [`ConfirmationGate::wait`] until someone calls
//! [`ConfirmationGate::confirm`] for that id, or the run's stream is aborted.
//!
//! A confirm that arrives after `register` but before `wait` is latched: the
//! later `wait` returns immediately. A confirm for an unknown or already
//! resolved session is ignored.

use crate::error::{SettlementError, SettlementResult};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Confirmed,
    Aborted,
}

/// Result of a confirm call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// A pending session was resolved by this call
    Confirmed,
    /// Unknown or already resolved session; nothing changed
    Ignored,
}

/// Result of waiting on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Confirmed,
    Aborted,
}

struct SessionEntry {
    state: SessionState,
    signal_tx: Option<oneshot::Sender<()>>,
    signal_rx: Option<oneshot::Receiver<()>>,
}

/// Registry of runs waiting for a human confirmation
#[derive(Default)]
pub struct ConfirmationGate {
    sessions: DashMap<String, SessionEntry>,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session as pending
    pub fn register(&self, session_id: &str) {
        let (signal_tx, signal_rx) = oneshot::channel();
        self.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                state: SessionState::Pending,
                signal_tx: Some(signal_tx),
                signal_rx: Some(signal_rx),
            },
        );
        crate::metrics::set_pending_confirmations(self.pending_count());
        debug!("Registered confirmation session {}", session_id);
    }

    /// Resolve the pending wait for a session, at most once
    pub fn confirm(&self, session_id: &str) -> ConfirmOutcome {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            debug!("Ignoring confirm for unknown session {}", session_id);
            return ConfirmOutcome::Ignored;
        };

        if entry.state != SessionState::Pending {
            return ConfirmOutcome::Ignored;
        }

        match entry.signal_tx.take() {
            Some(signal_tx) => {
                entry.state = SessionState::Confirmed;
                // The waiter may already be gone; the latched state still stands
                let _ = signal_tx.send(());
                info!("Session {} confirmed", session_id);
                ConfirmOutcome::Confirmed
            }
            None => ConfirmOutcome::Ignored,
        }
    }

    /// Suspend until the session is confirmed or `abort` fires
    ///
    /// The session is removed from the registry once resolved.
    pub async fn wait(
        &self,
        session_id: &str,
        abort: &CancellationToken,
    ) -> SettlementResult<WaitOutcome> {
        let signal_rx = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| SettlementError::UnknownSession(session_id.to_string()))?;
            entry.signal_rx.take().ok_or_else(|| {
                SettlementError::Internal(format!("session {} already has a waiter", session_id))
            })?
        };

        let outcome = tokio::select! {
            signal = signal_rx => match signal {
                Ok(()) => WaitOutcome::Confirmed,
                // Sender dropped by cleanup
                Err(_) => WaitOutcome::Aborted,
            },
            _ = abort.cancelled() => WaitOutcome::Aborted,
        };

        if outcome == WaitOutcome::Aborted {
            if let Some(mut entry) = self.sessions.get_mut(session_id) {
                entry.state = SessionState::Aborted;
            }
        }
        self.cleanup(session_id);

        Ok(outcome)
    }

    /// Drop a session and any pending signal
    pub fn cleanup(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            debug!("Removed confirmation session {}", session_id);
        }
        crate::metrics::set_pending_confirmations(self.pending_count());
    }

    #[cfg(test)]
    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.get(session_id).map(|entry| entry.state)
    }

    /// Sessions still waiting for a confirm
    pub fn pending_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.state == SessionState::Pending)
            .count()
    }
}
