//! Human escalation channel
//!
//! A blocked operation can be put in front of a human. Each escalation
//! registers a pending alert keyed by a fresh request id, then publishes a
//! `SHOW_SECURITY_ALERT` event and waits for a correlated
//! `SECURITY_ALERT_RESPONSE`. The wait is bounded; on timeout the decision
//! is a denial. Whoever removes the pending entry first (responder or
//! timeout) resolves it, so one alert is never resolved twice.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::EscalationSettings;
use crate::reporter::{ReporterEvent, ScanReporter, SecurityAlert};
use crate::types::{AlertRequestId, ScanId, ScanResult};

/// Default time a human has to answer an alert.
pub const DEFAULT_ESCALATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Human decision on a security alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAlertResponse {
    pub request_id: AlertRequestId,
    pub allowed: bool,
}

/// Escalation failures, all resolved as a denial
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscalationError {
    #[error("No decision for alert {request_id} within {timeout:?}")]
    Timeout {
        request_id: AlertRequestId,
        timeout: Duration,
    },

    #[error("Alert {request_id} was dropped before a decision arrived")]
    ChannelClosed { request_id: AlertRequestId },
}

struct PendingSecurityAlert {
    responder: oneshot::Sender<bool>,
    scan_id: ScanId,
    created_at: DateTime<Utc>,
}

/// Correlates outgoing alerts with incoming human decisions
pub struct EscalationChannel {
    pending: DashMap<AlertRequestId, PendingSecurityAlert>,
    reporter: Arc<dyn ScanReporter>,
    timeout: Duration,
}

impl EscalationChannel {
    pub fn new(reporter: Arc<dyn ScanReporter>) -> Self {
        Self::with_timeout(reporter, DEFAULT_ESCALATION_TIMEOUT)
    }

    pub fn with_timeout(reporter: Arc<dyn ScanReporter>, timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            reporter,
            timeout,
        }
    }

    /// Channel bounded by the configured escalation timeout.
    pub fn from_settings(reporter: Arc<dyn ScanReporter>, settings: &EscalationSettings) -> Self {
        Self::with_timeout(reporter, Duration::from_secs(settings.timeout_secs))
    }

    /// Ask a human to decide on a blocked scan. Resolves `false` on timeout.
    pub async fn request_decision(&self, scan_result: &ScanResult) -> bool {
        match self.decide(scan_result).await {
            Ok(allowed) => {
                tracing::info!(scan_id = %scan_result.id, allowed, "Human decision received");
                allowed
            }
            Err(e) => {
                tracing::warn!(scan_id = %scan_result.id, "Escalation denied by default: {}", e);
                false
            }
        }
    }

    async fn decide(&self, scan_result: &ScanResult) -> Result<bool, EscalationError> {
        let timeout = self.timeout;
        let request_id = AlertRequestId::new();
        let (responder, decision) = oneshot::channel();

        // Registered before the alert goes out so a fast answer always finds it
        self.pending.insert(
            request_id,
            PendingSecurityAlert {
                responder,
                scan_id: scan_result.id,
                created_at: Utc::now(),
            },
        );

        self.reporter
            .report(ReporterEvent::ShowSecurityAlert(SecurityAlert {
                request_id,
                scan_result: scan_result.clone(),
            }))
            .await;

        tracing::debug!(%request_id, scan_id = %scan_result.id, "Security alert raised");

        match tokio::time::timeout(timeout, decision).await {
            Ok(Ok(allowed)) => Ok(allowed),
            Ok(Err(_)) => {
                self.pending.remove(&request_id);
                Err(EscalationError::ChannelClosed { request_id })
            }
            Err(_) => {
                self.pending.remove(&request_id);
                Err(EscalationError::Timeout { request_id, timeout })
            }
        }
    }

    /// Deliver a human decision. Returns whether it resolved a pending alert;
    /// unknown, late and duplicate responses are discarded.
    pub fn handle_response(&self, response: SecurityAlertResponse) -> bool {
        let Some((_, pending)) = self.pending.remove(&response.request_id) else {
            tracing::warn!(
                request_id = %response.request_id,
                "Discarding response for unknown or resolved security alert"
            );
            return false;
        };

        let waited = Utc::now() - pending.created_at;
        tracing::debug!(
            request_id = %response.request_id,
            scan_id = %pending.scan_id,
            waited_ms = waited.num_milliseconds(),
            "Resolving security alert"
        );

        if pending.responder.send(response.allowed).is_err() {
            tracing::warn!(
                request_id = %response.request_id,
                "Security alert was already abandoned"
            );
            return false;
        }
        true
    }

    /// Alerts still awaiting a decision.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// How long a human has to answer.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
