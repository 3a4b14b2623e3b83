//! Append-only audit event emission.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

/// Security-relevant event kinds recorded by the audit sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    SuccessfulAuthentication,
    InvalidPassword,
    UnknownIdentifier,
    AccountDeactivated,
    LockedOut,
    TokenRefreshed,
    TokenRejected,
    TokenRevocation,
    TokenReuseDetected,
}

impl AuditKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuccessfulAuthentication => "successful_authentication",
            Self::InvalidPassword => "invalid_password",
            Self::UnknownIdentifier => "unknown_identifier",
            Self::AccountDeactivated => "account_deactivated",
            Self::LockedOut => "locked_out",
            Self::TokenRefreshed => "token_refreshed",
            Self::TokenRejected => "token_rejected",
            Self::TokenRevocation => "token_revocation",
            Self::TokenReuseDetected => "token_reuse_detected",
        }
    }
}

/// One audit record. `subject` is the account id when known, otherwise the
/// raw identifier the caller presented.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub subject: String,
    pub client_ip: Option<String>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(kind: AuditKind, subject: impl Into<String>, client_ip: Option<&str>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            client_ip: client_ip.map(ToString::to_string),
            detail: None,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Fire-and-forget audit emission.
///
/// `emit` is infallible from the caller's point of view: implementations log
/// their own failures and never surface them, so audit problems cannot mask
/// or roll back the primary operation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent);
}

/// Sink that records events on the tracing pipeline only.
#[derive(Clone, Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn emit(&self, event: AuditEvent) {
        info!(
            kind = event.kind.as_str(),
            subject = %event.subject,
            client_ip = event.client_ip.as_deref(),
            detail = event.detail.as_deref(),
            "audit event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{AuditEvent, AuditKind, AuditSink, TracingSink};

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(AuditKind::InvalidPassword.as_str(), "invalid_password");
        assert_eq!(AuditKind::TokenRevocation.as_str(), "token_revocation");
        assert_eq!(
            AuditKind::TokenReuseDetected.as_str(),
            "token_reuse_detected"
        );
    }

    #[test]
    fn event_builder_sets_fields() {
        let event = AuditEvent::new(AuditKind::LockedOut, "alice", Some("1.2.3.4"))
            .with_detail("attempt 6");
        assert_eq!(event.kind, AuditKind::LockedOut);
        assert_eq!(event.subject, "alice");
        assert_eq!(event.client_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(event.detail.as_deref(), Some("attempt 6"));
    }

    #[tokio::test]
    async fn tracing_sink_accepts_events() {
        let sink = TracingSink;
        sink.emit(AuditEvent::new(
            AuditKind::SuccessfulAuthentication,
            "bob",
            None,
        ))
        .await;
    }
}
