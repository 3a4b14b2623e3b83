//! Typed error taxonomy for the auth core.

use thiserror::Error;

use crate::signer;

/// Business-rule and infrastructure failures surfaced by the auth core.
///
/// The first eight kinds are typed rejections returned to callers;
/// `StoreUnavailable` is transient and eligible for retry; everything else is
/// terminal. Store detail never crosses the subsystem boundary: expose
/// [`AuthError::public_message`] to clients, not `Display` output.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account is deactivated")]
    AccountDeactivated,
    #[error("account is locked out")]
    LockedOut,
    #[error("refresh token not found")]
    TokenNotFound,
    #[error("refresh token expired")]
    TokenExpired,
    #[error("refresh token revoked")]
    TokenRevoked,
    #[error("access token does not match refresh record")]
    TokenMismatch,
    #[error("token already revoked")]
    AlreadyRevoked,
    #[error("signing failure")]
    Signing(#[from] signer::Error),
    #[error("store unavailable")]
    StoreUnavailable(#[source] anyhow::Error),
    #[error("operation cancelled")]
    Cancelled,
}

impl AuthError {
    /// Whether a retry with backoff may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Client-safe message: no SQL text, no stack traces, no key material.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            // Wrong password and unknown account are indistinguishable to
            // prevent account enumeration.
            Self::InvalidCredentials => "invalid username or password",
            Self::AccountDeactivated => "account is deactivated",
            Self::LockedOut => "account is temporarily locked",
            Self::TokenNotFound | Self::TokenExpired | Self::TokenRevoked | Self::TokenMismatch => {
                "invalid token"
            }
            Self::AlreadyRevoked => "token already revoked",
            Self::Signing(_) | Self::StoreUnavailable(_) => "authentication unavailable",
            Self::Cancelled => "request cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AuthError;
    use anyhow::anyhow;

    #[test]
    fn transient_only_for_store_errors() {
        assert!(AuthError::StoreUnavailable(anyhow!("timeout")).is_transient());
        assert!(!AuthError::TokenRevoked.is_transient());
        assert!(!AuthError::InvalidCredentials.is_transient());
    }

    #[test]
    fn public_messages_hide_detail() {
        let err = AuthError::StoreUnavailable(anyhow!("connection refused to 10.0.0.5:5432"));
        assert_eq!(err.public_message(), "authentication unavailable");
        assert!(!err.public_message().contains("10.0.0.5"));
    }

    #[test]
    fn credential_failures_share_a_message() {
        assert_eq!(
            AuthError::InvalidCredentials.public_message(),
            "invalid username or password"
        );
    }
}
