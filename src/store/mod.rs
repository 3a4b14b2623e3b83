//! Storage interfaces consumed by the auth core.
//!
//! Implementations return `anyhow::Result`; the lifecycle layer maps any
//! store failure to [`crate::error::AuthError::StoreUnavailable`] so internal
//! detail never crosses the subsystem boundary.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Account, RefreshToken};

/// Account lookup and per-account failed-attempt persistence.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up by username or email.
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Account>>;

    /// Persist the mutable authentication-state fields
    /// (`failed_login_attempts`, `last_failed_or_lock_at`).
    async fn save_auth_state(&self, account: &Account) -> Result<()>;
}

/// Outcome of a single-token revocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked {
        access_token_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    AlreadyRevoked,
    NotFound,
}

/// Outcome of an atomic rotation attempt. `Conflict` means the old row was
/// no longer active when the transaction ran; the caller should re-read the
/// row and surface the terminal error it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    Rotated,
    Conflict,
}

/// Durable store for refresh-token rotation chains.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(&self, row: &RefreshToken) -> Result<()>;

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>>;

    /// Non-revoked, non-expired rows for an owner, oldest `issued_at` first.
    async fn find_active_by_owner(&self, owner_id: Uuid) -> Result<Vec<RefreshToken>>;

    /// Mark one row revoked. Already-revoked and missing rows are reported,
    /// not treated as errors, so callers can distinguish double revocation.
    async fn revoke(
        &self,
        token: &str,
        client_ip: Option<&str>,
        reason: &str,
    ) -> Result<RevokeOutcome>;

    /// Revoke every non-revoked row for `owner_id` in one pass; returns the
    /// `(access_token_id, expires_at)` of each affected row. Empty result is
    /// a successful no-op.
    async fn revoke_all_for_owner(
        &self,
        owner_id: Uuid,
        client_ip: Option<&str>,
        reason: &str,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>>;

    /// Atomically revoke `old_token` (reason "rotated"), link it to
    /// `new_row.token`, and insert `new_row`. A reader must never observe a
    /// half-applied rotation.
    async fn rotate_atomically(
        &self,
        old_token: &str,
        client_ip: Option<&str>,
        new_row: &RefreshToken,
    ) -> Result<RotateOutcome>;

    /// All revoked rows still inside their lifetime, for cache warming.
    async fn find_revoked_unexpired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>>;

    /// Delete rows whose expiry or revocation is older than `cutoff`;
    /// returns how many were removed.
    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::{RevokeOutcome, RotateOutcome};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn revoke_outcome_distinguishes_cases() {
        let revoked = RevokeOutcome::Revoked {
            access_token_id: Uuid::nil(),
            expires_at: Utc::now(),
        };
        assert_ne!(revoked, RevokeOutcome::AlreadyRevoked);
        assert_ne!(RevokeOutcome::AlreadyRevoked, RevokeOutcome::NotFound);
    }

    #[test]
    fn rotate_outcome_debug_names() {
        assert_eq!(format!("{:?}", RotateOutcome::Rotated), "Rotated");
        assert_eq!(format!("{:?}", RotateOutcome::Conflict), "Conflict");
    }
}
