//! Domain records for accounts and refresh-token chains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use uuid::Uuid;

/// Account fields relevant to credential verification.
///
/// `failed_login_attempts` and `last_failed_or_lock_at` drive the lockout
/// window; both are mutated on every failed attempt and reset on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub failed_login_attempts: i32,
    pub last_failed_or_lock_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for Account {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            is_active: row.try_get("is_active")?,
            failed_login_attempts: row.try_get("failed_login_attempts")?,
            last_failed_or_lock_at: row.try_get("last_failed_or_lock_at")?,
        })
    }
}

/// One link in a refresh-token rotation chain.
///
/// `token` is the unique bearer credential and is never reused; rotation
/// revokes a row and records its successor in `replaced_by_token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub token: String,
    /// `jti` of the access token issued alongside this row.
    pub access_token_id: Uuid,
    pub owner_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by_ip: Option<String>,
    pub revocation_reason: Option<String>,
    pub replaced_by_token: Option<String>,
    pub created_by_ip: Option<String>,
    pub device_label: Option<String>,
}

impl RefreshToken {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// A row still usable for rotation: not revoked and not expired.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired(now)
    }
}

impl<'r> FromRow<'r, PgRow> for RefreshToken {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            token: row.try_get("token")?,
            access_token_id: row.try_get("access_token_id")?,
            owner_id: row.try_get("owner_id")?,
            issued_at: row.try_get("issued_at")?,
            expires_at: row.try_get("expires_at")?,
            revoked: row.try_get("revoked")?,
            revoked_at: row.try_get("revoked_at")?,
            revoked_by_ip: row.try_get("revoked_by_ip")?,
            revocation_reason: row.try_get("revocation_reason")?,
            replaced_by_token: row.try_get("replaced_by_token")?,
            created_by_ip: row.try_get("created_by_ip")?,
            device_label: row.try_get("device_label")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::RefreshToken;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn row(expires_in: Duration, revoked: bool) -> RefreshToken {
        let now = Utc::now();
        RefreshToken {
            token: "tok".to_string(),
            access_token_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            issued_at: now,
            expires_at: now + expires_in,
            revoked,
            revoked_at: None,
            revoked_by_ip: None,
            revocation_reason: None,
            replaced_by_token: None,
            created_by_ip: None,
            device_label: None,
        }
    }

    #[test]
    fn active_when_unrevoked_and_unexpired() {
        let now = Utc::now();
        assert!(row(Duration::minutes(5), false).is_active(now));
    }

    #[test]
    fn inactive_when_revoked() {
        let now = Utc::now();
        assert!(!row(Duration::minutes(5), true).is_active(now));
    }

    #[test]
    fn inactive_when_expired() {
        let now = Utc::now();
        let token = row(Duration::seconds(-1), false);
        assert!(token.is_expired(now));
        assert!(!token.is_active(now));
    }
}
