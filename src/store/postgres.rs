//! Postgres-backed stores and audit sink.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{error, Instrument};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::models::{Account, RefreshToken};
use crate::store::{CredentialStore, RefreshTokenStore, RevokeOutcome, RotateOutcome};

fn query_span(operation: &str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Account>> {
        let query = r"
            SELECT id, username, email, password_hash, is_active,
                   failed_login_attempts, last_failed_or_lock_at
            FROM accounts
            WHERE username = $1 OR email = $1
            LIMIT 1
        ";
        sqlx::query_as::<_, Account>(query)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup account")
    }

    async fn save_auth_state(&self, account: &Account) -> Result<()> {
        let query = r"
            UPDATE accounts
            SET failed_login_attempts = $2,
                last_failed_or_lock_at = $3
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(account.id)
            .bind(account.failed_login_attempts)
            .bind(account.last_failed_or_lock_at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to persist account auth state")?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn insert(&self, row: &RefreshToken) -> Result<()> {
        let query = r"
            INSERT INTO refresh_tokens
                (token, access_token_id, owner_id, issued_at, expires_at,
                 revoked, created_by_ip, device_label)
            VALUES ($1, $2, $3, $4, $5, FALSE, $6, $7)
        ";
        sqlx::query(query)
            .bind(&row.token)
            .bind(row.access_token_id)
            .bind(row.owner_id)
            .bind(row.issued_at)
            .bind(row.expires_at)
            .bind(&row.created_by_ip)
            .bind(&row.device_label)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert refresh token")?;
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>> {
        let query = "SELECT * FROM refresh_tokens WHERE token = $1";
        sqlx::query_as::<_, RefreshToken>(query)
            .bind(token)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup refresh token")
    }

    async fn find_active_by_owner(&self, owner_id: Uuid) -> Result<Vec<RefreshToken>> {
        let query = r"
            SELECT * FROM refresh_tokens
            WHERE owner_id = $1
              AND NOT revoked
              AND expires_at > NOW()
            ORDER BY issued_at ASC
        ";
        sqlx::query_as::<_, RefreshToken>(query)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to list active refresh tokens")
    }

    async fn revoke(
        &self,
        token: &str,
        client_ip: Option<&str>,
        reason: &str,
    ) -> Result<RevokeOutcome> {
        // The `AND NOT revoked` guard makes concurrent revokers race safely:
        // exactly one succeeds, the rest observe AlreadyRevoked.
        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE,
                revoked_at = NOW(),
                revoked_by_ip = $2,
                revocation_reason = $3
            WHERE token = $1
              AND NOT revoked
            RETURNING access_token_id, expires_at
        ";
        let row = sqlx::query(query)
            .bind(token)
            .bind(client_ip)
            .bind(reason)
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to revoke refresh token")?;

        if let Some(row) = row {
            return Ok(RevokeOutcome::Revoked {
                access_token_id: row.get("access_token_id"),
                expires_at: row.get("expires_at"),
            });
        }

        let query = "SELECT 1 FROM refresh_tokens WHERE token = $1 LIMIT 1";
        let exists = sqlx::query(query)
            .bind(token)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to check refresh token existence")?;

        if exists.is_some() {
            Ok(RevokeOutcome::AlreadyRevoked)
        } else {
            Ok(RevokeOutcome::NotFound)
        }
    }

    async fn revoke_all_for_owner(
        &self,
        owner_id: Uuid,
        client_ip: Option<&str>,
        reason: &str,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE,
                revoked_at = NOW(),
                revoked_by_ip = $2,
                revocation_reason = $3
            WHERE owner_id = $1
              AND NOT revoked
            RETURNING access_token_id, expires_at
        ";
        let rows = sqlx::query(query)
            .bind(owner_id)
            .bind(client_ip)
            .bind(reason)
            .fetch_all(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to revoke owner refresh tokens")?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("access_token_id"), row.get("expires_at")))
            .collect())
    }

    async fn rotate_atomically(
        &self,
        old_token: &str,
        client_ip: Option<&str>,
        new_row: &RefreshToken,
    ) -> Result<RotateOutcome> {
        let mut tx = self.pool.begin().await.context("begin rotate transaction")?;

        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE,
                revoked_at = NOW(),
                revoked_by_ip = $2,
                revocation_reason = 'rotated',
                replaced_by_token = $3
            WHERE token = $1
              AND NOT revoked
              AND expires_at > NOW()
            RETURNING token
        ";
        let revoked = sqlx::query(query)
            .bind(old_token)
            .bind(client_ip)
            .bind(&new_row.token)
            .fetch_optional(&mut *tx)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to revoke rotated token")?;

        if revoked.is_none() {
            // Lost the race: someone revoked or rotated this row first.
            let _ = tx.rollback().await;
            return Ok(RotateOutcome::Conflict);
        }

        let query = r"
            INSERT INTO refresh_tokens
                (token, access_token_id, owner_id, issued_at, expires_at,
                 revoked, created_by_ip, device_label)
            VALUES ($1, $2, $3, $4, $5, FALSE, $6, $7)
        ";
        sqlx::query(query)
            .bind(&new_row.token)
            .bind(new_row.access_token_id)
            .bind(new_row.owner_id)
            .bind(new_row.issued_at)
            .bind(new_row.expires_at)
            .bind(&new_row.created_by_ip)
            .bind(&new_row.device_label)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert successor token")?;

        tx.commit().await.context("commit rotate transaction")?;
        Ok(RotateOutcome::Rotated)
    }

    async fn find_revoked_unexpired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        let query = r"
            SELECT access_token_id, expires_at
            FROM refresh_tokens
            WHERE revoked
              AND expires_at > $1
        ";
        let rows = sqlx::query(query)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to load revoked tokens")?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("access_token_id"), row.get("expires_at")))
            .collect())
    }

    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = r"
            DELETE FROM refresh_tokens
            WHERE expires_at < $1
               OR (revoked AND revoked_at < $1)
        ";
        let result = sqlx::query(query)
            .bind(cutoff)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to purge stale refresh tokens")?;
        Ok(result.rows_affected())
    }
}

/// Audit sink writing `auth_audit_log` rows. Failures are logged and
/// swallowed: audit never rolls back the mutation it describes.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn emit(&self, event: AuditEvent) {
        let query = r"
            INSERT INTO auth_audit_log (kind, subject, client_ip, detail, created_at)
            VALUES ($1, $2, $3, $4, $5)
        ";
        let result = sqlx::query(query)
            .bind(event.kind.as_str())
            .bind(&event.subject)
            .bind(&event.client_ip)
            .bind(&event.detail)
            .bind(event.at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await;

        if let Err(err) = result {
            error!(
                kind = event.kind.as_str(),
                subject = %event.subject,
                "failed to persist audit event: {err}"
            );
        }
    }
}
