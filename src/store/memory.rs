//! In-memory store implementations.
//!
//! A single mutex around each map gives these stores the same atomicity the
//! Postgres transactions give: rotation and revocation are applied in one
//! critical section. They back the crate's tests and work as a standalone
//! backend for single-process deployments.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::models::{Account, RefreshToken};
use crate::store::{CredentialStore, RefreshTokenStore, RevokeOutcome, RotateOutcome};

#[derive(Default)]
pub struct MemoryCredentialStore {
    accounts: Mutex<HashMap<Uuid, Account>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_account(&self, account: Account) {
        self.accounts.lock().await.insert(account.id, account);
    }

    pub async fn get(&self, id: Uuid) -> Option<Account> {
        self.accounts.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Account>> {
        let accounts = self.accounts.lock().await;
        Ok(accounts
            .values()
            .find(|account| account.username == identifier || account.email == identifier)
            .cloned())
    }

    async fn save_auth_state(&self, account: &Account) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        match accounts.get_mut(&account.id) {
            Some(stored) => {
                stored.failed_login_attempts = account.failed_login_attempts;
                stored.last_failed_or_lock_at = account.last_failed_or_lock_at;
                Ok(())
            }
            None => bail!("unknown account: {}", account.id),
        }
    }
}

#[derive(Default)]
pub struct MemoryRefreshTokenStore {
    rows: Mutex<HashMap<String, RefreshToken>>,
}

impl MemoryRefreshTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, token: &str) -> Option<RefreshToken> {
        self.rows.lock().await.get(token).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshTokenStore {
    async fn insert(&self, row: &RefreshToken) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&row.token) {
            bail!("duplicate refresh token value");
        }
        rows.insert(row.token.clone(), row.clone());
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>> {
        Ok(self.rows.lock().await.get(token).cloned())
    }

    async fn find_active_by_owner(&self, owner_id: Uuid) -> Result<Vec<RefreshToken>> {
        let now = Utc::now();
        let rows = self.rows.lock().await;
        let mut active: Vec<RefreshToken> = rows
            .values()
            .filter(|row| row.owner_id == owner_id && row.is_active(now))
            .cloned()
            .collect();
        active.sort_by_key(|row| row.issued_at);
        Ok(active)
    }

    async fn revoke(
        &self,
        token: &str,
        client_ip: Option<&str>,
        reason: &str,
    ) -> Result<RevokeOutcome> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(token) else {
            return Ok(RevokeOutcome::NotFound);
        };
        if row.revoked {
            return Ok(RevokeOutcome::AlreadyRevoked);
        }
        row.revoked = true;
        row.revoked_at = Some(Utc::now());
        row.revoked_by_ip = client_ip.map(ToString::to_string);
        row.revocation_reason = Some(reason.to_string());
        Ok(RevokeOutcome::Revoked {
            access_token_id: row.access_token_id,
            expires_at: row.expires_at,
        })
    }

    async fn revoke_all_for_owner(
        &self,
        owner_id: Uuid,
        client_ip: Option<&str>,
        reason: &str,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        let mut affected = Vec::new();
        for row in rows.values_mut() {
            if row.owner_id == owner_id && !row.revoked {
                row.revoked = true;
                row.revoked_at = Some(now);
                row.revoked_by_ip = client_ip.map(ToString::to_string);
                row.revocation_reason = Some(reason.to_string());
                affected.push((row.access_token_id, row.expires_at));
            }
        }
        Ok(affected)
    }

    async fn rotate_atomically(
        &self,
        old_token: &str,
        client_ip: Option<&str>,
        new_row: &RefreshToken,
    ) -> Result<RotateOutcome> {
        let now = Utc::now();
        // One critical section covers the revoke, the chain link, and the
        // insert, mirroring the Postgres transaction.
        let mut rows = self.rows.lock().await;
        let Some(old) = rows.get_mut(old_token) else {
            return Ok(RotateOutcome::Conflict);
        };
        if !old.is_active(now) {
            return Ok(RotateOutcome::Conflict);
        }
        old.revoked = true;
        old.revoked_at = Some(now);
        old.revoked_by_ip = client_ip.map(ToString::to_string);
        old.revocation_reason = Some("rotated".to_string());
        old.replaced_by_token = Some(new_row.token.clone());
        rows.insert(new_row.token.clone(), new_row.clone());
        Ok(RotateOutcome::Rotated)
    }

    async fn find_revoked_unexpired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|row| row.revoked && row.expires_at > now)
            .map(|row| (row.access_token_id, row.expires_at))
            .collect())
    }

    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, row| {
            let expired_out = row.expires_at < cutoff;
            let revoked_out = row.revoked && row.revoked_at.is_some_and(|at| at < cutoff);
            !(expired_out || revoked_out)
        });
        Ok((before - rows.len()) as u64)
    }
}

/// Wrapper around [`MemoryRefreshTokenStore`] that fails a scheduled number
/// of calls before recovering, for exercising retry and fail-closed paths.
#[derive(Default)]
pub struct FlakyRefreshTokenStore {
    inner: MemoryRefreshTokenStore,
    insert_failures: AtomicU32,
    rotate_failures: AtomicU32,
}

impl FlakyRefreshTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` inserts fail before the store recovers.
    pub fn fail_next_inserts(&self, count: u32) {
        self.insert_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` rotation attempts fail before the store
    /// recovers.
    pub fn fail_next_rotations(&self, count: u32) {
        self.rotate_failures.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn inner(&self) -> &MemoryRefreshTokenStore {
        &self.inner
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RefreshTokenStore for FlakyRefreshTokenStore {
    async fn insert(&self, row: &RefreshToken) -> Result<()> {
        if Self::take_failure(&self.insert_failures) {
            bail!("connection reset during insert");
        }
        self.inner.insert(row).await
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>> {
        self.inner.find_by_token(token).await
    }

    async fn find_active_by_owner(&self, owner_id: Uuid) -> Result<Vec<RefreshToken>> {
        self.inner.find_active_by_owner(owner_id).await
    }

    async fn revoke(
        &self,
        token: &str,
        client_ip: Option<&str>,
        reason: &str,
    ) -> Result<RevokeOutcome> {
        self.inner.revoke(token, client_ip, reason).await
    }

    async fn revoke_all_for_owner(
        &self,
        owner_id: Uuid,
        client_ip: Option<&str>,
        reason: &str,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        self.inner
            .revoke_all_for_owner(owner_id, client_ip, reason)
            .await
    }

    async fn rotate_atomically(
        &self,
        old_token: &str,
        client_ip: Option<&str>,
        new_row: &RefreshToken,
    ) -> Result<RotateOutcome> {
        if Self::take_failure(&self.rotate_failures) {
            bail!("connection reset during rotation");
        }
        self.inner
            .rotate_atomically(old_token, client_ip, new_row)
            .await
    }

    async fn find_revoked_unexpired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        self.inner.find_revoked_unexpired(now).await
    }

    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.purge_stale(cutoff).await
    }
}

/// Capturing sink for tests and inspection.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn count_of(&self, kind: AuditKind) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, event: AuditEvent) {
        self.events.lock().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{FlakyRefreshTokenStore, MemoryCredentialStore, MemoryRefreshTokenStore};
    use crate::models::{Account, RefreshToken};
    use crate::store::{CredentialStore, RefreshTokenStore, RevokeOutcome, RotateOutcome};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn account(username: &str) -> Account {
        Account {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password_hash: "hash".to_string(),
            is_active: true,
            failed_login_attempts: 0,
            last_failed_or_lock_at: None,
        }
    }

    fn token_row(owner_id: Uuid, token: &str, ttl: Duration) -> RefreshToken {
        let now = Utc::now();
        RefreshToken {
            token: token.to_string(),
            access_token_id: Uuid::new_v4(),
            owner_id,
            issued_at: now,
            expires_at: now + ttl,
            revoked: false,
            revoked_at: None,
            revoked_by_ip: None,
            revocation_reason: None,
            replaced_by_token: None,
            created_by_ip: None,
            device_label: None,
        }
    }

    #[tokio::test]
    async fn find_by_username_or_email() -> anyhow::Result<()> {
        let store = MemoryCredentialStore::new();
        store.insert_account(account("alice")).await;

        assert!(store.find_by_identifier("alice").await?.is_some());
        assert!(store
            .find_by_identifier("alice@example.com")
            .await?
            .is_some());
        assert!(store.find_by_identifier("mallory").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() -> anyhow::Result<()> {
        let store = MemoryRefreshTokenStore::new();
        let row = token_row(Uuid::new_v4(), "t1", Duration::minutes(5));
        store.insert(&row).await?;
        assert!(store.insert(&row).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn revoke_distinguishes_missing_and_already_revoked() -> anyhow::Result<()> {
        let store = MemoryRefreshTokenStore::new();
        let row = token_row(Uuid::new_v4(), "t1", Duration::minutes(5));
        store.insert(&row).await?;

        assert_eq!(
            store.revoke("absent", None, "test").await?,
            RevokeOutcome::NotFound
        );
        assert!(matches!(
            store.revoke("t1", Some("1.2.3.4"), "test").await?,
            RevokeOutcome::Revoked { .. }
        ));
        assert_eq!(
            store.revoke("t1", None, "test").await?,
            RevokeOutcome::AlreadyRevoked
        );
        Ok(())
    }

    #[tokio::test]
    async fn rotate_links_chain_and_conflicts_on_replay() -> anyhow::Result<()> {
        let store = MemoryRefreshTokenStore::new();
        let owner = Uuid::new_v4();
        let old = token_row(owner, "old", Duration::minutes(5));
        let new = token_row(owner, "new", Duration::minutes(5));
        store.insert(&old).await?;

        assert_eq!(
            store.rotate_atomically("old", None, &new).await?,
            RotateOutcome::Rotated
        );
        let stored_old = store.get("old").await.unwrap();
        assert!(stored_old.revoked);
        assert_eq!(stored_old.replaced_by_token.as_deref(), Some("new"));
        assert_eq!(stored_old.revocation_reason.as_deref(), Some("rotated"));

        let replay = token_row(owner, "newer", Duration::minutes(5));
        assert_eq!(
            store.rotate_atomically("old", None, &replay).await?,
            RotateOutcome::Conflict
        );
        Ok(())
    }

    #[tokio::test]
    async fn active_rows_sorted_oldest_first() -> anyhow::Result<()> {
        let store = MemoryRefreshTokenStore::new();
        let owner = Uuid::new_v4();
        let mut first = token_row(owner, "first", Duration::minutes(5));
        first.issued_at = Utc::now() - Duration::minutes(1);
        store.insert(&first).await?;
        store
            .insert(&token_row(owner, "second", Duration::minutes(5)))
            .await?;

        let active = store.find_active_by_owner(owner).await?;
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].token, "first");
        Ok(())
    }

    #[tokio::test]
    async fn purge_removes_expired_and_old_revoked() -> anyhow::Result<()> {
        let store = MemoryRefreshTokenStore::new();
        let owner = Uuid::new_v4();
        let mut expired = token_row(owner, "expired", Duration::minutes(5));
        expired.expires_at = Utc::now() - Duration::days(2);
        store.insert(&expired).await?;
        store
            .insert(&token_row(owner, "live", Duration::minutes(5)))
            .await?;

        let removed = store.purge_stale(Utc::now() - Duration::days(1)).await?;
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn flaky_store_fails_exactly_the_scheduled_calls() {
        let store = FlakyRefreshTokenStore::new();
        let owner = Uuid::new_v4();

        store.fail_next_inserts(2);
        assert!(store.insert(&token_row(owner, "a", Duration::minutes(5))).await.is_err());
        assert!(store.insert(&token_row(owner, "b", Duration::minutes(5))).await.is_err());
        assert!(store.insert(&token_row(owner, "c", Duration::minutes(5))).await.is_ok());
        assert_eq!(store.inner().len().await, 1);

        store.fail_next_rotations(1);
        let successor = token_row(owner, "d", Duration::minutes(5));
        assert!(store.rotate_atomically("c", None, &successor).await.is_err());
        assert_eq!(
            store.rotate_atomically("c", None, &successor).await.unwrap(),
            RotateOutcome::Rotated
        );
    }
}
