//! In-memory revocation cache keyed by access-token id.
//!
//! The cache answers "is this token id currently revoked?" on every protected
//! request without a store round-trip. It is an optimization for early
//! rejection, not a source of truth: access-token expiry is still enforced by
//! strict signature validation, and a missed entry is closed by the next
//! [`RevocationCache::warm_from_store`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::AuthError;
use crate::store::RefreshTokenStore;

/// Revoked token ids with their expiry; entries past expiry are dead weight
/// and pruned on insert or by an explicit sweep.
#[derive(Debug, Default)]
pub struct RevocationCache {
    entries: RwLock<HashMap<Uuid, DateTime<Utc>>>,
}

impl RevocationCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, DateTime<Utc>>> {
        // A poisoned lock only means a panic elsewhere; the map itself is
        // still coherent for reads and writes.
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, DateTime<Utc>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hot path: O(1), never touches the store.
    #[must_use]
    pub fn is_revoked(&self, access_token_id: Uuid) -> bool {
        let now = Utc::now();
        self.read()
            .get(&access_token_id)
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Record a revocation until `expires_at`; already-expired entries are
    /// not worth caching and are dropped on the way in.
    pub fn mark_revoked(&self, access_token_id: Uuid, expires_at: DateTime<Utc>) {
        let now = Utc::now();
        if expires_at <= now {
            return;
        }
        let mut entries = self.write();
        entries.retain(|_, entry_expiry| *entry_expiry > now);
        entries.insert(access_token_id, expires_at);
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Rebuild the cache from the store: every revoked, not-yet-expired row
    /// becomes an entry. Run once at process start; safe to re-run on demand.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::StoreUnavailable`] when the store query fails;
    /// the existing cache contents are left untouched in that case.
    pub async fn warm_from_store(
        &self,
        store: &dyn RefreshTokenStore,
    ) -> Result<usize, AuthError> {
        let now = Utc::now();
        let revoked = store
            .find_revoked_unexpired(now)
            .await
            .map_err(AuthError::StoreUnavailable)?;

        let count = revoked.len();
        let mut entries = self.write();
        entries.clear();
        entries.extend(revoked);
        drop(entries);

        debug!(count, "revocation cache warmed");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::RevocationCache;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    #[test]
    fn unknown_id_is_not_revoked() {
        let cache = RevocationCache::new();
        assert!(!cache.is_revoked(Uuid::new_v4()));
    }

    #[test]
    fn marked_id_is_revoked_until_expiry() {
        let cache = RevocationCache::new();
        let id = Uuid::new_v4();
        cache.mark_revoked(id, Utc::now() + Duration::minutes(5));
        assert!(cache.is_revoked(id));
    }

    #[test]
    fn expired_entries_are_ignored_and_swept() {
        let cache = RevocationCache::new();
        let live = Uuid::new_v4();
        let dead = Uuid::new_v4();
        cache.mark_revoked(live, Utc::now() + Duration::minutes(5));
        // Past-expiry marks are dropped on insert.
        cache.mark_revoked(dead, Utc::now() - Duration::seconds(1));

        assert!(cache.is_revoked(live));
        assert!(!cache.is_revoked(dead));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.sweep(), 0);
    }

    #[tokio::test]
    async fn expired_entries_pruned_by_later_insert() {
        let cache = RevocationCache::new();
        let short = Uuid::new_v4();
        cache.mark_revoked(short, Utc::now() + Duration::milliseconds(20));
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        assert!(!cache.is_revoked(short));
        cache.mark_revoked(Uuid::new_v4(), Utc::now() + Duration::minutes(1));
        assert_eq!(cache.len(), 1);
    }
}
