//! Per-account cap on concurrent sessions.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::AuthError;
use crate::store::{RefreshTokenStore, RevokeOutcome};

/// Revocation reason recorded when the cap evicts a session.
pub const SESSION_LIMIT_REASON: &str = "session limit exceeded";

/// A session evicted to make room under the cap. The caller feeds these
/// into the revocation cache once the store mutation is done.
#[derive(Debug, Clone)]
pub struct EvictedSession {
    pub access_token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Enforces the concurrent-session cap by revoking the oldest live refresh
/// tokens of an owner before a new session is admitted.
pub struct SessionLimiter {
    store: Arc<dyn RefreshTokenStore>,
}

impl SessionLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn RefreshTokenStore>) -> Self {
        Self { store }
    }

    /// Make room for one new session, evicting oldest-by-`issued_at` rows
    /// until the owner is strictly below `max_concurrent`. In steady state
    /// an owner at the cap loses exactly the single oldest session; more
    /// than one row is evicted only when existing rows exceed the cap, which
    /// happens only after the cap was lowered across a restart.
    ///
    /// `max_concurrent <= 0` disables the cap. The count-then-evict sequence
    /// is a read-modify-write over shared per-account state: callers must
    /// hold the owner's serialization lock for the whole admission (the
    /// lifecycle manager does).
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` when the store cannot be read or mutated.
    pub async fn admit(
        &self,
        owner_id: Uuid,
        max_concurrent: i32,
        client_ip: Option<&str>,
    ) -> Result<Vec<EvictedSession>, AuthError> {
        if max_concurrent <= 0 {
            return Ok(Vec::new());
        }
        let max = usize::try_from(max_concurrent).unwrap_or(usize::MAX);

        let active = self
            .store
            .find_active_by_owner(owner_id)
            .await
            .map_err(AuthError::StoreUnavailable)?;
        if active.len() < max {
            return Ok(Vec::new());
        }

        // Evict enough of the oldest rows that the new session lands at
        // exactly `max` live sessions. Normally that is a single eviction.
        let surplus = active.len() - max + 1;
        let mut evicted = Vec::with_capacity(surplus);
        for row in active.into_iter().take(surplus) {
            let outcome = self
                .store
                .revoke(&row.token, client_ip, SESSION_LIMIT_REASON)
                .await
                .map_err(AuthError::StoreUnavailable)?;
            if let RevokeOutcome::Revoked {
                access_token_id,
                expires_at,
            } = outcome
            {
                info!(owner = %owner_id, token_id = %access_token_id, "session evicted by cap");
                evicted.push(EvictedSession {
                    access_token_id,
                    expires_at,
                });
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionLimiter;
    use crate::models::RefreshToken;
    use crate::store::memory::MemoryRefreshTokenStore;
    use crate::store::RefreshTokenStore;
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use uuid::Uuid;

    async fn seed(store: &MemoryRefreshTokenStore, owner: Uuid, token: &str, age: Duration) {
        let now = Utc::now();
        store
            .insert(&RefreshToken {
                token: token.to_string(),
                access_token_id: Uuid::new_v4(),
                owner_id: owner,
                issued_at: now - age,
                expires_at: now + Duration::minutes(30),
                revoked: false,
                revoked_at: None,
                revoked_by_ip: None,
                revocation_reason: None,
                replaced_by_token: None,
                created_by_ip: None,
                device_label: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn under_cap_admits_without_eviction() {
        let store = Arc::new(MemoryRefreshTokenStore::new());
        let owner = Uuid::new_v4();
        seed(&store, owner, "t1", Duration::minutes(3)).await;

        let limiter = SessionLimiter::new(store.clone());
        let evicted = limiter.admit(owner, 2, None).await.unwrap();
        assert!(evicted.is_empty());
    }

    #[tokio::test]
    async fn at_cap_evicts_the_oldest() {
        let store = Arc::new(MemoryRefreshTokenStore::new());
        let owner = Uuid::new_v4();
        seed(&store, owner, "oldest", Duration::minutes(10)).await;
        seed(&store, owner, "newer", Duration::minutes(1)).await;

        let limiter = SessionLimiter::new(store.clone());
        let evicted = limiter.admit(owner, 2, Some("1.2.3.4")).await.unwrap();
        assert_eq!(evicted.len(), 1);

        let oldest = store.get("oldest").await.unwrap();
        assert!(oldest.revoked);
        assert_eq!(
            oldest.revocation_reason.as_deref(),
            Some(super::SESSION_LIMIT_REASON)
        );
        assert!(!store.get("newer").await.unwrap().revoked);
    }

    #[tokio::test]
    async fn zero_or_negative_cap_disables_limit() {
        let store = Arc::new(MemoryRefreshTokenStore::new());
        let owner = Uuid::new_v4();
        for i in 0i64..10 {
            seed(&store, owner, &format!("t{i}"), Duration::seconds(i)).await;
        }

        let limiter = SessionLimiter::new(store.clone());
        assert!(limiter.admit(owner, 0, None).await.unwrap().is_empty());
        assert!(limiter.admit(owner, -1, None).await.unwrap().is_empty());
        assert_eq!(store.find_active_by_owner(owner).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn over_cap_surplus_fully_drained() {
        let store = Arc::new(MemoryRefreshTokenStore::new());
        let owner = Uuid::new_v4();
        for i in 0i64..4 {
            seed(&store, owner, &format!("t{i}"), Duration::minutes(10 - i)).await;
        }

        // Cap lowered to 2 after 4 sessions existed: admission trims to 1
        // live row so the new session makes 2.
        let limiter = SessionLimiter::new(store.clone());
        let evicted = limiter.admit(owner, 2, None).await.unwrap();
        assert_eq!(evicted.len(), 3);
        assert_eq!(store.find_active_by_owner(owner).await.unwrap().len(), 1);
    }
}
