//! Token lifecycle: issue, rotate, revoke.
//!
//! Per refresh-token chain the state machine is
//! `Active -> {Rotated, Revoked, Expired}`; rotation revokes the predecessor
//! and creates the successor as one atomic store operation. Session
//! admission and owner-wide revocation are serialized per owner through
//! keyed async mutexes so two concurrent logins cannot both slip under the
//! session cap.

use anyhow::Context;
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::limiter::{SessionLimiter, SESSION_LIMIT_REASON};
use crate::models::{Account, RefreshToken};
use crate::revocation::RevocationCache;
use crate::signer::TokenSigner;
use crate::store::{RefreshTokenStore, RevokeOutcome, RotateOutcome};

/// Revocation reason used when reuse of a rotated-out token triggers
/// family-wide revocation.
pub const REUSE_REASON: &str = "refresh token reuse detected";

/// Both halves of a successful issuance. A response missing either token is
/// a failed login by contract; this struct only exists fully populated.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub access_token_id: Uuid,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Keyed async mutexes, one per owner, pruned when no task holds them.
struct OwnerLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl OwnerLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, owner_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            // Entries nobody else references are stale and can go.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(owner_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// New opaque refresh-token value: 32 random bytes, base64url unpadded.
/// The raw value is the bearer credential; uniqueness comes from entropy
/// and is additionally enforced by the store's unique constraint.
fn generate_refresh_token() -> Result<String, AuthError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate refresh token")
        .map_err(AuthError::StoreUnavailable)?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Orchestrates issuance, rotation, and revocation over the signing
/// facility, the refresh-token store, the session limiter, the revocation
/// cache, and the audit sink.
pub struct TokenLifecycle {
    tokens: Arc<dyn RefreshTokenStore>,
    signer: Arc<TokenSigner>,
    audit: Arc<dyn AuditSink>,
    cache: Arc<RevocationCache>,
    limiter: SessionLimiter,
    owner_locks: OwnerLocks,
    config: AuthConfig,
}

impl TokenLifecycle {
    #[must_use]
    pub fn new(
        tokens: Arc<dyn RefreshTokenStore>,
        signer: Arc<TokenSigner>,
        audit: Arc<dyn AuditSink>,
        cache: Arc<RevocationCache>,
        config: AuthConfig,
    ) -> Self {
        let limiter = SessionLimiter::new(tokens.clone());
        Self {
            tokens,
            signer,
            audit,
            cache,
            limiter,
            owner_locks: OwnerLocks::new(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Issue a fresh access/refresh pair for a verified account.
    ///
    /// Holds the owner lock across admission and insert so concurrent
    /// logins for one account cannot both pass the session cap. Fails
    /// closed: if the refresh row cannot be persisted, the minted access
    /// token is discarded along with the error.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` or `Signing`.
    pub async fn issue_for_login(
        &self,
        account: &Account,
        client_ip: Option<&str>,
        device: Option<&str>,
    ) -> Result<TokenPair, AuthError> {
        let _guard = self.owner_locks.lock(account.id).await;

        let evicted = self
            .limiter
            .admit(
                account.id,
                self.config.max_concurrent_sessions(),
                client_ip,
            )
            .await?;
        for session in &evicted {
            self.cache
                .mark_revoked(session.access_token_id, session.expires_at);
            self.audit
                .emit(
                    AuditEvent::new(
                        AuditKind::TokenRevocation,
                        account.id.to_string(),
                        client_ip,
                    )
                    .with_detail(SESSION_LIMIT_REASON),
                )
                .await;
        }

        let now = Utc::now();
        let pair = self.mint_pair(account.id, client_ip, device, now).await?;

        self.audit
            .emit(AuditEvent::new(
                AuditKind::SuccessfulAuthentication,
                account.id.to_string(),
                client_ip,
            ))
            .await;
        Ok(pair)
    }

    /// Rotate a refresh token: validate the presented pair, then atomically
    /// revoke the old row and create its successor.
    ///
    /// Presenting an already-revoked token is treated as possible token
    /// theft: it is audited, optionally triggers family-wide revocation
    /// (`revoke_family_on_reuse`), and returns `TokenRevoked`. The access
    /// token may be expired; only its signature and claims are checked
    /// against the refresh row.
    ///
    /// # Errors
    ///
    /// `TokenNotFound`, `TokenExpired`, `TokenRevoked`, `TokenMismatch`,
    /// `Signing`, or `StoreUnavailable` after retries.
    pub async fn rotate(
        &self,
        presented: &str,
        access_token: &str,
        client_ip: Option<&str>,
        device: Option<&str>,
    ) -> Result<TokenPair, AuthError> {
        let mut transient_attempts: u32 = 0;
        loop {
            let Some(row) = self
                .tokens
                .find_by_token(presented)
                .await
                .map_err(AuthError::StoreUnavailable)?
            else {
                // No row means no owner to attribute the attempt to.
                self.audit
                    .emit(
                        AuditEvent::new(AuditKind::TokenRejected, "unknown", client_ip)
                            .with_detail("refresh token not found"),
                    )
                    .await;
                return Err(AuthError::TokenNotFound);
            };

            let now = Utc::now();
            if row.revoked {
                self.on_reuse_detected(&row, client_ip).await?;
                return Err(AuthError::TokenRevoked);
            }
            if row.is_expired(now) {
                self.audit
                    .emit(
                        AuditEvent::new(
                            AuditKind::TokenRejected,
                            row.owner_id.to_string(),
                            client_ip,
                        )
                        .with_detail("refresh token expired"),
                    )
                    .await;
                return Err(AuthError::TokenExpired);
            }

            let claims = match self.signer.validate_ignoring_expiry(access_token) {
                Ok(claims) => claims,
                Err(err) => {
                    debug!(owner = %row.owner_id, "presented access token failed validation: {err}");
                    return Err(AuthError::TokenMismatch);
                }
            };
            if claims.jti != row.access_token_id || claims.sub != row.owner_id {
                debug!(
                    owner = %row.owner_id,
                    "access token claims do not match refresh record"
                );
                return Err(AuthError::TokenMismatch);
            }

            let issued = self.signer.issue(
                row.owner_id,
                device,
                self.config.access_token_ttl(),
                now,
            )?;
            let new_row = self.build_row(issued.token_id, row.owner_id, client_ip, device, now)?;

            match self
                .tokens
                .rotate_atomically(presented, client_ip, &new_row)
                .await
            {
                Ok(RotateOutcome::Rotated) => {
                    // Cache write strictly after the committed transaction;
                    // the old access token must reject immediately.
                    self.cache.mark_revoked(row.access_token_id, row.expires_at);
                    self.audit
                        .emit(AuditEvent::new(
                            AuditKind::TokenRefreshed,
                            row.owner_id.to_string(),
                            client_ip,
                        ))
                        .await;
                    return Ok(TokenPair {
                        access_token: issued.token,
                        access_token_id: issued.token_id,
                        access_expires_at: issued.expires_at,
                        refresh_token: new_row.token,
                        refresh_expires_at: new_row.expires_at,
                    });
                }
                Ok(RotateOutcome::Conflict) => {
                    // A concurrent revoke or rotate won; the next read
                    // surfaces the terminal error it left behind.
                    debug!(owner = %row.owner_id, "rotation conflict, revalidating");
                }
                Err(store_err) => {
                    transient_attempts += 1;
                    warn!(
                        attempt = transient_attempts,
                        "rotation attempt failed: {store_err:#}"
                    );
                    let err = AuthError::StoreUnavailable(store_err);
                    if !err.is_transient() || transient_attempts > self.config.rotation_retries()
                    {
                        return Err(err);
                    }
                    let backoff = self
                        .config
                        .rotation_backoff()
                        .to_std()
                        .unwrap_or_default();
                    tokio::time::sleep(backoff * transient_attempts).await;
                }
            }
        }
    }

    /// Revoke one refresh token.
    ///
    /// Revoking an already-revoked token reports `AlreadyRevoked` rather
    /// than silently succeeding, so callers can spot double revocation.
    ///
    /// # Errors
    ///
    /// `TokenNotFound`, `AlreadyRevoked`, or `StoreUnavailable`.
    pub async fn revoke(
        &self,
        token: &str,
        client_ip: Option<&str>,
        reason: &str,
    ) -> Result<(), AuthError> {
        let outcome = self
            .tokens
            .revoke(token, client_ip, reason)
            .await
            .map_err(AuthError::StoreUnavailable)?;

        match outcome {
            RevokeOutcome::NotFound => {
                self.audit
                    .emit(
                        AuditEvent::new(AuditKind::TokenRejected, "unknown", client_ip)
                            .with_detail("refresh token not found"),
                    )
                    .await;
                Err(AuthError::TokenNotFound)
            }
            RevokeOutcome::AlreadyRevoked => {
                debug!("revoke requested for already-revoked token");
                Err(AuthError::AlreadyRevoked)
            }
            RevokeOutcome::Revoked {
                access_token_id,
                expires_at,
            } => {
                self.cache.mark_revoked(access_token_id, expires_at);
                self.audit
                    .emit(
                        AuditEvent::new(
                            AuditKind::TokenRevocation,
                            access_token_id.to_string(),
                            client_ip,
                        )
                        .with_detail(reason),
                    )
                    .await;
                Ok(())
            }
        }
    }

    /// Revoke every live token of an owner (logout everywhere). A no-op
    /// when the owner has none; never fails for that reason.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable`.
    pub async fn revoke_all_for_owner(
        &self,
        owner_id: Uuid,
        client_ip: Option<&str>,
        reason: &str,
    ) -> Result<(), AuthError> {
        let _guard = self.owner_locks.lock(owner_id).await;

        let affected = self
            .tokens
            .revoke_all_for_owner(owner_id, client_ip, reason)
            .await
            .map_err(AuthError::StoreUnavailable)?;

        for (access_token_id, expires_at) in &affected {
            self.cache.mark_revoked(*access_token_id, *expires_at);
        }
        if !affected.is_empty() {
            self.audit
                .emit(
                    AuditEvent::new(AuditKind::TokenRevocation, owner_id.to_string(), client_ip)
                        .with_detail(format!("{reason} ({} tokens)", affected.len())),
                )
                .await;
        }
        Ok(())
    }

    async fn on_reuse_detected(
        &self,
        row: &RefreshToken,
        client_ip: Option<&str>,
    ) -> Result<(), AuthError> {
        warn!(owner = %row.owner_id, "revoked refresh token presented for rotation");
        self.audit
            .emit(AuditEvent::new(
                AuditKind::TokenReuseDetected,
                row.owner_id.to_string(),
                client_ip,
            ))
            .await;
        if self.config.revoke_family_on_reuse() {
            self.revoke_all_for_owner(row.owner_id, client_ip, REUSE_REASON)
                .await?;
        }
        Ok(())
    }

    async fn mint_pair(
        &self,
        owner_id: Uuid,
        client_ip: Option<&str>,
        device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, AuthError> {
        let issued = self
            .signer
            .issue(owner_id, device, self.config.access_token_ttl(), now)?;
        let new_row = self.build_row(issued.token_id, owner_id, client_ip, device, now)?;
        self.tokens
            .insert(&new_row)
            .await
            .map_err(AuthError::StoreUnavailable)?;
        Ok(TokenPair {
            access_token: issued.token,
            access_token_id: issued.token_id,
            access_expires_at: issued.expires_at,
            refresh_token: new_row.token,
            refresh_expires_at: new_row.expires_at,
        })
    }

    fn build_row(
        &self,
        access_token_id: Uuid,
        owner_id: Uuid,
        client_ip: Option<&str>,
        device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RefreshToken, AuthError> {
        Ok(RefreshToken {
            token: generate_refresh_token()?,
            access_token_id,
            owner_id,
            issued_at: now,
            expires_at: now + self.config.refresh_token_ttl(),
            revoked: false,
            revoked_at: None,
            revoked_by_ip: None,
            revocation_reason: None,
            replaced_by_token: None,
            created_by_ip: client_ip.map(ToString::to_string),
            device_label: device.map(ToString::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{generate_refresh_token, OwnerLocks};
    use base64ct::{Base64UrlUnpadded, Encoding};
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn refresh_tokens_are_unique_high_entropy() {
        let first = generate_refresh_token().unwrap();
        let second = generate_refresh_token().unwrap();
        assert_ne!(first, second);
        assert_eq!(Base64UrlUnpadded::decode_vec(&first).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn owner_lock_serializes_same_owner() {
        let locks = Arc::new(OwnerLocks::new());
        let owner = Uuid::new_v4();
        let inside = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(owner).await;
                // Inside the guard nobody else may enter for this owner.
                assert_eq!(
                    inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst),
                    0
                );
                tokio::task::yield_now().await;
                inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn distinct_owners_do_not_contend() {
        let locks = OwnerLocks::new();
        let guard_a = locks.lock(Uuid::new_v4()).await;
        // A second owner's lock must be acquirable while the first is held.
        let guard_b = locks.lock(Uuid::new_v4()).await;
        drop(guard_a);
        drop(guard_b);
    }

    #[tokio::test]
    async fn released_locks_are_pruned() {
        let locks = OwnerLocks::new();
        let owner = Uuid::new_v4();
        drop(locks.lock(owner).await);
        // Locking a different owner triggers pruning of the released entry.
        drop(locks.lock(Uuid::new_v4()).await);
        assert_eq!(locks.inner.lock().await.len(), 1);
    }
}
