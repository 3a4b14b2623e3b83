//! Top-level auth facade wiring the verifier, the token lifecycle, the
//! signer, and the revocation cache behind one surface.

use chrono::Utc;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::lifecycle::{TokenLifecycle, TokenPair};
use crate::revocation::RevocationCache;
use crate::signer::{self, Claims, TokenSigner};
use crate::store::{CredentialStore, RefreshTokenStore};
use crate::verifier::CredentialVerifier;

/// Single entry point for login, rotation, revocation, and request
/// authentication. Construct one per process and share it behind an `Arc`.
pub struct AuthService {
    verifier: CredentialVerifier,
    lifecycle: TokenLifecycle,
    signer: Arc<TokenSigner>,
    cache: Arc<RevocationCache>,
    tokens: Arc<dyn RefreshTokenStore>,
    config: AuthConfig,
}

impl AuthService {
    #[must_use]
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        tokens: Arc<dyn RefreshTokenStore>,
        signer: Arc<TokenSigner>,
        audit: Arc<dyn AuditSink>,
        config: AuthConfig,
    ) -> Self {
        let cache = Arc::new(RevocationCache::new());
        let verifier = CredentialVerifier::new(credentials, audit.clone(), config.clone());
        let lifecycle = TokenLifecycle::new(
            tokens.clone(),
            signer.clone(),
            audit,
            cache.clone(),
            config.clone(),
        );
        Self {
            verifier,
            lifecycle,
            signer,
            cache,
            tokens,
            config,
        }
    }

    /// Verify credentials and, on success, issue an access/refresh pair.
    ///
    /// # Errors
    ///
    /// Credential rejections from [`CredentialVerifier::verify`] plus
    /// `Signing` and `StoreUnavailable` from issuance.
    pub async fn login(
        &self,
        identifier: &str,
        secret: &SecretString,
        client_ip: Option<&str>,
        device: Option<&str>,
    ) -> Result<TokenPair, AuthError> {
        let account = self.verifier.verify(identifier, secret, client_ip).await?;
        self.lifecycle
            .issue_for_login(&account, client_ip, device)
            .await
    }

    /// Exchange a refresh token and its paired access token for a new pair.
    ///
    /// # Errors
    ///
    /// See [`TokenLifecycle::rotate`].
    pub async fn rotate(
        &self,
        refresh_token: &str,
        access_token: &str,
        client_ip: Option<&str>,
        device: Option<&str>,
    ) -> Result<TokenPair, AuthError> {
        self.lifecycle
            .rotate(refresh_token, access_token, client_ip, device)
            .await
    }

    /// Revoke one refresh token.
    ///
    /// # Errors
    ///
    /// See [`TokenLifecycle::revoke`].
    pub async fn revoke(
        &self,
        refresh_token: &str,
        client_ip: Option<&str>,
        reason: &str,
    ) -> Result<(), AuthError> {
        self.lifecycle.revoke(refresh_token, client_ip, reason).await
    }

    /// Revoke every live token of an owner.
    ///
    /// # Errors
    ///
    /// See [`TokenLifecycle::revoke_all_for_owner`].
    pub async fn revoke_all_for_owner(
        &self,
        owner_id: Uuid,
        client_ip: Option<&str>,
        reason: &str,
    ) -> Result<(), AuthError> {
        self.lifecycle
            .revoke_all_for_owner(owner_id, client_ip, reason)
            .await
    }

    /// Authenticate an ordinary request: strict signature and expiry
    /// validation, then an O(1) revocation-cache lookup on the `jti` claim.
    /// No store round trip on this path.
    ///
    /// # Errors
    ///
    /// `TokenExpired`, `TokenMismatch` for tokens that fail validation, or
    /// `TokenRevoked` when the token was revoked before its natural expiry.
    pub fn authenticate_request(&self, access_token: &str) -> Result<Claims, AuthError> {
        let claims = match self.signer.validate_strict(access_token, Utc::now()) {
            Ok(claims) => claims,
            Err(signer::Error::Expired) => return Err(AuthError::TokenExpired),
            Err(err) => {
                debug!("access token failed validation: {err}");
                return Err(AuthError::TokenMismatch);
            }
        };
        if self.cache.is_revoked(claims.jti) {
            return Err(AuthError::TokenRevoked);
        }
        Ok(claims)
    }

    /// Load every revoked-but-unexpired token into the revocation cache.
    /// Call once at startup before serving requests.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable`.
    pub async fn warm_revocation_cache(&self) -> Result<usize, AuthError> {
        let loaded = self.cache.warm_from_store(self.tokens.as_ref()).await?;
        info!(loaded, "revocation cache warmed");
        Ok(loaded)
    }

    /// Delete refresh rows older than the retention horizon. Returns the
    /// number of rows removed. Intended to be driven by an external
    /// scheduler.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable`.
    pub async fn purge_stale(&self) -> Result<u64, AuthError> {
        let cutoff = Utc::now() - self.config.retention_horizon();
        let purged = self
            .tokens
            .purge_stale(cutoff)
            .await
            .map_err(AuthError::StoreUnavailable)?;
        if purged > 0 {
            info!(purged, "stale refresh tokens purged");
        }
        Ok(purged)
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn revocation_cache(&self) -> &RevocationCache {
        &self.cache
    }
}
