//! Credential verification with failed-attempt lockout.

use anyhow::{anyhow, Context, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2, Params,
};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::warn;

use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::models::Account;
use crate::store::CredentialStore;

/// Hash a password with Argon2id (OWASP parameters: m=19456 KiB, t=2, p=1).
///
/// # Errors
///
/// Returns an error if parameter construction or hashing fails.
pub fn hash_password(password: &SecretString) -> Result<String> {
    let params = Params::new(19_456, 2, 1, None).map_err(|e| anyhow!("argon2 params: {e}"))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("password hashing failed: {e}"))
}

/// Verify a password against a stored Argon2 hash. An unparseable stored
/// hash counts as a mismatch rather than an error.
#[must_use]
pub fn verify_password(password: &SecretString, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        warn!("stored password hash is not a valid PHC string");
        return false;
    };
    // Argon2::default reads the parameters back out of the hash itself.
    Argon2::default()
        .verify_password(password.expose_secret().as_bytes(), &parsed)
        .is_ok()
}

/// Validates identifier/password pairs against the credential store and
/// enforces the failed-attempt lockout window.
pub struct CredentialVerifier {
    store: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditSink>,
    config: AuthConfig,
}

impl CredentialVerifier {
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        audit: Arc<dyn AuditSink>,
        config: AuthConfig,
    ) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    /// Verify credentials for a login attempt.
    ///
    /// Unknown identifiers and wrong passwords are indistinguishable
    /// (`InvalidCredentials` for both); lockout and deactivation are not
    /// secrets and get their own kinds. Every rejecting branch emits an
    /// audit event before returning.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials`, `AccountDeactivated`, `LockedOut`, or
    /// `StoreUnavailable`.
    pub async fn verify(
        &self,
        identifier: &str,
        secret: &SecretString,
        client_ip: Option<&str>,
    ) -> Result<Account, AuthError> {
        let account = self
            .store
            .find_by_identifier(identifier)
            .await
            .map_err(AuthError::StoreUnavailable)?;

        // Lookup failed: the audit subject is the raw identifier, since
        // there is no account id to attribute the attempt to.
        let Some(mut account) = account else {
            self.audit
                .emit(AuditEvent::new(
                    AuditKind::UnknownIdentifier,
                    identifier,
                    client_ip,
                ))
                .await;
            return Err(AuthError::InvalidCredentials);
        };

        if !account.is_active {
            self.audit
                .emit(AuditEvent::new(
                    AuditKind::AccountDeactivated,
                    account.id.to_string(),
                    client_ip,
                ))
                .await;
            return Err(AuthError::AccountDeactivated);
        }

        if self.locked_out(&account) {
            self.audit
                .emit(
                    AuditEvent::new(AuditKind::LockedOut, account.id.to_string(), client_ip)
                        .with_detail(format!(
                            "failed attempts: {}",
                            account.failed_login_attempts
                        )),
                )
                .await;
            return Err(AuthError::LockedOut);
        }

        if !verify_password(secret, &account.password_hash) {
            account.failed_login_attempts = account.failed_login_attempts.saturating_add(1);
            account.last_failed_or_lock_at = Some(Utc::now());
            self.store
                .save_auth_state(&account)
                .await
                .context("persist failed-attempt counter")
                .map_err(AuthError::StoreUnavailable)?;
            self.audit
                .emit(AuditEvent::new(
                    AuditKind::InvalidPassword,
                    account.id.to_string(),
                    client_ip,
                ))
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        if account.failed_login_attempts != 0 || account.last_failed_or_lock_at.is_some() {
            account.failed_login_attempts = 0;
            account.last_failed_or_lock_at = None;
            self.store
                .save_auth_state(&account)
                .await
                .context("reset failed-attempt counter")
                .map_err(AuthError::StoreUnavailable)?;
        }

        Ok(account)
    }

    /// Locked out when the counter reached the threshold and the window has
    /// not yet elapsed. Once the window passes, a correct login goes
    /// through and resets the counter.
    fn locked_out(&self, account: &Account) -> bool {
        let threshold = i64::from(self.config.failed_attempt_threshold());
        if threshold <= 0 || i64::from(account.failed_login_attempts) < threshold {
            return false;
        }
        match account.last_failed_or_lock_at {
            Some(last) => Utc::now() - last < self.config.lockout_window(),
            None => false,
        }
    }
}
