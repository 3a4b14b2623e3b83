//! Auth core configuration.

use chrono::Duration;

const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_MAX_CONCURRENT_SESSIONS: i32 = 5;
const DEFAULT_FAILED_ATTEMPT_THRESHOLD: u32 = 5;
const DEFAULT_LOCKOUT_WINDOW_SECONDS: i64 = 15 * 60;
const DEFAULT_RETENTION_HORIZON_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_ROTATION_RETRIES: u32 = 3;
const DEFAULT_ROTATION_BACKOFF_MILLIS: i64 = 50;
const DEFAULT_ISSUER: &str = "kunci";

/// Tunables for credential verification and token lifecycle.
///
/// `max_concurrent_sessions <= 0` disables the session cap.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    issuer: String,
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
    max_concurrent_sessions: i32,
    failed_attempt_threshold: u32,
    lockout_window: Duration,
    retention_horizon: Duration,
    revoke_family_on_reuse: bool,
    rotation_retries: u32,
    rotation_backoff: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            access_token_ttl: Duration::seconds(DEFAULT_ACCESS_TOKEN_TTL_SECONDS),
            refresh_token_ttl: Duration::seconds(DEFAULT_REFRESH_TOKEN_TTL_SECONDS),
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            failed_attempt_threshold: DEFAULT_FAILED_ATTEMPT_THRESHOLD,
            lockout_window: Duration::seconds(DEFAULT_LOCKOUT_WINDOW_SECONDS),
            retention_horizon: Duration::seconds(DEFAULT_RETENTION_HORIZON_SECONDS),
            revoke_family_on_reuse: false,
            rotation_retries: DEFAULT_ROTATION_RETRIES,
            rotation_backoff: Duration::milliseconds(DEFAULT_ROTATION_BACKOFF_MILLIS),
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_access_token_ttl(mut self, ttl: Duration) -> Self {
        self.access_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_sessions(mut self, max: i32) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    #[must_use]
    pub fn with_failed_attempt_threshold(mut self, threshold: u32) -> Self {
        self.failed_attempt_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_lockout_window(mut self, window: Duration) -> Self {
        self.lockout_window = window;
        self
    }

    #[must_use]
    pub fn with_retention_horizon(mut self, horizon: Duration) -> Self {
        self.retention_horizon = horizon;
        self
    }

    /// When a revoked refresh token is replayed during rotation, also revoke
    /// every live token of the owner. Off by default: common client races
    /// (double-submit on refresh) would otherwise log out sibling sessions.
    #[must_use]
    pub fn with_revoke_family_on_reuse(mut self, enabled: bool) -> Self {
        self.revoke_family_on_reuse = enabled;
        self
    }

    #[must_use]
    pub fn with_rotation_retries(mut self, retries: u32) -> Self {
        self.rotation_retries = retries;
        self
    }

    #[must_use]
    pub fn with_rotation_backoff(mut self, backoff: Duration) -> Self {
        self.rotation_backoff = backoff;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn access_token_ttl(&self) -> Duration {
        self.access_token_ttl
    }

    #[must_use]
    pub fn refresh_token_ttl(&self) -> Duration {
        self.refresh_token_ttl
    }

    #[must_use]
    pub fn max_concurrent_sessions(&self) -> i32 {
        self.max_concurrent_sessions
    }

    #[must_use]
    pub fn failed_attempt_threshold(&self) -> u32 {
        self.failed_attempt_threshold
    }

    #[must_use]
    pub fn lockout_window(&self) -> Duration {
        self.lockout_window
    }

    #[must_use]
    pub fn retention_horizon(&self) -> Duration {
        self.retention_horizon
    }

    #[must_use]
    pub fn revoke_family_on_reuse(&self) -> bool {
        self.revoke_family_on_reuse
    }

    #[must_use]
    pub fn rotation_retries(&self) -> u32 {
        self.rotation_retries
    }

    #[must_use]
    pub fn rotation_backoff(&self) -> Duration {
        self.rotation_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::AuthConfig;
    use chrono::Duration;

    #[test]
    fn defaults_and_overrides() {
        let config = AuthConfig::new();

        assert_eq!(config.issuer(), super::DEFAULT_ISSUER);
        assert_eq!(
            config.access_token_ttl(),
            Duration::seconds(super::DEFAULT_ACCESS_TOKEN_TTL_SECONDS)
        );
        assert_eq!(
            config.max_concurrent_sessions(),
            super::DEFAULT_MAX_CONCURRENT_SESSIONS
        );
        assert_eq!(
            config.failed_attempt_threshold(),
            super::DEFAULT_FAILED_ATTEMPT_THRESHOLD
        );
        assert!(!config.revoke_family_on_reuse());

        let config = config
            .with_issuer("auth.test".to_string())
            .with_access_token_ttl(Duration::seconds(60))
            .with_refresh_token_ttl(Duration::seconds(3600))
            .with_max_concurrent_sessions(2)
            .with_failed_attempt_threshold(3)
            .with_lockout_window(Duration::milliseconds(250))
            .with_revoke_family_on_reuse(true)
            .with_rotation_retries(1)
            .with_rotation_backoff(Duration::milliseconds(5));

        assert_eq!(config.issuer(), "auth.test");
        assert_eq!(config.access_token_ttl(), Duration::seconds(60));
        assert_eq!(config.refresh_token_ttl(), Duration::seconds(3600));
        assert_eq!(config.max_concurrent_sessions(), 2);
        assert_eq!(config.failed_attempt_threshold(), 3);
        assert_eq!(config.lockout_window(), Duration::milliseconds(250));
        assert!(config.revoke_family_on_reuse());
        assert_eq!(config.rotation_retries(), 1);
        assert_eq!(config.rotation_backoff(), Duration::milliseconds(5));
    }

    #[test]
    fn unlimited_sessions_when_non_positive() {
        let config = AuthConfig::new().with_max_concurrent_sessions(0);
        assert!(config.max_concurrent_sessions() <= 0);
    }
}
