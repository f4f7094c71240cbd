//! `TokenValidator::acquire` — the single contract every outbound
//! authenticated request goes through (spec §4.3).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use collections_core::{Classify, Clock, ErrorKind};
use collections_ratelimit::ExponentialBackoff;

use crate::{
    cache::{TokenCache, TokenCacheError},
    token::Token,
};

/// The injected collaborator that actually talks to the provider's refresh
/// endpoint, kept separate so `TokenValidator` is unit-testable without a
/// network (mirrors `gdrive::oauth2::refresh_if_necessary` taking a
/// `&reqwest::Client` as its own injected collaborator).
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError>;
}

#[derive(Clone, Debug)]
pub struct RefreshedToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: OffsetDateTime,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Error)]
#[error("refresh call failed: {message}")]
pub struct RefreshError {
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("provider {provider} is in degraded mode; refresh disabled until a manual reset")]
    DegradedMode { provider: String },
    #[error("no token configured for {provider}:{account_id}")]
    NotConfigured { provider: String, account_id: String },
    #[error(transparent)]
    Cache(#[from] TokenCacheError),
    #[error("refresh attempts exhausted for {provider}:{account_id}")]
    RefreshExhausted { provider: String, account_id: String },
}

impl Classify for ValidatorError {
    fn kind(&self) -> ErrorKind {
        match self {
            ValidatorError::DegradedMode { .. } => ErrorKind::DegradedMode,
            ValidatorError::NotConfigured { .. } => ErrorKind::AuthMissing,
            ValidatorError::Cache(_) => ErrorKind::Transient,
            ValidatorError::RefreshExhausted { .. } => ErrorKind::AuthExpired,
        }
    }
}

pub const MAX_REFRESH_ATTEMPTS: u32 = 3;

/// Process-wide, per-provider DEGRADED latch. Reset only by an explicit
/// operator call to [`TokenValidator::reset_degraded`], never automatically
/// — mirrors the original's `reset_degraded_mode()`.
#[derive(Default)]
struct LatchState {
    degraded: HashMap<String, bool>,
}

pub struct TokenValidator<S, R> {
    cache: TokenCache<S>,
    refresher: R,
    clock: Arc<dyn Clock>,
    buffer_secs: i64,
    latch: Mutex<LatchState>,
    backoff: ExponentialBackoff,
}

impl<S, R> TokenValidator<S, R>
where
    S: collections_secrets::SecretStore,
    R: TokenRefresher,
{
    pub fn new(cache: TokenCache<S>, refresher: R, clock: Arc<dyn Clock>, buffer_secs: i64) -> Self {
        Self {
            cache,
            refresher,
            clock,
            buffer_secs,
            latch: Mutex::new(LatchState::default()),
            backoff: ExponentialBackoff::default(),
        }
    }

    pub fn is_degraded(&self, provider: &str) -> bool {
        self.latch
            .lock()
            .expect("latch mutex poisoned")
            .degraded
            .get(provider)
            .copied()
            .unwrap_or(false)
    }

    /// Explicit operator action; never called automatically.
    pub fn reset_degraded(&self, provider: &str) {
        self.latch
            .lock()
            .expect("latch mutex poisoned")
            .degraded
            .insert(provider.to_owned(), false);
        info!(provider, "degraded mode reset by operator");
    }

    fn enter_degraded(&self, provider: &str) {
        self.latch
            .lock()
            .expect("latch mutex poisoned")
            .degraded
            .insert(provider.to_owned(), true);
        error!(provider, "entering degraded mode after repeated refresh failures");
    }

    /// Implements spec §4.3's five-step algorithm. `sleep` is injected so
    /// tests can skip real wall-clock waits between retry attempts.
    pub async fn acquire<Sleep, Fut>(
        &self,
        provider: &str,
        account_id: &str,
        sleep: Sleep,
    ) -> Result<Token, ValidatorError>
    where
        Sleep: Fn(std::time::Duration) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        if self.is_degraded(provider) {
            return Err(ValidatorError::DegradedMode {
                provider: provider.to_owned(),
            });
        }

        let mut token = self
            .cache
            .load(provider, account_id)?
            .ok_or_else(|| ValidatorError::NotConfigured {
                provider: provider.to_owned(),
                account_id: account_id.to_owned(),
            })?;

        if !token.is_expired(self.clock.as_ref(), self.buffer_secs) {
            return Ok(token);
        }

        let Some(refresh_token) = token.refresh_token.clone() else {
            return Err(ValidatorError::NotConfigured {
                provider: provider.to_owned(),
                account_id: account_id.to_owned(),
            });
        };

        for attempt in 1..=MAX_REFRESH_ATTEMPTS {
            match self.refresher.refresh(&refresh_token) {
                Ok(refreshed) => {
                    let old_prefix = token.access_token_prefix().to_owned();
                    token = Token {
                        provider: provider.to_owned(),
                        account_id: account_id.to_owned(),
                        access_token: refreshed.access_token,
                        token_type: refreshed.token_type,
                        expires_at: refreshed.expires_at,
                        refresh_token: refreshed.refresh_token.or(Some(refresh_token)),
                        scope: refreshed.scope,
                        cached_at: self.clock.now(),
                    };
                    self.audit_refresh(provider, account_id, &old_prefix, token.access_token_prefix());
                    self.cache.save(provider, account_id, &token)?;
                    self.backoff.reset();
                    return Ok(token);
                }
                Err(e) if attempt < MAX_REFRESH_ATTEMPTS => {
                    let delay = self.backoff.get_delay();
                    warn!(provider, account_id, attempt, error = %e, delay_secs = delay.as_secs_f64(), "refresh attempt failed, backing off");
                    sleep(delay).await;
                }
                Err(e) => {
                    debug!(provider, account_id, error = %e, "final refresh attempt failed");
                }
            }
        }

        self.enter_degraded(provider);
        Err(ValidatorError::RefreshExhausted {
            provider: provider.to_owned(),
            account_id: account_id.to_owned(),
        })
    }

    /// Writes an audit record containing only the first 8 characters of the
    /// old and new access tokens (spec §4.3 step 5).
    fn audit_refresh(&self, provider: &str, account_id: &str, old_prefix: &str, new_prefix: &str) {
        info!(
            provider,
            account_id,
            old_access_token_prefix = old_prefix,
            new_access_token_prefix = new_prefix,
            "token refreshed"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::TokenCache;
    use collections_core::FixedClock;
    use collections_secrets::FileSecretStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use time::Duration;

    struct AlwaysFails;
    impl TokenRefresher for AlwaysFails {
        fn refresh(&self, _refresh_token: &str) -> Result<RefreshedToken, RefreshError> {
            Err(RefreshError {
                message: "network down".into(),
            })
        }
    }

    struct AlwaysSucceeds;
    impl TokenRefresher for AlwaysSucceeds {
        fn refresh(&self, _refresh_token: &str) -> Result<RefreshedToken, RefreshError> {
            Ok(RefreshedToken {
                access_token: "new-access-token-1".into(),
                token_type: "Bearer".into(),
                expires_at: OffsetDateTime::now_utc() + Duration::hours(1),
                refresh_token: Some("new-refresh".into()),
                scope: Some("Mail.Send".into()),
            })
        }
    }

    fn seeded_cache(tmp: &tempfile::TempDir, expired: bool, clock_now: OffsetDateTime) -> TokenCache<FileSecretStore> {
        let store = Arc::new(FileSecretStore::open(tmp.path(), b"pw").unwrap());
        let cache = TokenCache::new(store, "novotechno");
        let expires_at = if expired {
            clock_now - Duration::hours(1)
        } else {
            clock_now + Duration::hours(1)
        };
        let tok = Token {
            provider: "microsoft".into(),
            account_id: "acct1".into(),
            access_token: "old-access-token1".into(),
            token_type: "Bearer".into(),
            expires_at,
            refresh_token: Some("refresh-xyz".into()),
            scope: Some("Mail.Send".into()),
            cached_at: clock_now,
        };
        cache.save("microsoft", "acct1", &tok).unwrap();
        cache
    }

    async fn no_sleep(_d: std::time::Duration) {}

    #[tokio::test]
    async fn valid_token_is_returned_without_refresh() {
        let tmp = tempfile::tempdir().unwrap();
        let now = OffsetDateTime::now_utc();
        let clock = Arc::new(FixedClock::new(now));
        let cache = seeded_cache(&tmp, false, now);
        let validator = TokenValidator::new(cache, AlwaysFails, clock, 300);
        let tok = validator.acquire("microsoft", "acct1", no_sleep).await.unwrap();
        assert_eq!(tok.access_token, "old-access-token1");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let tmp = tempfile::tempdir().unwrap();
        let now = OffsetDateTime::now_utc();
        let clock = Arc::new(FixedClock::new(now));
        let cache = seeded_cache(&tmp, true, now);
        let validator = TokenValidator::new(cache, AlwaysSucceeds, clock, 300);
        let tok = validator.acquire("microsoft", "acct1", no_sleep).await.unwrap();
        assert_eq!(tok.access_token, "new-access-token-1");
    }

    #[tokio::test]
    async fn repeated_failures_enter_degraded_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let now = OffsetDateTime::now_utc();
        let clock = Arc::new(FixedClock::new(now));
        let cache = seeded_cache(&tmp, true, now);
        let validator = TokenValidator::new(cache, AlwaysFails, clock, 300);

        let sleeps = AtomicU32::new(0);
        let counting_sleep = |_d: std::time::Duration| {
            sleeps.fetch_add(1, Ordering::SeqCst);
            async {}
        };
        let err = validator
            .acquire("microsoft", "acct1", counting_sleep)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidatorError::RefreshExhausted { .. }));
        assert!(validator.is_degraded("microsoft"));

        let again = validator.acquire("microsoft", "acct1", no_sleep).await;
        assert!(matches!(again, Err(ValidatorError::DegradedMode { .. })));

        validator.reset_degraded("microsoft");
        assert!(!validator.is_degraded("microsoft"));
    }

    #[tokio::test]
    async fn missing_account_is_not_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let now = OffsetDateTime::now_utc();
        let clock = Arc::new(FixedClock::new(now));
        let store = Arc::new(FileSecretStore::open(tmp.path(), b"pw").unwrap());
        let cache = TokenCache::new(store, "novotechno");
        let validator = TokenValidator::new(cache, AlwaysFails, clock, 300);
        let err = validator.acquire("microsoft", "nope", no_sleep).await.unwrap_err();
        assert!(matches!(err, ValidatorError::NotConfigured { .. }));
    }
}
