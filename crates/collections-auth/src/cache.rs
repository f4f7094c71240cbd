//! Wraps a [`SecretStore`] with the [`Token`] schema (spec §4.2).

use std::sync::Arc;

use collections_secrets::{SecretStore, SecretStoreError};
use thiserror::Error;

use crate::token::Token;

#[derive(Debug, Error)]
pub enum TokenCacheError {
    #[error(transparent)]
    Store(#[from] SecretStoreError),
    #[error("failed to serialize token: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize token: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// `{app}.{provider}:{account}` key format (spec §6).
fn cache_key(app_name: &str, provider: &str, account_id: &str) -> String {
    format!("{app_name}.{provider}:{account_id}")
}

pub struct TokenCache<S> {
    store: Arc<S>,
    app_name: String,
}

impl<S: SecretStore> TokenCache<S> {
    pub fn new(store: Arc<S>, app_name: impl Into<String>) -> Self {
        Self {
            store,
            app_name: app_name.into(),
        }
    }

    pub fn save(&self, provider: &str, account_id: &str, token: &Token) -> Result<(), TokenCacheError> {
        let key = cache_key(&self.app_name, provider, account_id);
        let bytes = serde_json::to_vec(token).map_err(TokenCacheError::Serialize)?;
        self.store.put(&key, &bytes)?;
        Ok(())
    }

    pub fn load(&self, provider: &str, account_id: &str) -> Result<Option<Token>, TokenCacheError> {
        let key = cache_key(&self.app_name, provider, account_id);
        match self.store.get(&key)? {
            Some(bytes) => {
                let token = serde_json::from_slice(&bytes).map_err(TokenCacheError::Deserialize)?;
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }

    pub fn delete(&self, provider: &str, account_id: &str) -> Result<(), TokenCacheError> {
        let key = cache_key(&self.app_name, provider, account_id);
        self.store.delete(&key)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use collections_secrets::FileSecretStore;
    use time::{Duration, OffsetDateTime};

    fn sample_token() -> Token {
        Token {
            provider: "microsoft".into(),
            account_id: "acct1".into(),
            access_token: "abcdefghijklmnop".into(),
            token_type: "Bearer".into(),
            expires_at: OffsetDateTime::now_utc() + Duration::hours(1),
            refresh_token: Some("refresh-xyz".into()),
            scope: Some("Mail.Send".into()),
            cached_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSecretStore::open(tmp.path(), b"pw").unwrap());
        let cache = TokenCache::new(store, "novotechno");
        let tok = sample_token();
        cache.save("microsoft", "acct1", &tok).unwrap();
        let loaded = cache.load("microsoft", "acct1").unwrap().unwrap();
        assert_eq!(loaded.access_token, tok.access_token);
        assert_eq!(loaded.account_id, tok.account_id);
    }

    #[test]
    fn load_missing_account_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSecretStore::open(tmp.path(), b"pw").unwrap());
        let cache: TokenCache<FileSecretStore> = TokenCache::new(store, "novotechno");
        assert!(cache.load("microsoft", "nope").unwrap().is_none());
    }
}
