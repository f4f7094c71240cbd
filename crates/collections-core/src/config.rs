//! `--config FILE` loading, shared by every binary.
//!
//! Follows the `sgx-toml` crate's pattern: deserialize into an
//! all-`Option` mirror of the config, then layer it over hard defaults.
//! Every field is independently overridable so an operator can ship a
//! partial TOML file that only tweaks, say, the rate limiter.

use std::{fs, path::Path, path::PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Token-bucket defaults from the rate limiter (spec §4.2).
pub const DEFAULT_CYCLE_LIMIT: u32 = 20;
pub const DEFAULT_CYCLE_WINDOW_SECS: u64 = 60;
pub const DEFAULT_DAILY_LIMIT: u32 = 100;
pub const DEFAULT_DAILY_WINDOW_SECS: u64 = 86_400;

/// Backoff defaults (spec §4.3 / original `ExponentialBackoff`).
pub const DEFAULT_BACKOFF_BASE_SECS: f64 = 1.0;
pub const DEFAULT_BACKOFF_MAX_SECS: f64 = 300.0;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_BACKOFF_RESET_AFTER_SECS: f64 = 60.0;

/// Auth defaults (spec §4.3).
pub const DEFAULT_MAX_REFRESH_FAILURES: u32 = 3;
pub const DEFAULT_MIN_TOKEN_LIFETIME_SECS: i64 = 300;

/// Daemon loop default (spec §6's `--interval SECS`).
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Fully-resolved runtime configuration for an agent process.
#[derive(Clone, Debug)]
pub struct Config {
    pub cache_root: Option<PathBuf>,
    pub state_root: Option<PathBuf>,
    pub cycle_limit: u32,
    pub cycle_window_secs: u64,
    pub daily_limit: u32,
    pub daily_window_secs: u64,
    pub backoff_base_secs: f64,
    pub backoff_max_secs: f64,
    pub backoff_factor: f64,
    pub backoff_reset_after_secs: f64,
    pub max_refresh_failures: u32,
    pub min_token_lifetime_secs: i64,
    /// Dry-run short-circuits the final send/write in each agent while
    /// still exercising the rest of the pipeline (spec §5).
    pub dry_run: bool,
    pub interval_secs: u64,

    /// OAuth app registration details (spec §4.3). Agent binaries also
    /// accept these as `NOVOTECHNO_*` environment variables, layered over
    /// whatever the config file sets (see `Config::apply_env_overrides`).
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Mailbox account (UPN or object id) used for sendMail / inbox reads.
    pub account: Option<String>,
    /// Token cache account id; defaults to `account` if unset.
    pub account_id: Option<String>,
    /// Sender addresses whose replies the reply classifier scans.
    pub collection_senders: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_root: None,
            state_root: None,
            cycle_limit: DEFAULT_CYCLE_LIMIT,
            cycle_window_secs: DEFAULT_CYCLE_WINDOW_SECS,
            daily_limit: DEFAULT_DAILY_LIMIT,
            daily_window_secs: DEFAULT_DAILY_WINDOW_SECS,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            backoff_reset_after_secs: DEFAULT_BACKOFF_RESET_AFTER_SECS,
            max_refresh_failures: DEFAULT_MAX_REFRESH_FAILURES,
            min_token_lifetime_secs: DEFAULT_MIN_TOKEN_LIFETIME_SECS,
            dry_run: false,
            interval_secs: DEFAULT_INTERVAL_SECS,
            tenant_id: None,
            client_id: None,
            client_secret: None,
            account: None,
            account_id: None,
            collection_senders: Vec::new(),
        }
    }
}

impl Config {
    /// Loads `path`, overlaying any present fields onto [`Config::default`],
    /// then layers `NOVOTECHNO_*` environment variables on top (the
    /// `sdk-sidecar` binary's `from_env` pattern: flags/file first,
    /// environment last).
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("{path:?}"))
            .context("failed to read config file")?;
        let file: ConfigFile = toml::from_str(&raw)
            .with_context(|| raw.clone())
            .context("failed to parse config file")?;
        let mut config = file.into_config();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `NOVOTECHNO_*` overrides on top of whatever was already
    /// resolved from a config file or built-in defaults.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NOVOTECHNO_TENANT_ID") {
            self.tenant_id = Some(v);
        }
        if let Ok(v) = std::env::var("NOVOTECHNO_CLIENT_ID") {
            self.client_id = Some(v);
        }
        if let Ok(v) = std::env::var("NOVOTECHNO_CLIENT_SECRET") {
            self.client_secret = Some(v);
        }
        if let Ok(v) = std::env::var("NOVOTECHNO_ACCOUNT") {
            self.account = Some(v);
        }
        if let Ok(v) = std::env::var("NOVOTECHNO_ACCOUNT_ID") {
            self.account_id = Some(v);
        }
        if let Ok(v) = std::env::var("NOVOTECHNO_COLLECTION_SENDERS") {
            self.collection_senders = v.split(',').map(|s| s.trim().to_owned()).filter(|s| !s.is_empty()).collect();
        }
        if let Ok(v) = std::env::var("NOVOTECHNO_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                self.interval_secs = secs;
            }
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", default)]
struct ConfigFile {
    cache_root: Option<PathBuf>,
    state_root: Option<PathBuf>,
    interval_secs: Option<u64>,
    rate_limit: RateLimitSection,
    backoff: BackoffSection,
    auth: AuthSection,
    reply: ReplySection,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", default)]
struct RateLimitSection {
    cycle_limit: Option<u32>,
    cycle_window_secs: Option<u64>,
    daily_limit: Option<u32>,
    daily_window_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", default)]
struct BackoffSection {
    base_secs: Option<f64>,
    max_secs: Option<f64>,
    factor: Option<f64>,
    reset_after_secs: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", default)]
struct AuthSection {
    max_refresh_failures: Option<u32>,
    min_token_lifetime_secs: Option<i64>,
    tenant_id: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    account: Option<String>,
    account_id: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", default)]
struct ReplySection {
    collection_senders: Option<Vec<String>>,
}

impl ConfigFile {
    fn into_config(self) -> Config {
        let default = Config::default();
        Config {
            cache_root: self.cache_root.or(default.cache_root),
            state_root: self.state_root.or(default.state_root),
            cycle_limit: self.rate_limit.cycle_limit.unwrap_or(default.cycle_limit),
            cycle_window_secs: self
                .rate_limit
                .cycle_window_secs
                .unwrap_or(default.cycle_window_secs),
            daily_limit: self.rate_limit.daily_limit.unwrap_or(default.daily_limit),
            daily_window_secs: self
                .rate_limit
                .daily_window_secs
                .unwrap_or(default.daily_window_secs),
            backoff_base_secs: self.backoff.base_secs.unwrap_or(default.backoff_base_secs),
            backoff_max_secs: self.backoff.max_secs.unwrap_or(default.backoff_max_secs),
            backoff_factor: self.backoff.factor.unwrap_or(default.backoff_factor),
            backoff_reset_after_secs: self
                .backoff
                .reset_after_secs
                .unwrap_or(default.backoff_reset_after_secs),
            max_refresh_failures: self
                .auth
                .max_refresh_failures
                .unwrap_or(default.max_refresh_failures),
            min_token_lifetime_secs: self
                .auth
                .min_token_lifetime_secs
                .unwrap_or(default.min_token_lifetime_secs),
            dry_run: default.dry_run,
            interval_secs: self.interval_secs.unwrap_or(default.interval_secs),
            tenant_id: self.auth.tenant_id.or(default.tenant_id),
            client_id: self.auth.client_id.or(default.client_id),
            client_secret: self.auth.client_secret.or(default.client_secret),
            account: self.auth.account.or(default.account),
            account_id: self.auth.account_id.or(default.account_id),
            collection_senders: self.reply.collection_senders.unwrap_or(default.collection_senders),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_config_overlays_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
            [rate-limit]
            cycle-limit = 5
            "#
        )
        .unwrap();
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.cycle_limit, 5);
        assert_eq!(cfg.daily_limit, DEFAULT_DAILY_LIMIT);
        assert_eq!(cfg.backoff_base_secs, DEFAULT_BACKOFF_BASE_SECS);
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.cycle_limit, DEFAULT_CYCLE_LIMIT);
        assert_eq!(cfg.max_refresh_failures, DEFAULT_MAX_REFRESH_FAILURES);
    }
}
