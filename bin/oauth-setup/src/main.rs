//! Interactive OAuth enrollment for the collections agents (spec §4.3,
//! §6): runs the Microsoft identity platform device-code flow and saves
//! the resulting token into the same encrypted token cache the other
//! agents read from, so the operator only has to sign in once per account.
//!
//! CLI shape follows `sdk-sidecar/src/main.rs`: an `argh::FromArgs` struct
//! with doc-comment help text and a logger installed first. No async
//! runtime is needed — the device-code poll loop just sleeps synchronously
//! between attempts.

mod graph;

use std::sync::Arc;

use anyhow::Context;
use argh::FromArgs;

use collections_auth::{cache::TokenCache, token::Token};
use collections_core::paths::{ensure_layout, StateRoot};
use collections_secrets::FileSecretStore;
use time::OffsetDateTime;

const PROVIDER: &str = "microsoft";
const APP_NAME: &str = "novotechno";
const DEFAULT_SCOPES: &str = "offline_access Mail.Send Mail.Read";

#[derive(FromArgs)]
/// Interactive device-code OAuth enrollment for the collections agents.
struct Cli {
    /// OAuth client id registered for the collections agents
    #[argh(option)]
    client_id: String,

    /// Microsoft identity platform tenant id
    #[argh(option)]
    tenant_id: String,

    /// space-separated OAuth scopes to request
    #[argh(option, default = "DEFAULT_SCOPES.to_owned()")]
    scopes: String,

    /// mailbox account (UPN or object id) this token is enrolled for
    #[argh(option)]
    account_id: String,

    /// send a one-line confirmation email to this address after enrollment
    #[argh(option)]
    test_email: Option<String>,
}

fn main() -> std::process::ExitCode {
    collections_core::logging::init();
    let cli: Cli = argh::from_env();

    match run(cli) {
        Ok(()) => std::process::ExitCode::from(0),
        Err(e) => {
            eprintln!("❌ {e:#}");
            std::process::ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let http = reqwest::blocking::Client::builder().build().context("failed to build HTTP client")?;

    let refreshed = graph::run_device_code_flow(&http, &cli.tenant_id, &cli.client_id, &cli.scopes)?;

    let roots = StateRoot::resolve(None, None);
    ensure_layout(&roots).context("failed to create on-disk state layout")?;
    let passphrase =
        std::env::var("NOVOTECHNO_SECRET_PASSPHRASE").unwrap_or_else(|_| "novotechno-collections-dev-passphrase".to_owned());
    let secret_store = Arc::new(FileSecretStore::open(roots.cache_root.join("secrets"), passphrase.as_bytes())?);
    let token_cache = TokenCache::new(secret_store, APP_NAME);

    let token = Token {
        provider: PROVIDER.to_owned(),
        account_id: cli.account_id.clone(),
        access_token: refreshed.access_token,
        token_type: refreshed.token_type,
        expires_at: refreshed.expires_at,
        refresh_token: refreshed.refresh_token,
        scope: refreshed.scope,
        cached_at: OffsetDateTime::now_utc(),
    };
    token_cache.save(PROVIDER, &cli.account_id, &token).context("failed to persist enrolled token")?;
    println!("Enrolled {PROVIDER}:{} in the token cache.", cli.account_id);

    if let Some(test_email) = &cli.test_email {
        graph::send_test_mail(&http, &token.access_token, &cli.account_id, test_email)?;
        println!("Sent a confirmation email to {test_email}.");
    }

    Ok(())
}
