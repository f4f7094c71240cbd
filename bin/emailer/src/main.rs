//! Invoice ingestion, reminder scheduling, and reply-handling agent
//! (spec §2, §4.9–§4.11): the composite binary that owns `DocumentIngestor`,
//! the reminder scheduler, and the reply classifier, plus draining its own
//! mailbox for notices from `payment-watcher` and `supervisor`.
//!
//! CLI shape follows `sdk-sidecar/src/main.rs`: an `argh::FromArgs` struct
//! with doc-comment help text, a logger installed first, a Tokio runtime
//! built explicitly and driven with `block_on`. Everything account- and
//! OAuth-shaped is sourced from `--config`/`NOVOTECHNO_*` rather than flags,
//! so the CLI surface stays exactly the one the operator docs promise.

mod extractor;
mod graph;

use std::{path::PathBuf, sync::Arc, time::Duration as StdDuration};

use anyhow::Context;
use argh::FromArgs;

use collections_auth::{cache::TokenCache, validator::TokenValidator};
use collections_core::{
    clock::SystemClock,
    config::Config,
    paths::{ensure_layout, StateRoot},
    Clock,
};
use collections_eventlog::EventLog;
use collections_ingest::{DocumentIngestor, RouteOutcome};
use collections_ledger::Ledger;
use collections_mailbox::Mailbox;
use collections_ratelimit::{ExponentialBackoff, RateLimitConfig, RateLimiter};
use collections_reply::ReplyClassifier;
use collections_scheduler::{get_due, send_reminders};
use collections_secrets::FileSecretStore;
use collections_state::InvoiceStateStore;
use time::OffsetDateTime;

use crate::extractor::PlainTextExtractor;
use crate::graph::{GraphMailClient, GraphTokenRefresher, OAuthConfig, RotatingInboxReader};

const PROVIDER: &str = "microsoft";
const APP_NAME: &str = "novotechno";
const AGENT_NAME: &str = "emailer";

#[derive(FromArgs)]
/// Invoice ingestion, reminder scheduling, and reply-handling agent.
struct Cli {
    /// exercise the full pipeline without sending mail or persisting new invoice/reminder state
    #[argh(switch)]
    dry_run: bool,

    /// run a single cycle and exit instead of looping
    #[argh(switch)]
    once: bool,

    /// directory of per-client subdirectories of scanned invoice documents (repeatable)
    #[argh(option)]
    watch_dir: Vec<PathBuf>,

    /// TOML configuration file
    #[argh(option)]
    config: Option<PathBuf>,
}

fn main() -> std::process::ExitCode {
    collections_core::logging::init();
    let cli: Cli = argh::from_env();

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("❌ failed to start async runtime: {e}");
            return std::process::ExitCode::from(1);
        }
    };

    match rt.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {e:#}");
            std::process::ExitCode::from(1)
        }
    }
}

#[derive(Default)]
struct CycleReport {
    ingested: usize,
    reminders_sent: usize,
    replies_processed: usize,
    notices_drained: usize,
    backoff_delay: Option<StdDuration>,
}

impl CycleReport {
    fn did_anything(&self) -> bool {
        self.ingested > 0 || self.reminders_sent > 0 || self.replies_processed > 0 || self.notices_drained > 0
    }
}

async fn run(cli: Cli) -> anyhow::Result<std::process::ExitCode> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut c = Config::default();
            c.apply_env_overrides();
            c
        }
    };
    config.dry_run = config.dry_run || cli.dry_run;

    let tenant_id = config.tenant_id.clone().context("tenant id is required (config `auth.tenant-id` or NOVOTECHNO_TENANT_ID)")?;
    let client_id = config.client_id.clone().context("client id is required (config `auth.client-id` or NOVOTECHNO_CLIENT_ID)")?;
    let account = config.account.clone().context("mailbox account is required (config `auth.account` or NOVOTECHNO_ACCOUNT)")?;
    let account_id = config.account_id.clone().unwrap_or_else(|| account.clone());

    let roots = StateRoot::resolve(config.cache_root.clone(), config.state_root.clone());
    ensure_layout(&roots).context("failed to create on-disk state layout")?;

    let passphrase =
        std::env::var("NOVOTECHNO_SECRET_PASSPHRASE").unwrap_or_else(|_| "novotechno-collections-dev-passphrase".to_owned());
    let secret_store = Arc::new(FileSecretStore::open(roots.cache_root.join("secrets"), passphrase.as_bytes())?);
    let token_cache = TokenCache::new(secret_store, APP_NAME);

    let http = reqwest::blocking::Client::builder().build().context("failed to build HTTP client")?;
    let refresher = GraphTokenRefresher::new(
        http.clone(),
        OAuthConfig {
            tenant_id,
            client_id,
            client_secret: config.client_secret.clone(),
            scope: "offline_access Mail.Send Mail.Read".to_owned(),
        },
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let validator = TokenValidator::new(token_cache, refresher, clock, config.min_token_lifetime_secs);

    let event_log = Arc::new(EventLog::new(roots.event_log_path()));
    let state_store = Arc::new(InvoiceStateStore::new(roots.state_root.clone(), event_log));
    let mailbox = Mailbox::new(roots.cache_root.join("queues"))?;
    let rate_limiter = RateLimiter::new(RateLimitConfig {
        max_per_cycle: config.cycle_limit,
        cycle_window: StdDuration::from_secs(config.cycle_window_secs),
        max_per_day: config.daily_limit,
        day_window: StdDuration::from_secs(config.daily_window_secs),
    });
    let ingestor = DocumentIngestor::new(Arc::new(PlainTextExtractor), roots.clone());
    let inbox_reader = RotatingInboxReader::new(http.clone(), account.clone());
    let reply_classifier = ReplyClassifier::new(inbox_reader);
    let backoff = ExponentialBackoff::with_config(
        StdDuration::from_secs_f64(config.backoff_base_secs),
        StdDuration::from_secs_f64(config.backoff_max_secs),
        config.backoff_factor,
        StdDuration::from_secs_f64(config.backoff_reset_after_secs),
    );

    let senders = config.collection_senders.clone();
    let heartbeat_path = roots.heartbeat_path(AGENT_NAME);

    loop {
        let cycle = run_cycle(
            &cli,
            &config,
            &roots,
            &account,
            &account_id,
            &http,
            &validator,
            &state_store,
            &mailbox,
            &rate_limiter,
            &backoff,
            &ingestor,
            &reply_classifier,
            &senders,
        )
        .await;

        let report = match cycle {
            Ok(report) => report,
            Err(e) => {
                eprintln!("❌ {e:#}");
                return Ok(std::process::ExitCode::from(1));
            }
        };

        tracing::info!(
            ingested = report.ingested,
            reminders_sent = report.reminders_sent,
            replies_processed = report.replies_processed,
            notices_drained = report.notices_drained,
            "cycle complete"
        );

        collections_core::heartbeat::beat(&heartbeat_path).context("failed to write heartbeat")?;

        if cli.once {
            return Ok(if report.did_anything() {
                std::process::ExitCode::from(0)
            } else {
                std::process::ExitCode::from(2)
            });
        }

        let wait = report.backoff_delay.unwrap_or(StdDuration::from_secs(config.interval_secs));
        if report.backoff_delay.is_some() {
            tracing::warn!(wait_secs = wait.as_secs_f64(), "backing off before next cycle after rate limiting");
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                return Ok(std::process::ExitCode::from(130));
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_cycle(
    cli: &Cli,
    config: &Config,
    roots: &StateRoot,
    account: &str,
    account_id: &str,
    http: &reqwest::blocking::Client,
    validator: &TokenValidator<FileSecretStore, GraphTokenRefresher>,
    state_store: &Arc<InvoiceStateStore>,
    mailbox: &Mailbox,
    rate_limiter: &RateLimiter,
    backoff: &ExponentialBackoff,
    ingestor: &DocumentIngestor,
    reply_classifier: &ReplyClassifier<RotatingInboxReader>,
    senders: &[String],
) -> anyhow::Result<CycleReport> {
    let mut report = CycleReport::default();

    let token = validator
        .acquire(PROVIDER, account_id, |d| tokio::time::sleep(d))
        .await
        .context("failed to acquire a Graph access token")?;

    report.ingested = ingest_watch_dirs(cli, config, roots, ingestor, state_store)?;

    let mut invoices = Vec::new();
    for entry in state_store.list_all_states()? {
        if !entry.valid {
            continue;
        }
        if let Some(invoice) = state_store.read(&entry.client, &entry.invoice)? {
            invoices.push(invoice);
        }
    }

    let now = OffsetDateTime::now_utc();
    let due_count = get_due(&invoices, now).len();
    if due_count > 0 {
        if config.dry_run {
            tracing::info!(due_count, "dry-run: skipping reminder batch");
        } else {
            let mail_client = GraphMailClient::new(http.clone(), token.access_token.clone(), account.to_owned());
            let send_report = send_reminders(
                &mut invoices,
                config.cycle_limit as usize,
                rate_limiter,
                backoff,
                &mail_client,
                state_store,
                &roots.ledger_path(),
                now,
            )?;
            if send_report.rate_limited > 0 {
                tracing::warn!(rate_limited = send_report.rate_limited, "reminder batch stopped by rate limiter");
            }
            report.reminders_sent = send_report.sent;
            report.backoff_delay = send_report.backoff_delay;
        }
    }

    reply_classifier.reader().set_token(token.access_token.clone());
    let actions = reply_classifier.check_replies(senders).context("inbox scan failed")?;
    if !actions.is_empty() {
        if config.dry_run {
            tracing::info!(count = actions.len(), "dry-run: skipping reply-action execution");
        } else {
            let exec = reply_classifier.execute(&actions, state_store, &roots.ledger_path())?;
            report.replies_processed = exec.paused_invoices + exec.marked_paid + exec.queued_for_review;
            if exec.unmatched > 0 {
                tracing::warn!(unmatched = exec.unmatched, "reply actions had no matching active invoice");
            }
        }
    }

    let notices = mailbox.receive("emailer")?;
    for notice in &notices {
        tracing::info!(notice = %notice, "processed inter-agent notice");
    }
    report.notices_drained = notices.len();

    Ok(report)
}

fn ingest_watch_dirs(
    cli: &Cli,
    config: &Config,
    roots: &StateRoot,
    ingestor: &DocumentIngestor,
    state_store: &Arc<InvoiceStateStore>,
) -> anyhow::Result<usize> {
    let mut ingested = 0usize;

    for watch_dir in &cli.watch_dir {
        let Ok(client_dirs) = std::fs::read_dir(watch_dir) else {
            tracing::warn!(dir = %watch_dir.display(), "watch dir is not readable, skipping");
            continue;
        };

        for client_entry in client_dirs.flatten() {
            if !client_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let client = client_entry.file_name().to_string_lossy().into_owned();

            let Ok(files) = std::fs::read_dir(client_entry.path()) else {
                continue;
            };
            for file in files.flatten() {
                if !file.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                let path = file.path();
                match ingestor.ingest(&client, &path) {
                    Ok(Some(RouteOutcome::Auto { invoice })) => {
                        ingested += 1;
                        tracing::info!(client, invoice = %invoice.number, "invoice auto-created from scanned document");
                        if !config.dry_run {
                            state_store.write(&invoice, "created")?;
                            let due_date = invoice.due_date.format(&time::format_description::well_known::Rfc3339).ok();
                            Ledger::open(roots.ledger_path())?.add(
                                invoice.number.as_str(),
                                invoice.amount,
                                invoice.client.as_str(),
                                due_date.as_deref(),
                            )?;
                        }
                    }
                    Ok(Some(RouteOutcome::Review { path })) => {
                        ingested += 1;
                        tracing::info!(client, path = %path.display(), "document routed to review queue");
                    }
                    Ok(Some(RouteOutcome::Manual { path })) => {
                        ingested += 1;
                        tracing::info!(client, path = %path.display(), "document routed to manual entry queue");
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(client, path = %path.display(), error = %e, "document ingest failed"),
                }
            }
        }
    }

    Ok(ingested)
}
