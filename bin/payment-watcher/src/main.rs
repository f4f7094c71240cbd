//! Filesystem-watch payment evidence detection agent (spec §4.12): thin
//! CLI wrapper around `collections_payment::PaymentDetector`.
//!
//! CLI shape follows `sdk-sidecar/src/main.rs`: an `argh::FromArgs` struct,
//! a logger installed first, a Tokio runtime built explicitly. The watcher
//! itself is synchronous (`notify`'s blocking channel), so it runs on its
//! own thread; the async runtime here exists only to wait on
//! `tokio::signal::ctrl_c` alongside it.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration as StdDuration,
};

use anyhow::Context;
use argh::FromArgs;

use collections_core::paths::{ensure_layout, StateRoot};
use collections_eventlog::EventLog;
use collections_mailbox::Mailbox;
use collections_payment::PaymentDetector;
use collections_state::InvoiceStateStore;

const AGENT_NAME: &str = "payment-watcher";
const HEARTBEAT_INTERVAL: StdDuration = StdDuration::from_secs(60);

#[derive(FromArgs)]
/// Filesystem-watch payment evidence detection agent.
struct Cli {
    /// directory to watch recursively for payment evidence files (repeatable)
    #[argh(option)]
    watch_path: Vec<PathBuf>,

    /// scan the watch paths once and exit instead of watching continuously
    #[argh(switch)]
    once: bool,

    /// enable debug-level logging
    #[argh(switch)]
    verbose: bool,
}

fn main() -> std::process::ExitCode {
    let cli: Cli = argh::from_env();
    if cli.verbose && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "debug");
    }
    collections_core::logging::init();

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

async fn run(cli: Cli) -> anyhow::Result<std::process::ExitCode> {
    if cli.watch_path.is_empty() {
        anyhow::bail!("at least one --watch-path is required");
    }

    let roots = StateRoot::resolve(None, None);
    ensure_layout(&roots).context("failed to create on-disk state layout")?;

    let event_log = Arc::new(EventLog::new(roots.event_log_path()));
    let store = Arc::new(InvoiceStateStore::new(roots.state_root.clone(), event_log));
    let mailbox = Arc::new(Mailbox::new(roots.cache_root.join("queues"))?);
    let detector = Arc::new(PaymentDetector::new(store, Some(mailbox), Some(roots.ledger_path())));
    let heartbeat_path = roots.heartbeat_path(AGENT_NAME);

    if cli.once {
        let processed = scan_once(&detector, &cli.watch_path);
        collections_core::heartbeat::beat(&heartbeat_path).context("failed to write heartbeat")?;
        tracing::info!(processed, "one-shot payment scan complete");
        return Ok(if processed > 0 {
            std::process::ExitCode::from(0)
        } else {
            std::process::ExitCode::from(2)
        });
    }

    let watch_paths = cli.watch_path.clone();
    let watcher_detector = detector.clone();
    std::thread::spawn(move || {
        if let Err(e) = watcher_detector.watch(&watch_paths) {
            tracing::error!(error = %e, "payment watcher thread terminated");
        }
    });

    let heartbeat_path_bg = heartbeat_path.clone();
    std::thread::spawn(move || loop {
        if let Err(e) = collections_core::heartbeat::beat(&heartbeat_path_bg) {
            tracing::warn!(error = %e, "failed to write heartbeat");
        }
        std::thread::sleep(HEARTBEAT_INTERVAL);
    });

    tokio::signal::ctrl_c().await.context("failed to listen for SIGINT")?;
    tracing::info!("received SIGINT, shutting down");
    Ok(std::process::ExitCode::from(130))
}

/// Processes every regular file already present under `watch_paths`,
/// recursively. `PaymentDetector::process_file` itself filters on the
/// payment filename patterns, so non-matching files are a cheap no-op.
fn scan_once(detector: &PaymentDetector, watch_paths: &[PathBuf]) -> usize {
    watch_paths.iter().map(|root| walk_and_process(detector, root)).sum()
}

fn walk_and_process(detector: &PaymentDetector, dir: &Path) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "watch path not readable");
            return 0;
        }
    };

    let mut processed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else { continue };
        if file_type.is_dir() {
            processed += walk_and_process(detector, &path);
        } else if file_type.is_file() {
            match detector.process_file(&path) {
                Ok(Some(_)) => processed += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "error processing candidate payment file"),
            }
        }
    }
    processed
}
