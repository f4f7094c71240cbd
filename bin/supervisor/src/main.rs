//! Agent health monitoring and state reconciliation agent (spec §4.13):
//! thin CLI wrapper around `collections_supervisor`'s `HealthChecker` and
//! `reconcile_all`/`build_snapshot`.
//!
//! CLI shape follows `sdk-sidecar/src/main.rs`: an `argh::FromArgs` struct,
//! a logger installed first, a Tokio runtime built explicitly and driven
//! with `block_on`.

use std::{path::PathBuf, time::Duration as StdDuration};

use anyhow::Context;
use argh::FromArgs;

use collections_core::paths::{ensure_layout, StateRoot};
use collections_mailbox::Mailbox;
use collections_supervisor::{build_snapshot, reconcile_all, AgentStatus, HealthChecker};
use time::OffsetDateTime;

const DEFAULT_AGENTS: [&str; 3] = ["emailer", "payment-watcher", "supervisor"];

#[derive(FromArgs)]
/// Agent health monitoring and state reconciliation agent.
struct Cli {
    /// check every monitored agent's heartbeat and exit non-zero if any has escalated
    #[argh(switch)]
    health_check: bool,

    /// build a full dashboard snapshot (agent health, ledger summary, reconciliation)
    #[argh(switch)]
    dashboard: bool,

    /// write the dashboard snapshot as JSON to this file instead of stdout
    #[argh(option)]
    output: Option<PathBuf>,

    /// comma-separated agent names to monitor (default: emailer,payment-watcher,supervisor)
    #[argh(option)]
    agents: Option<String>,

    /// run continuously, health-checking and reconciling every --interval seconds
    #[argh(switch)]
    daemon: bool,

    /// seconds between cycles in daemon mode
    #[argh(option, default = "collections_core::config::DEFAULT_INTERVAL_SECS")]
    interval: u64,
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

fn agent_list(cli: &Cli) -> Vec<String> {
    match &cli.agents {
        Some(csv) => {
            let parsed: Vec<String> = csv.split(',').map(|s| s.trim().to_owned()).filter(|s| !s.is_empty()).collect();
            if parsed.is_empty() {
                DEFAULT_AGENTS.iter().map(|s| s.to_string()).collect()
            } else {
                parsed
            }
        }
        None => DEFAULT_AGENTS.iter().map(|s| s.to_string()).collect(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<std::process::ExitCode> {
    let roots = StateRoot::resolve(None, None);
    ensure_layout(&roots).context("failed to create on-disk state layout")?;

    let agents = agent_list(&cli);
    let health_checker = HealthChecker::new(roots.cache_root.join("heartbeats"), agents);
    let mailbox = Mailbox::new(roots.cache_root.join("queues"))?;
    let ledger_path = roots.ledger_path();
    let state_dir = roots.state_root.clone();
    let queue_dir = roots.cache_root.join("queues");
    let heartbeat_path = roots.heartbeat_path("supervisor");

    if cli.daemon {
        loop {
            if let Err(e) = run_cycle(&cli, &health_checker, &ledger_path, &state_dir, &queue_dir, &mailbox) {
                eprintln!("❌ {e:#}");
                return Ok(std::process::ExitCode::from(1));
            }
            collections_core::heartbeat::beat(&heartbeat_path).context("failed to write heartbeat")?;

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                    return Ok(std::process::ExitCode::from(130));
                }
                _ = tokio::time::sleep(StdDuration::from_secs(cli.interval)) => {}
            }
        }
    }

    if !cli.health_check && !cli.dashboard {
        tracing::info!("no --health-check or --dashboard requested, nothing to do");
        return Ok(std::process::ExitCode::from(2));
    }

    let unhealthy = run_cycle(&cli, &health_checker, &ledger_path, &state_dir, &queue_dir, &mailbox)?;
    collections_core::heartbeat::beat(&heartbeat_path).context("failed to write heartbeat")?;

    Ok(if unhealthy {
        std::process::ExitCode::from(1)
    } else {
        std::process::ExitCode::from(0)
    })
}

/// Runs whichever of `--health-check`/`--dashboard` was requested, returning
/// whether any monitored agent is unhealthy or escalated.
fn run_cycle(
    cli: &Cli,
    health_checker: &HealthChecker,
    ledger_path: &std::path::Path,
    state_dir: &std::path::Path,
    queue_dir: &std::path::Path,
    mailbox: &Mailbox,
) -> anyhow::Result<bool> {
    let now = OffsetDateTime::now_utc();
    let mut unhealthy = false;

    if cli.health_check || cli.daemon {
        let agents = health_checker.check_all(now, Some(mailbox));
        for agent in &agents {
            tracing::info!(agent = agent.name, status = ?agent.status, missed = agent.missed_heartbeats, "agent health");
            if matches!(agent.status, AgentStatus::Unhealthy | AgentStatus::Escalated) {
                unhealthy = true;
            }
        }
    }

    if cli.dashboard {
        let snapshot = build_snapshot(health_checker, ledger_path, state_dir, queue_dir, Some(mailbox), now)?;
        let json = serde_json::to_string_pretty(&snapshot).context("failed to serialize dashboard snapshot")?;
        match &cli.output {
            Some(path) => std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?,
            None => println!("{json}"),
        }
    } else if cli.daemon {
        reconcile_all(ledger_path, state_dir, queue_dir, true).context("reconciliation failed")?;
    }

    Ok(unhealthy)
}
