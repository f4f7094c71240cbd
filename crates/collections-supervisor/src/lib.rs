//! Agent health monitoring, cross-component state reconciliation, and the
//! dashboard data model (spec §4.13).
//!
//! Grounded in `supervisor/health_checker.py::HealthChecker` (the
//! heartbeat-staleness/missed-count/escalation policy) and
//! `supervisor/health_checker.py::StateConsistencyChecker` (the
//! reconcile-invoices/reconcile-ledger/check-queue-health trio). The
//! `Dashboard`/`MetricsCollector` HTML rendering in `supervisor/dashboard.py`
//! does not belong in this crate (spec §4.13 scopes the core to data, not
//! rendering); [`DashboardSnapshot`] is the struct an out-of-core renderer
//! would consume.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use collections_ledger::{Ledger, ReconcileResult, Summary};
use collections_mailbox::Mailbox;
use collections_state::InvoiceStateStore;
use serde::Serialize;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Heartbeat timeout (spec §4.13): a heartbeat older than this is stale.
const HEARTBEAT_TIMEOUT: Duration = Duration::minutes(60);
/// Two consecutive missed heartbeats escalates to a human (spec §4.13);
/// one miss only attempts an automatic restart.
const MISSED_THRESHOLD: usize = 2;
/// How many trailing log entries `missed_count` inspects, per
/// `_count_missed_heartbeats`'s `lines[-10:]`.
const MISSED_LOOKBACK: usize = 10;
/// Queue depth above which a recipient's mailbox is considered unhealthy,
/// per `_check_queue_health`'s `count < 100`.
const QUEUE_DEPTH_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    State(#[from] collections_state::StateError),
    #[error(transparent)]
    Ledger(#[from] collections_ledger::LedgerError),
}

#[derive(Clone, Debug, Serialize)]
struct HeartbeatEntry {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    #[serde(default)]
    stale: bool,
}

impl<'de> serde::Deserialize<'de> for HeartbeatEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct Raw {
            timestamp: String,
            #[serde(default)]
            stale: bool,
        }
        let raw = Raw::deserialize(deserializer)?;
        let timestamp = time::OffsetDateTime::parse(&raw.timestamp, &time::format_description::well_known::Rfc3339)
            .map_err(serde::de::Error::custom)?;
        Ok(HeartbeatEntry { timestamp, stale: raw.stale })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Restarting,
    Escalated,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthError {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct AgentHealth {
    pub name: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_heartbeat: Option<OffsetDateTime>,
    pub status: AgentStatus,
    pub missed_heartbeats: usize,
    /// Last 5 errors (spec §4.13's `errors[-5:]`), most recent last.
    pub errors: Vec<HealthError>,
}

fn read_heartbeat_log(path: &Path) -> Vec<HeartbeatEntry> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| serde_json::from_str::<HeartbeatEntry>(line).ok())
        .collect()
}

/// Counts consecutive stale entries walking backward from the end of the
/// last [`MISSED_LOOKBACK`] log lines, stopping at the first non-stale
/// entry (transcribed from `_count_missed_heartbeats`). A missing log is
/// treated as a fresh agent (0 misses), not as a failure.
fn missed_count(entries: &[HeartbeatEntry]) -> usize {
    let window = &entries[entries.len().saturating_sub(MISSED_LOOKBACK)..];
    let mut count = 0;
    for entry in window.iter().rev() {
        if entry.stale {
            count += 1;
        } else {
            break;
        }
    }
    count
}

fn is_stale(last_heartbeat: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    match last_heartbeat {
        None => true,
        Some(ts) => now - ts > HEARTBEAT_TIMEOUT,
    }
}

/// Monitors agent liveness by reading `heartbeats/{agent}.log` (one JSON
/// object per line, appended by each agent on its own cadence).
pub struct HealthChecker {
    heartbeat_dir: PathBuf,
    agents: Vec<String>,
}

impl HealthChecker {
    pub fn new(heartbeat_dir: impl Into<PathBuf>, agents: Vec<String>) -> Self {
        Self {
            heartbeat_dir: heartbeat_dir.into(),
            agents,
        }
    }

    /// Checks every configured agent, optionally notifying `mailbox` of
    /// escalations (spec §4.13's `_escalate_agent_failure` ->
    /// `_notify_caine`, generalized to the shared mailbox).
    pub fn check_all(&self, now: OffsetDateTime, mailbox: Option<&Mailbox>) -> Vec<AgentHealth> {
        self.agents.iter().map(|name| self.check_agent(name, now, mailbox)).collect()
    }

    fn check_agent(&self, name: &str, now: OffsetDateTime, mailbox: Option<&Mailbox>) -> AgentHealth {
        let log_path = self.heartbeat_dir.join(format!("{name}.log"));
        let entries = read_heartbeat_log(&log_path);
        let last_heartbeat = entries.last().map(|e| e.timestamp);

        if !is_stale(last_heartbeat, now) {
            return AgentHealth {
                name: name.to_owned(),
                last_heartbeat,
                status: AgentStatus::Healthy,
                missed_heartbeats: 0,
                errors: Vec::new(),
            };
        }

        let missed = missed_count(&entries);
        let status = if missed >= MISSED_THRESHOLD {
            if let Some(mailbox) = mailbox {
                let _ = mailbox.send(
                    "human",
                    serde_json::json!({
                        "type": "AGENT_ESCALATION",
                        "agent": name,
                        "missed_heartbeats": missed,
                        "action_required": "Manual intervention required",
                    }),
                );
            }
            tracing::error!(agent = name, missed, "agent escalated: no heartbeat");
            AgentStatus::Escalated
        } else if missed >= 1 {
            tracing::warn!(agent = name, missed, "agent stale, attempting restart");
            AgentStatus::Restarting
        } else {
            AgentStatus::Unhealthy
        };

        let errors = entries
            .iter()
            .rev()
            .take(5)
            .rev()
            .map(|e| HealthError {
                at: e.timestamp,
                reason: "no heartbeat received".to_owned(),
            })
            .collect();

        AgentHealth {
            name: name.to_owned(),
            last_heartbeat,
            status,
            missed_heartbeats: missed,
            errors,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct QueueHealth {
    pub healthy: bool,
    pub depths: HashMap<String, usize>,
}

/// Counts lines in every `{recipient}.jsonl` under `queue_dir` (spec
/// §4.13's `_check_queue_health`). A directory that doesn't exist yet
/// reports healthy with no queues.
pub fn check_queue_health(queue_dir: &Path) -> QueueHealth {
    let mut depths = HashMap::new();
    if let Ok(entries) = fs::read_dir(queue_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let name = path.file_stem().unwrap_or_default().to_string_lossy().into_owned();
            let count = fs::read_to_string(&path).map(|c| c.lines().filter(|l| !l.trim().is_empty()).count()).unwrap_or(0);
            depths.insert(name, count);
        }
    }
    let healthy = depths.values().all(|&count| count < QUEUE_DEPTH_LIMIT);
    QueueHealth { healthy, depths }
}

#[derive(Clone, Debug, Serialize)]
pub struct ReconciliationReport {
    pub ledger: ReconcileResult,
    pub invoices_checked: usize,
    pub integrity_failures: usize,
    pub queue: QueueHealth,
}

/// Drives the ledger's own `reconcile` (C7) plus a C6 integrity sweep and
/// queue depth check, bundled the way `StateConsistencyChecker.reconcile_all`
/// bundles `_reconcile_invoices`/`_reconcile_ledger`/`_check_queue_health`.
pub fn reconcile_all(ledger_path: &Path, state_dir: &Path, queue_dir: &Path, auto_fix: bool) -> Result<ReconciliationReport, SupervisorError> {
    let mut ledger = Ledger::open(ledger_path)?;
    let reconcile = ledger.reconcile(state_dir, auto_fix)?;

    // `list_all_states`/`verify_integrity` never append to the event log,
    // so this instance only exists to satisfy the store's constructor.
    let event_log = std::sync::Arc::new(collections_eventlog::EventLog::new(state_dir.join(".events.log")));
    let store = InvoiceStateStore::new(state_dir, event_log);
    let reports = store.list_all_states()?;
    let integrity_failures = reports.iter().filter(|r| !r.valid).count();

    Ok(ReconciliationReport {
        ledger: reconcile,
        invoices_checked: reports.len(),
        integrity_failures,
        queue: check_queue_health(queue_dir),
    })
}

/// The full data model an out-of-core dashboard renderer would consume
/// (spec §4.13; HTML generation itself is out of scope here).
#[derive(Clone, Debug, Serialize)]
pub struct DashboardSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub agents: Vec<AgentHealth>,
    pub ledger_summary: Summary,
    pub reconciliation: ReconciliationReport,
}

pub fn build_snapshot(
    health_checker: &HealthChecker,
    ledger_path: &Path,
    state_dir: &Path,
    queue_dir: &Path,
    mailbox: Option<&Mailbox>,
    now: OffsetDateTime,
) -> Result<DashboardSnapshot, SupervisorError> {
    let agents = health_checker.check_all(now, mailbox);
    let ledger = Ledger::open(ledger_path)?;
    let ledger_summary = ledger.get_summary();
    let reconciliation = reconcile_all(ledger_path, state_dir, queue_dir, false)?;

    Ok(DashboardSnapshot {
        generated_at: now,
        agents,
        ledger_summary,
        reconciliation,
    })
}
