//! Append-only `events.log` (spec §4.5, §6): one JSON object per line,
//! rewritten wholesale through a sibling tmp file + atomic rename on every
//! append (transcribed from `InvoiceStateManager._log_event`). Malformed
//! lines are skipped rather than aborting replay, exactly as the original
//! does in `replay_events`.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Mutex,
};

use collections_core::atomic_file::write_atomic;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;

/// Bound on the recent-id collision-detection set, per spec §9's guidance
/// that hash-indexed append-only logs eventually need periodic compaction;
/// compaction itself is out of scope here, so this cap just keeps the
/// in-process dedupe set from growing unbounded over a long-lived process.
const RECENT_IDS_CAP: usize = 10_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub event_id: String,
    pub client: String,
    pub invoice: String,
    pub event: String,
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize event entry: {0}")]
    Serialize(#[source] serde_json::Error),
}

pub struct EventLog {
    path: PathBuf,
    rng: SystemRandom,
    recent_ids: Mutex<HashSet<String>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rng: SystemRandom::new(),
            recent_ids: Mutex::new(HashSet::new()),
        }
    }

    /// Appends one event, rewriting the whole file through the atomic-write
    /// path so a crash mid-write never leaves a truncated log.
    pub fn append(&self, client: &str, invoice: &str, event: &str, data: Value) -> Result<EventEntry, EventLogError> {
        let entry = EventEntry {
            timestamp: OffsetDateTime::now_utc(),
            event_id: self.fresh_event_id(),
            client: client.to_owned(),
            invoice: invoice.to_owned(),
            event: event.to_owned(),
            data,
        };

        let existing = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(EventLogError::Io {
                    path: self.path.display().to_string(),
                    source: e,
                })
            }
        };

        let mut out = existing;
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        let line = serde_json::to_string(&entry).map_err(EventLogError::Serialize)?;
        out.push_str(&line);
        out.push('\n');

        write_atomic(&self.path, out.as_bytes()).map_err(|e| EventLogError::Io {
            path: self.path.display().to_string(),
            source: e,
        })?;

        Ok(entry)
    }

    /// Replays every event whose `timestamp >= since`, skipping malformed
    /// lines without aborting (spec §4.5).
    pub fn replay(&self, since: Option<OffsetDateTime>) -> Result<Vec<EventEntry>, EventLogError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EventLogError::Io {
                    path: self.path.display().to_string(),
                    source: e,
                })
            }
        };

        let mut events = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<EventEntry>(line) {
                Ok(entry) => {
                    if since.map(|s| entry.timestamp < s).unwrap_or(false) {
                        continue;
                    }
                    events.push(entry);
                }
                Err(e) => {
                    warn!(error = %e, "skipping malformed event log line");
                    continue;
                }
            }
        }
        Ok(events)
    }

    pub fn event_count(&self) -> Result<usize, EventLogError> {
        Ok(self.replay(None)?.len())
    }

    fn fresh_event_id(&self) -> String {
        let mut recent = self.recent_ids.lock().expect("recent-ids mutex poisoned");
        loop {
            let id = collections_core::ids::event_id(&self.rng);
            if recent.insert(id.clone()) {
                if recent.len() > RECENT_IDS_CAP {
                    recent.clear();
                }
                return id;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn log(dir: &Path) -> EventLog {
        EventLog::new(dir.join("events.log"))
    }

    #[test]
    fn append_then_replay_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let l = log(tmp.path());
        l.append("ACME", "INV-001", "state_update", json!({"status": "unpaid"})).unwrap();
        l.append("ACME", "INV-001", "reminder_sent", json!({"rule": "reminder_1"})).unwrap();
        let events = l.replay(None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "state_update");
        assert_eq!(events[1].event, "reminder_sent");
    }

    #[test]
    fn replay_since_filters_older_events() {
        let tmp = tempfile::tempdir().unwrap();
        let l = log(tmp.path());
        l.append("ACME", "INV-001", "state_update", json!({})).unwrap();
        let cutoff = OffsetDateTime::now_utc();
        std::thread::sleep(std::time::Duration::from_millis(5));
        l.append("ACME", "INV-002", "state_update", json!({})).unwrap();
        let events = l.replay(Some(cutoff)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].invoice, "INV-002");
    }

    #[test]
    fn replay_skips_malformed_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let l = log(tmp.path());
        l.append("ACME", "INV-001", "state_update", json!({})).unwrap();
        let mut content = std::fs::read_to_string(tmp.path().join("events.log")).unwrap();
        content.push_str("not valid json\n");
        std::fs::write(tmp.path().join("events.log"), content).unwrap();
        let events = l.replay(None).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn event_ids_do_not_collide_across_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let l = log(tmp.path());
        for i in 0..20 {
            l.append("ACME", &format!("INV-{i}"), "state_update", json!({})).unwrap();
        }
        let events = l.replay(None).unwrap();
        let ids: HashSet<_> = events.iter().map(|e| e.event_id.clone()).collect();
        assert_eq!(ids.len(), events.len());
    }
}
