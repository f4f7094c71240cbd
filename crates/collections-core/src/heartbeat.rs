//! Appends to an agent's `heartbeats/{agent}.log` (spec §4.13), the write
//! side of `collections_supervisor::HealthChecker`'s reader. One JSON
//! object per line, written with a plain append — unlike the durable event
//! log and mailbox queues, a torn write here just costs one missed
//! heartbeat, which the health checker already tolerates.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use time::OffsetDateTime;

/// Appends one heartbeat line to `path`. `stale` is always written `false`
/// from a live agent; the health checker derives staleness itself by
/// comparing `timestamp` against wall-clock time on read.
pub fn beat(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::json!({
        "timestamp": OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339).unwrap_or_default(),
        "stale": false,
    });
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn beat_appends_a_line_per_call() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("heartbeats/emailer.log");
        beat(&path).unwrap();
        beat(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().all(|l| serde_json::from_str::<serde_json::Value>(l).is_ok()));
    }
}
