//! Inter-agent message queues (spec §4.8): one `queues/{recipient}.jsonl`
//! file per recipient, written append-only, drained atomically on
//! `receive`. Transcribed from `InterAgentMessage` in the original's
//! `filesystem/message_sender.py`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Messages sent for the same `(type, invoice, client)` triple within this
/// window are treated as duplicates and dropped silently.
const DEDUPE_WINDOW: Duration = Duration::seconds(86_400);

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct DedupeMarker {
    #[serde(with = "time::serde::rfc3339")]
    recorded_at: OffsetDateTime,
    message: Value,
}

pub struct Mailbox {
    queue_dir: PathBuf,
}

impl Mailbox {
    pub fn new(queue_dir: impl Into<PathBuf>) -> Result<Self, MailboxError> {
        let queue_dir = queue_dir.into();
        fs::create_dir_all(&queue_dir).map_err(|e| MailboxError::Io {
            path: queue_dir.display().to_string(),
            source: e,
        })?;
        Ok(Self { queue_dir })
    }

    fn queue_path(&self, recipient: &str) -> PathBuf {
        self.queue_dir.join(format!("{}.jsonl", sanitize(recipient)))
    }

    fn dedupe_path(&self, hash: &str) -> PathBuf {
        self.queue_dir.join(format!("dedupe_{hash}.json"))
    }

    /// Appends `message` to `recipient`'s queue unless an identical
    /// `(type, invoice, client)` triple was queued within the dedupe
    /// window, in which case the send is silently dropped (matching the
    /// original's behavior).
    pub fn send(&self, recipient: &str, message: Value) -> Result<bool, MailboxError> {
        let hash = message_hash(&message);
        if self.is_duplicate(&hash, &message)? {
            tracing::debug!(r#type = %message_field(&message, "type"), "duplicate message skipped");
            return Ok(false);
        }

        let mut stamped = message.clone();
        if let Value::Object(ref mut map) = stamped {
            map.insert(
                "_queued_at".to_owned(),
                Value::String(
                    OffsetDateTime::now_utc()
                        .format(&time::format_description::well_known::Rfc3339)
                        .unwrap_or_default(),
                ),
            );
        }

        let path = self.queue_path(recipient);
        let line = serde_json::to_string(&stamped).map_err(MailboxError::Serialize)?;
        append_line(&path, &line)?;
        tracing::info!(recipient, r#type = %message_field(&message, "type"), "message queued");
        Ok(true)
    }

    /// Drains and returns every message queued for `recipient`.
    pub fn receive(&self, recipient: &str) -> Result<Vec<Value>, MailboxError> {
        let path = self.queue_path(recipient);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let drained = path.with_extension("jsonl.draining");
        if let Err(e) = fs::rename(&path, &drained) {
            if e.kind() == std::io::ErrorKind::NotFound {
                return Ok(Vec::new());
            }
            return Err(MailboxError::Io {
                path: path.display().to_string(),
                source: e,
            });
        }

        let messages = read_queue_file(&drained)?;
        fs::remove_file(&drained).map_err(|e| MailboxError::Io {
            path: drained.display().to_string(),
            source: e,
        })?;
        tracing::info!(recipient, count = messages.len(), "messages received");
        Ok(messages)
    }

    /// Reads every message queued for `recipient` without removing them.
    pub fn peek(&self, recipient: &str) -> Result<Vec<Value>, MailboxError> {
        let path = self.queue_path(recipient);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_queue_file(&path)
    }

    fn is_duplicate(&self, hash: &str, message: &Value) -> Result<bool, MailboxError> {
        let marker_path = self.dedupe_path(hash);
        if let Ok(raw) = fs::read_to_string(&marker_path) {
            if let Ok(marker) = serde_json::from_str::<DedupeMarker>(&raw) {
                if OffsetDateTime::now_utc() - marker.recorded_at < DEDUPE_WINDOW {
                    return Ok(true);
                }
            }
        }

        let marker = DedupeMarker {
            recorded_at: OffsetDateTime::now_utc(),
            message: message.clone(),
        };
        let bytes = serde_json::to_vec(&marker).map_err(MailboxError::Serialize)?;
        fs::write(&marker_path, bytes).map_err(|e| MailboxError::Io {
            path: marker_path.display().to_string(),
            source: e,
        })?;
        Ok(false)
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), MailboxError> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| MailboxError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
    writeln!(file, "{line}").map_err(|e| MailboxError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

fn read_queue_file(path: &Path) -> Result<Vec<Value>, MailboxError> {
    let content = fs::read_to_string(path).map_err(|e| MailboxError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut messages = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(v) => messages.push(v),
            Err(e) => tracing::warn!(error = %e, "skipping malformed queue line"),
        }
    }
    Ok(messages)
}

fn message_field<'a>(message: &'a Value, field: &str) -> &'a str {
    message.get(field).and_then(Value::as_str).unwrap_or("unknown")
}

fn message_hash(message: &Value) -> String {
    let content = format!(
        "{}:{}:{}",
        message_field(message, "type"),
        message_field(message, "invoice"),
        message_field(message, "client"),
    );
    let digest = digest(&SHA256, content.as_bytes());
    digest.as_ref()[..8].iter().map(|b| format!("{b:02x}")).collect()
}

fn sanitize(recipient: &str) -> String {
    recipient.replace(['/', '\\'], "_")
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_then_receive_drains_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::new(tmp.path()).unwrap();
        mailbox.send("supervisor", json!({"type": "reminder_sent", "invoice": "INV-1", "client": "ACME"})).unwrap();
        mailbox.send("supervisor", json!({"type": "payment_detected", "invoice": "INV-2", "client": "ACME"})).unwrap();

        let received = mailbox.receive("supervisor").unwrap();
        assert_eq!(received.len(), 2);
        assert!(mailbox.receive("supervisor").unwrap().is_empty());
    }

    #[test]
    fn peek_does_not_remove_messages() {
        let tmp = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::new(tmp.path()).unwrap();
        mailbox.send("supervisor", json!({"type": "reminder_sent", "invoice": "INV-1", "client": "ACME"})).unwrap();

        assert_eq!(mailbox.peek("supervisor").unwrap().len(), 1);
        assert_eq!(mailbox.peek("supervisor").unwrap().len(), 1);
        assert_eq!(mailbox.receive("supervisor").unwrap().len(), 1);
    }

    #[test]
    fn duplicate_send_within_window_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::new(tmp.path()).unwrap();
        let msg = json!({"type": "reminder_sent", "invoice": "INV-1", "client": "ACME"});

        assert!(mailbox.send("supervisor", msg.clone()).unwrap());
        assert!(!mailbox.send("supervisor", msg).unwrap());
        assert_eq!(mailbox.peek("supervisor").unwrap().len(), 1);
    }

    #[test]
    fn distinct_messages_are_not_deduped() {
        let tmp = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::new(tmp.path()).unwrap();
        mailbox.send("supervisor", json!({"type": "reminder_sent", "invoice": "INV-1", "client": "ACME"})).unwrap();
        mailbox.send("supervisor", json!({"type": "reminder_sent", "invoice": "INV-2", "client": "ACME"})).unwrap();
        assert_eq!(mailbox.peek("supervisor").unwrap().len(), 2);
    }

    #[test]
    fn receive_on_missing_queue_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::new(tmp.path()).unwrap();
        assert!(mailbox.receive("nobody").unwrap().is_empty());
    }
}
