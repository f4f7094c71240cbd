//! Checksummed, atomically-written invoice state (spec §4.6).
//!
//! Each invoice lives at `state/{client}/{invoice}.json` as UTF-8 JSON plus
//! `_checksum`/`_updated_at`/`_version` metadata fields. Writes go through
//! the same atomic-rename discipline as the event log; `mark_paid` additionally
//! copies the record into `state/archive/{client}/{invoice}.json` and removes
//! the active file, following `InvoiceStateManager.mark_paid` exactly.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use collections_core::{
    atomic_file::write_atomic_private,
    checksum::checksum16,
    invoice::{Invoice, InvoiceKey},
    Classify, ErrorKind,
};
use collections_eventlog::EventLog;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;

const STATE_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state file not found for {client}/{invoice}")]
    NotFound { client: String, invoice: String },
    #[error("checksum mismatch for {client}/{invoice}: stored={stored}, computed={computed}, and no usable backup was found")]
    Corruption {
        client: String,
        invoice: String,
        stored: String,
        computed: String,
    },
    #[error("JSON error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Classify for StateError {
    fn kind(&self) -> ErrorKind {
        match self {
            StateError::Io { .. } => ErrorKind::Transient,
            StateError::NotFound { .. } => ErrorKind::Transient,
            StateError::Corruption { .. } => ErrorKind::StateCorruption,
            StateError::Json { .. } => ErrorKind::StateCorruption,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub client: String,
    pub invoice: String,
    pub valid: bool,
    pub message: String,
    pub path: PathBuf,
}

pub struct InvoiceStateStore {
    root: PathBuf,
    event_log: Arc<EventLog>,
    locks: Mutex<HashMap<InvoiceKey, Arc<Mutex<()>>>>,
}

impl InvoiceStateStore {
    pub fn new(root: impl Into<PathBuf>, event_log: Arc<EventLog>) -> Self {
        Self {
            root: root.into(),
            event_log,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &InvoiceKey) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .expect("lock registry mutex poisoned")
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn invoice_path(&self, client: &str, invoice: &str) -> PathBuf {
        self.root.join(client).join(format!("{invoice}.json"))
    }

    fn archive_path(&self, client: &str, invoice: &str) -> PathBuf {
        self.root.join("archive").join(client).join(format!("{invoice}.json"))
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".bak");
        path.with_file_name(name)
    }

    /// Writes `invoice`, stamping checksum/version metadata, and appends
    /// `event_type` to the event log. Per-key advisory-locked so concurrent
    /// writers to the same invoice serialize. Callers pass the semantic
    /// event that triggered the write (`"created"`, `"reminder_sent"`, ...)
    /// so the event log carries spec §4.5's literal event sequence rather
    /// than one generic marker.
    pub fn write(&self, invoice: &Invoice, event_type: &str) -> Result<(), StateError> {
        let key = invoice.key();
        let _guard = self.lock_for(&key);
        let path = self.invoice_path(key.client.as_str(), key.number.as_str());

        let mut value = serde_json::to_value(invoice).map_err(|e| StateError::Json {
            path: path.display().to_string(),
            source: e,
        })?;
        let checksum = checksum16(&value);
        let obj = value.as_object_mut().expect("Invoice serializes to an object");
        obj.insert("_checksum".into(), Value::String(checksum));
        obj.insert(
            "_updated_at".into(),
            Value::String(OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339).expect("valid timestamp")),
        );
        obj.insert("_version".into(), Value::String(STATE_VERSION.into()));

        let bytes = serde_json::to_vec_pretty(&value).map_err(|e| StateError::Json {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut bytes = bytes;
        bytes.push(b'\n');

        write_atomic_private(&path, &bytes).map_err(|e| StateError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        if let Err(e) = self.event_log.append(
            key.client.as_str(),
            key.number.as_str(),
            event_type,
            serde_json::to_value(invoice).unwrap_or(Value::Null),
        ) {
            warn!(client = key.client.as_str(), invoice = key.number.as_str(), event_type, error = %e, "event log append failed");
        }
        Ok(())
    }

    /// Reads and checksum-verifies `{client}/{invoice}`. On mismatch or
    /// parse failure, attempts `.bak` recovery before surfacing
    /// [`StateError::Corruption`].
    pub fn read(&self, client: &str, invoice: &str) -> Result<Option<Invoice>, StateError> {
        let path = self.invoice_path(client, invoice);
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        let value: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(_) => return self.recover_or_corrupt(client, invoice, &path, "<unparseable>", "<n/a>"),
        };

        let stored_checksum = value.get("_checksum").and_then(Value::as_str).map(str::to_owned);
        let computed = checksum16(&value);
        if let Some(stored) = stored_checksum {
            if stored != computed {
                return self.recover_or_corrupt(client, invoice, &path, &stored, &computed);
            }
        }

        let invoice_record: Invoice = serde_json::from_value(value).map_err(|e| StateError::Json {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(Some(invoice_record))
    }

    fn recover_or_corrupt(
        &self,
        client: &str,
        invoice: &str,
        path: &Path,
        stored: &str,
        computed: &str,
    ) -> Result<Option<Invoice>, StateError> {
        let backup = Self::backup_path(path);
        if let Ok(raw) = fs::read_to_string(&backup) {
            if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                if let Ok(record) = serde_json::from_value::<Invoice>(value) {
                    warn!(client, invoice, "recovered invoice state from .bak after corruption");
                    return Ok(Some(record));
                }
            }
        }
        Err(StateError::Corruption {
            client: client.to_owned(),
            invoice: invoice.to_owned(),
            stored: stored.to_owned(),
            computed: computed.to_owned(),
        })
    }

    /// Copies the current state file to `{file}.bak` (spec §4.6).
    pub fn create_backup(&self, client: &str, invoice: &str) -> Result<PathBuf, StateError> {
        let path = self.invoice_path(client, invoice);
        if !path.exists() {
            return Err(StateError::NotFound {
                client: client.to_owned(),
                invoice: invoice.to_owned(),
            });
        }
        let backup = Self::backup_path(&path);
        fs::copy(&path, &backup).map_err(|e| StateError::Io {
            path: backup.display().to_string(),
            source: e,
        })?;
        Ok(backup)
    }

    /// Marks `{client}/{invoice}` paid and moves it into the archive tree,
    /// mirroring `InvoiceStateManager.mark_paid`.
    pub fn mark_paid(&self, client: &str, invoice: &str, updated: &Invoice) -> Result<PathBuf, StateError> {
        let key = InvoiceKey::new(client, invoice);
        let _guard = self.lock_for(&key);

        let path = self.invoice_path(client, invoice);
        if !path.exists() {
            return Err(StateError::NotFound {
                client: client.to_owned(),
                invoice: invoice.to_owned(),
            });
        }

        self.write(updated, "state_update")?;

        let archive_path = self.archive_path(client, invoice);
        let mut value = serde_json::to_value(updated).map_err(|e| StateError::Json {
            path: archive_path.display().to_string(),
            source: e,
        })?;
        let checksum = checksum16(&value);
        let obj = value.as_object_mut().expect("Invoice serializes to an object");
        obj.insert("_checksum".into(), Value::String(checksum));
        obj.insert("_version".into(), Value::String(STATE_VERSION.into()));
        let mut bytes = serde_json::to_vec_pretty(&value).map_err(|e| StateError::Json {
            path: archive_path.display().to_string(),
            source: e,
        })?;
        bytes.push(b'\n');
        write_atomic_private(&archive_path, &bytes).map_err(|e| StateError::Io {
            path: archive_path.display().to_string(),
            source: e,
        })?;

        fs::remove_file(&path).map_err(|e| StateError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        if let Err(e) = self.event_log.append(
            client,
            invoice,
            "paid",
            serde_json::to_value(&updated.payment).unwrap_or(Value::Null),
        ) {
            warn!(client, invoice, error = %e, "event log append failed");
        }

        Ok(archive_path)
    }

    /// Marks `{client}/{invoice}` escalated and moves it into the archive
    /// tree, the same archive transition `mark_paid` performs (spec §3's
    /// "`paid` and `escalated` trigger archival" lifecycle rule).
    pub fn mark_escalated(&self, client: &str, invoice: &str, updated: &Invoice) -> Result<PathBuf, StateError> {
        let key = InvoiceKey::new(client, invoice);
        let _guard = self.lock_for(&key);

        let path = self.invoice_path(client, invoice);
        if !path.exists() {
            return Err(StateError::NotFound {
                client: client.to_owned(),
                invoice: invoice.to_owned(),
            });
        }

        self.write(updated, "state_update")?;

        let archive_path = self.archive_path(client, invoice);
        let mut value = serde_json::to_value(updated).map_err(|e| StateError::Json {
            path: archive_path.display().to_string(),
            source: e,
        })?;
        let checksum = checksum16(&value);
        let obj = value.as_object_mut().expect("Invoice serializes to an object");
        obj.insert("_checksum".into(), Value::String(checksum));
        obj.insert("_version".into(), Value::String(STATE_VERSION.into()));
        let mut bytes = serde_json::to_vec_pretty(&value).map_err(|e| StateError::Json {
            path: archive_path.display().to_string(),
            source: e,
        })?;
        bytes.push(b'\n');
        write_atomic_private(&archive_path, &bytes).map_err(|e| StateError::Io {
            path: archive_path.display().to_string(),
            source: e,
        })?;

        fs::remove_file(&path).map_err(|e| StateError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        if let Err(e) = self.event_log.append(client, invoice, "escalated", Value::Null) {
            warn!(client, invoice, error = %e, "event log append failed");
        }

        Ok(archive_path)
    }

    /// `(is_valid, message)` per spec §4.6's integrity scan.
    pub fn verify_integrity(&self, client: &str, invoice: &str) -> (bool, String) {
        let path = self.invoice_path(client, invoice);
        if !path.exists() {
            return (false, format!("state file not found: {}", path.display()));
        }
        match self.read(client, invoice) {
            Ok(Some(_)) => (true, format!("state file {client}/{invoice} is valid")),
            Ok(None) => (false, format!("state file not found: {}", path.display())),
            Err(e) => (false, e.to_string()),
        }
    }

    /// Lists every state file under the root with its integrity status,
    /// for the supervisor's reconciliation pass (`list_all_states`).
    pub fn list_all_states(&self) -> Result<Vec<IntegrityReport>, StateError> {
        let mut reports = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(reports),
            Err(e) => {
                return Err(StateError::Io {
                    path: self.root.display().to_string(),
                    source: e,
                })
            }
        };

        for entry in entries.flatten() {
            let client_dir = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_dir || name.starts_with('.') || name == "archive" || name == "review_queue" || name == "manual" {
                continue;
            }

            let Ok(files) = fs::read_dir(&client_dir) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let invoice = path.file_stem().unwrap_or_default().to_string_lossy().into_owned();
                let (valid, message) = self.verify_integrity(&name, &invoice);
                reports.push(IntegrityReport {
                    client: name.clone(),
                    invoice,
                    valid,
                    message,
                    path,
                });
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use collections_core::invoice::{ClientId, InvoiceNumber, InvoiceStatus};
    use rust_decimal_macros::dec;

    fn sample(client: &str, number: &str) -> Invoice {
        Invoice {
            client: ClientId::from(client),
            number: InvoiceNumber::from(number),
            amount: dec!(1500.00),
            due_date: OffsetDateTime::now_utc(),
            contact_email: "acme@example.com".into(),
            source_document_path: format!("{number}.pdf"),
            confidence: 0.98,
            status: InvoiceStatus::Unpaid,
            scanned_at: OffsetDateTime::now_utc(),
            paid_at: None,
            payment: None,
            reminder_log: Vec::new(),
        }
    }

    fn store(tmp: &tempfile::TempDir) -> InvoiceStateStore {
        let event_log = Arc::new(EventLog::new(tmp.path().join("events.log")));
        InvoiceStateStore::new(tmp.path().join("state"), event_log)
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let inv = sample("ACME", "INV-001");
        s.write(&inv, "created").unwrap();
        let loaded = s.read("ACME", "INV-001").unwrap().unwrap();
        assert_eq!(loaded.amount, inv.amount);
        assert_eq!(loaded.status, InvoiceStatus::Unpaid);
    }

    #[test]
    fn read_missing_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        assert!(s.read("ACME", "NOPE").unwrap().is_none());
    }

    #[test]
    fn tampered_checksum_is_detected_and_recovers_from_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let inv = sample("ACME", "INV-001");
        s.write(&inv, "created").unwrap();
        s.create_backup("ACME", "INV-001").unwrap();

        let path = tmp.path().join("state/ACME/INV-001.json");
        let mut value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["amount"] = Value::String("999999.00".into());
        fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();

        let recovered = s.read("ACME", "INV-001").unwrap().unwrap();
        assert_eq!(recovered.amount, inv.amount);
    }

    #[test]
    fn tampered_checksum_without_backup_is_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let inv = sample("ACME", "INV-001");
        s.write(&inv, "created").unwrap();

        let path = tmp.path().join("state/ACME/INV-001.json");
        let mut value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["amount"] = Value::String("999999.00".into());
        fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();

        let err = s.read("ACME", "INV-001").unwrap_err();
        assert!(matches!(err, StateError::Corruption { .. }));
    }

    #[test]
    fn mark_paid_archives_and_removes_active_file() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let mut inv = sample("ACME", "INV-001");
        s.write(&inv, "created").unwrap();

        inv.apply_paid(
            collections_core::invoice::Payment {
                method: "transfer".into(),
                amount: inv.amount,
                source_file: "pagado_INV-001.pdf".into(),
                detected_at: OffsetDateTime::now_utc(),
            },
            OffsetDateTime::now_utc(),
        );
        let archive_path = s.mark_paid("ACME", "INV-001", &inv).unwrap();

        assert!(archive_path.exists());
        assert!(!tmp.path().join("state/ACME/INV-001.json").exists());
    }

    #[test]
    fn mark_escalated_archives_and_removes_active_file() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let mut inv = sample("ACME", "INV-001");
        s.write(&inv, "created").unwrap();

        inv.apply_escalated();
        let archive_path = s.mark_escalated("ACME", "INV-001", &inv).unwrap();

        assert!(archive_path.exists());
        assert!(!tmp.path().join("state/ACME/INV-001.json").exists());
    }

    #[test]
    fn list_all_states_reports_every_invoice() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        s.write(&sample("ACME", "INV-001"), "created").unwrap();
        s.write(&sample("WIDGETCO", "INV-900"), "created").unwrap();
        let reports = s.list_all_states().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.valid));
    }
}
