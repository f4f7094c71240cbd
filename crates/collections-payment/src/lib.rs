//! Filesystem-watch payment detection (spec §4.12), grounded in
//! `filesystem/payment_detector.py::PaymentEventHandler` (watch setup,
//! filename pattern matching, MD5-based 24h dedup) and
//! `filesystem/payment_checker.py::PaymentConfidenceChecker` (payment-data
//! extraction, invoice matching precedence, amount-match scoring).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use collections_core::invoice::Payment;
use collections_ledger::Ledger;
use collections_mailbox::Mailbox;
use collections_state::InvoiceStateStore;
use md5::{Digest, Md5};
use notify::{
    event::{CreateKind, ModifyKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use thiserror::Error;
use time::OffsetDateTime;

const DEDUPE_WINDOW: Duration = Duration::from_secs(86_400);

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error(transparent)]
    State(#[from] collections_state::StateError),
    #[error(transparent)]
    Ledger(#[from] collections_ledger::LedgerError),
    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),
}

static FILENAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"pagado|paid|payment", r"confirmacion|confirmation", r"recibo|receipt"]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern is valid regex"))
        .collect()
});

/// Whether `path`'s final component looks like payment evidence (spec §4.12).
pub fn is_payment_file(path: &Path) -> bool {
    let name = path.to_string_lossy().to_lowercase();
    FILENAME_PATTERNS.iter().any(|re| re.is_match(&name))
}

/// `.tmp` -> final-name rename landing on a payment filename is also
/// accepted (spec §4.12).
pub fn is_payment_rename(from: &Path, to: &Path) -> bool {
    let from_is_tmp = from.extension().and_then(|e| e.to_str()) == Some("tmp");
    from_is_tmp && is_payment_file(to)
}

#[derive(Clone, Debug, Default)]
pub struct ExtractedPaymentData {
    pub amount: Option<Decimal>,
    pub client_hint: Option<String>,
    pub invoice_number_hint: Option<String>,
    pub method: String,
}

fn infer_method(name_lower: &str) -> String {
    let tokens = [
        ("bancolombia", "bancolombia"),
        ("davivienda", "davivienda"),
        ("transfer", "transfer"),
        ("pago", "pago"),
        ("payment", "payment"),
    ];
    tokens
        .iter()
        .find(|(token, _)| name_lower.contains(token))
        .map(|(_, method)| method.to_string())
        .unwrap_or_else(|| "unknown".to_owned())
}

static AMOUNT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"[\$]?([0-9,]+\.\d{2})", r"[\$]?([0-9,]+)"]
        .iter()
        .map(|p| Regex::new(p).expect("static amount pattern is valid regex"))
        .collect()
});

static INVOICE_NUMBER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"(?i)(?:factura|invoice|pagare|inv)[\s_-]*([A-Z0-9-]+)", r"([A-Z]{2,3}[0-9]{3,6})"]
        .iter()
        .map(|p| Regex::new(p).expect("static invoice pattern is valid regex"))
        .collect()
});

/// Pulls amount/client/invoice hints out of a payment file's name and path
/// (spec §4.12), transcribed from `_extract_payment_data`.
pub fn extract_payment_data(path: &Path) -> ExtractedPaymentData {
    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let name_lower = file_name.to_lowercase();
    let method = infer_method(&name_lower);

    let amount = AMOUNT_PATTERNS.iter().find_map(|re| {
        re.captures(&file_name).and_then(|c| c.get(1)).and_then(|m| m.as_str().replace(',', "").parse::<Decimal>().ok())
    });

    let invoice_number_hint = INVOICE_NUMBER_PATTERNS
        .iter()
        .find_map(|re| re.captures(&file_name).and_then(|c| c.get(1)).map(|m| m.as_str().to_owned()));

    let client_hint = path.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect::<Vec<_>>().windows(2).find_map(|w| {
        if matches!(w[0].to_lowercase().as_str(), "clients" | "clientes") {
            Some(w[1].clone())
        } else {
            None
        }
    });

    ExtractedPaymentData {
        amount,
        client_hint,
        invoice_number_hint,
        method,
    }
}

/// A candidate unpaid invoice to match payment evidence against.
#[derive(Clone, Debug)]
pub struct UnpaidInvoiceRef {
    pub client: String,
    pub invoice_number: String,
    pub amount: Decimal,
}

/// Confidence from comparing a payment amount to an invoice's amount (spec
/// §4.12): exact match, underpayment, and overpayment score differently,
/// transcribed verbatim from `_verify_amount`.
pub fn verify_amount(payment_amount: Option<Decimal>, invoice_amount: Decimal) -> f64 {
    let Some(payment_amount) = payment_amount else { return 0.0 };
    let diff = (payment_amount - invoice_amount).abs();
    if diff < Decimal::new(1, 2) {
        1.0
    } else if payment_amount < invoice_amount {
        0.95
    } else {
        0.90
    }
}

/// Finds the best-matching unpaid invoice: an exact invoice-number hit
/// takes precedence over a client + amount-within-5% match (spec §4.12).
pub fn find_matching_invoice(data: &ExtractedPaymentData, unpaid: &[UnpaidInvoiceRef]) -> Option<UnpaidInvoiceRef> {
    if let Some(hint) = &data.invoice_number_hint {
        if let Some(hit) = unpaid.iter().find(|inv| &inv.invoice_number == hint) {
            return Some(hit.clone());
        }
    }

    if let (Some(amount), Some(client)) = (data.amount, &data.client_hint) {
        for invoice in unpaid {
            if &invoice.client != client || invoice.amount <= Decimal::ZERO {
                continue;
            }
            let diff_percent = (invoice.amount - amount).abs() / invoice.amount;
            if diff_percent <= Decimal::new(5, 2) {
                return Some(invoice.clone());
            }
        }
    }
    None
}

#[derive(Clone, Debug)]
pub struct PaymentMatch {
    pub client: String,
    pub invoice_number: String,
    pub confidence: f64,
    pub amount: Option<Decimal>,
    pub method: String,
    pub source_file: PathBuf,
}

/// Extracts payment data from `path` and matches it against `unpaid`,
/// mirroring `PaymentConfidenceChecker.__call__`.
pub fn check_confidence(path: &Path, unpaid: &[UnpaidInvoiceRef]) -> Option<PaymentMatch> {
    let data = extract_payment_data(path);
    let matched = find_matching_invoice(&data, unpaid)?;
    let confidence = verify_amount(data.amount, matched.amount);
    Some(PaymentMatch {
        client: matched.client,
        invoice_number: matched.invoice_number,
        confidence,
        amount: data.amount,
        method: data.method,
        source_file: path.to_path_buf(),
    })
}

fn hash_file(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => {
            let mut hasher = Md5::new();
            hasher.update(&bytes);
            hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
        }
        Err(_) => path.to_string_lossy().into_owned(),
    }
}

/// Watches filesystem paths for payment evidence and marks matching
/// invoices paid (spec §4.12). MD5 content dedup, a deliberate exception
/// to the SHA-256-everywhere default elsewhere, per spec §4.12 and
/// `_hash_file`.
pub struct PaymentDetector {
    store: Arc<InvoiceStateStore>,
    mailbox: Option<Arc<Mailbox>>,
    ledger_path: Option<PathBuf>,
    recent_files: Mutex<HashMap<String, Instant>>,
}

impl PaymentDetector {
    pub fn new(store: Arc<InvoiceStateStore>, mailbox: Option<Arc<Mailbox>>, ledger_path: Option<PathBuf>) -> Self {
        Self {
            store,
            mailbox,
            ledger_path,
            recent_files: Mutex::new(HashMap::new()),
        }
    }

    fn is_duplicate(&self, hash: &str) -> bool {
        let mut recent = self.recent_files.lock().expect("recent_files mutex poisoned");
        recent.retain(|_, seen_at| seen_at.elapsed() < DEDUPE_WINDOW);
        if recent.contains_key(hash) {
            return true;
        }
        recent.insert(hash.to_owned(), Instant::now());
        false
    }

    fn unpaid_invoices(&self) -> Result<Vec<UnpaidInvoiceRef>, PaymentError> {
        let mut unpaid = Vec::new();
        for report in self.store.list_all_states()? {
            if !report.valid {
                continue;
            }
            if let Some(invoice) = self.store.read(&report.client, &report.invoice)? {
                if invoice.status == collections_core::invoice::InvoiceStatus::Unpaid {
                    unpaid.push(UnpaidInvoiceRef {
                        client: report.client,
                        invoice_number: report.invoice,
                        amount: invoice.amount,
                    });
                }
            }
        }
        Ok(unpaid)
    }

    /// Processes one candidate payment file end to end: pattern check,
    /// dedup, confidence match, and (on a hit) the mark-paid + archive
    /// transition plus an `INVOICE_PAID` notice to the emailer's mailbox.
    pub fn process_file(&self, path: &Path) -> Result<Option<PaymentMatch>, PaymentError> {
        if !is_payment_file(path) {
            return Ok(None);
        }
        let hash = hash_file(path);
        if self.is_duplicate(&hash) {
            return Ok(None);
        }

        let unpaid = self.unpaid_invoices()?;
        let Some(matched) = check_confidence(path, &unpaid) else {
            tracing::warn!(path = %path.display(), "payment file doesn't match any invoice");
            return Ok(None);
        };

        let mut invoice = self
            .store
            .read(&matched.client, &matched.invoice_number)?
            .ok_or_else(|| collections_state::StateError::NotFound {
                client: matched.client.clone(),
                invoice: matched.invoice_number.clone(),
            })?;
        invoice.apply_paid(
            Payment {
                method: matched.method.clone(),
                amount: matched.amount.unwrap_or(invoice.amount),
                source_file: path.display().to_string(),
                detected_at: OffsetDateTime::now_utc(),
            },
            OffsetDateTime::now_utc(),
        );
        self.store.mark_paid(&matched.client, &matched.invoice_number, &invoice)?;
        if let Some(ledger_path) = &self.ledger_path {
            let paid_date = OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339).ok();
            Ledger::open(ledger_path.as_path())?.mark_paid(&matched.invoice_number, paid_date.as_deref(), Some(&matched.method))?;
        }

        if let Some(mailbox) = &self.mailbox {
            let _ = mailbox.send(
                "emailer",
                serde_json::json!({
                    "type": "INVOICE_PAID",
                    "invoice": matched.invoice_number,
                    "client": matched.client,
                }),
            );
        }

        tracing::info!(invoice = matched.invoice_number, client = matched.client, "payment processed");
        Ok(Some(matched))
    }

    /// Blocks watching `watch_paths` (recursively) until the channel
    /// closes, processing every create/rename event that looks like
    /// payment evidence.
    pub fn watch(&self, watch_paths: &[PathBuf]) -> Result<(), PaymentError> {
        let (tx, rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(tx)?;
        for path in watch_paths {
            if path.exists() {
                watcher.watch(path, RecursiveMode::Recursive)?;
                tracing::info!(path = %path.display(), "watching for payment evidence");
            } else {
                tracing::warn!(path = %path.display(), "watch path does not exist");
            }
        }

        for event in rx {
            let Ok(event) = event else { continue };
            match event.kind {
                EventKind::Create(CreateKind::File) => {
                    for path in &event.paths {
                        if let Err(e) = self.process_file(path) {
                            tracing::error!(error = %e, path = %path.display(), "error processing payment file");
                        }
                    }
                }
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                    if is_payment_rename(&event.paths[0], &event.paths[1]) {
                        if let Err(e) = self.process_file(&event.paths[1]) {
                            tracing::error!(error = %e, path = %event.paths[1].display(), "error processing renamed payment file");
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use collections_core::invoice::{ClientId, Invoice, InvoiceNumber, InvoiceStatus};
    use collections_eventlog::EventLog;
    use rust_decimal_macros::dec;

    #[test]
    fn payment_filename_patterns_are_recognized() {
        assert!(is_payment_file(Path::new("/tmp/pagado_INV-001.pdf")));
        assert!(is_payment_file(Path::new("/tmp/payment_confirmation.pdf")));
        assert!(!is_payment_file(Path::new("/tmp/invoice.pdf")));
    }

    #[test]
    fn tmp_to_pdf_rename_is_accepted() {
        assert!(is_payment_rename(Path::new("/tmp/paid_receipt.pdf.tmp"), Path::new("/tmp/paid_receipt.pdf")));
        assert!(!is_payment_rename(Path::new("/tmp/draft.pdf.tmp"), Path::new("/tmp/draft.pdf")));
    }

    #[test]
    fn extract_payment_data_reads_method_amount_and_client() {
        let data = extract_payment_data(Path::new("/home/x/Clients/ACME/payments/transfer_1500.00_INV-2026.pdf"));
        assert_eq!(data.method, "transfer");
        assert_eq!(data.amount, Some(dec!(1500.00)));
        assert_eq!(data.client_hint.as_deref(), Some("ACME"));
        assert_eq!(data.invoice_number_hint.as_deref(), Some("2026"));
    }

    #[test]
    fn verify_amount_scores_exact_under_and_over() {
        assert_eq!(verify_amount(Some(dec!(1500.00)), dec!(1500.00)), 1.0);
        assert_eq!(verify_amount(Some(dec!(1400.00)), dec!(1500.00)), 0.95);
        assert_eq!(verify_amount(Some(dec!(1600.00)), dec!(1500.00)), 0.90);
        assert_eq!(verify_amount(None, dec!(1500.00)), 0.0);
    }

    #[test]
    fn invoice_number_match_takes_precedence_over_amount() {
        let data = ExtractedPaymentData {
            amount: Some(dec!(999.00)),
            client_hint: Some("OTHER".into()),
            invoice_number_hint: Some("INV-001".into()),
            method: "transfer".into(),
        };
        let unpaid = vec![
            UnpaidInvoiceRef { client: "ACME".into(), invoice_number: "INV-001".into(), amount: dec!(1500.00) },
            UnpaidInvoiceRef { client: "OTHER".into(), invoice_number: "INV-999".into(), amount: dec!(999.00) },
        ];
        let hit = find_matching_invoice(&data, &unpaid).unwrap();
        assert_eq!(hit.invoice_number, "INV-001");
    }

    fn sample(client: &str, number: &str, amount: rust_decimal::Decimal) -> Invoice {
        Invoice {
            client: ClientId::from(client),
            number: InvoiceNumber::from(number),
            amount,
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

    #[test]
    fn process_file_marks_matching_invoice_paid() {
        let tmp = tempfile::tempdir().unwrap();
        let event_log = Arc::new(EventLog::new(tmp.path().join("events.log")));
        let store = Arc::new(InvoiceStateStore::new(tmp.path().join("state"), event_log));
        store.write(&sample("ACME", "INV-2026", dec!(1500.00)), "created").unwrap();
        let ledger_path = tmp.path().join("ledger.md");
        Ledger::open(&ledger_path).unwrap().add("INV-2026", dec!(1500.00), "ACME", None).unwrap();

        let payment_dir = tmp.path().join("payments");
        std::fs::create_dir_all(&payment_dir).unwrap();
        let payment_file = payment_dir.join("pagado_INV-2026_1500.00.pdf");
        std::fs::write(&payment_file, b"%PDF-fixture").unwrap();

        let detector = PaymentDetector::new(store.clone(), None, Some(ledger_path));
        let outcome = detector.process_file(&payment_file).unwrap().unwrap();
        assert_eq!(outcome.invoice_number, "INV-2026");
        assert!(tmp.path().join("state/archive/ACME/INV-2026.json").exists());
    }

    #[test]
    fn duplicate_file_within_window_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let event_log = Arc::new(EventLog::new(tmp.path().join("events.log")));
        let store = Arc::new(InvoiceStateStore::new(tmp.path().join("state"), event_log));
        store.write(&sample("ACME", "INV-2026", dec!(1500.00)), "created").unwrap();

        let payment_file = tmp.path().join("pagado_INV-2026.pdf");
        std::fs::write(&payment_file, b"%PDF-fixture").unwrap();

        let detector = PaymentDetector::new(store, None, None);
        assert!(detector.process_file(&payment_file).unwrap().is_some());
        assert!(detector.process_file(&payment_file).unwrap().is_none());
    }
}
