//! Inbox reply classification (spec §4.11), grounded in
//! `collections/reply_monitor.py::ReplyMonitor`: the `REPLY_PATTERNS`
//! ordered regex table, the two-language invoice-number extraction regex,
//! and `execute_actions`'s dispatch all carry over, with the Graph API
//! client becoming the injected [`InboxReader`] trait.

use std::{path::Path, sync::Mutex};

use collections_core::invoice::Payment;
use collections_ledger::{Ledger, LedgerError};
use collections_state::{InvoiceStateStore, StateError};
use regex::Regex;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Clone, Debug)]
pub struct InboxMessage {
    pub subject: String,
    pub body: String,
    pub from_address: String,
}

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("inbox read failed: {0}")]
    Failed(String),
}

/// The injected collaborator for reading new mail (spec §1); production
/// code implements this against a Graph/IMAP client.
pub trait InboxReader: Send + Sync {
    fn messages_since(&self, since: Option<OffsetDateTime>, senders: &[String]) -> Result<Vec<InboxMessage>, ReaderError>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplyActionKind {
    Pause,
    MarkPaid,
    ManualReview,
}

#[derive(Clone, Debug)]
pub struct ReplyAction {
    pub kind: ReplyActionKind,
    pub sender_email: String,
    pub invoice_number: String,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExecutionReport {
    pub paused_invoices: usize,
    pub marked_paid: usize,
    pub queued_for_review: usize,
    pub unmatched: usize,
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static reply-classification pattern is valid regex")
}

/// Canonical mapping (spec §4.11), checked in order: the first pattern
/// that matches wins.
fn reply_patterns() -> Vec<(Regex, ReplyActionKind)> {
    vec![
        (compile(r"(?i)stop|detener|unsubscribe"), ReplyActionKind::Pause),
        (compile(r"(?i)pagado|pago|paid"), ReplyActionKind::MarkPaid),
        (compile(r"(?i)duda|dudas|pregunta|question|clarify"), ReplyActionKind::ManualReview),
    ]
}

fn invoice_number_regexes() -> [Regex; 2] {
    [
        compile(r"(?i)factura\s*#?\s*:?\s*([A-Z0-9-]+)"),
        compile(r"(?i)invoice\s*#?\s*:?\s*([A-Z0-9-]+)"),
    ]
}

/// Classifies one inbox message, returning `None` if it doesn't match any
/// reply pattern (most inbox traffic isn't a collections reply at all).
pub fn classify(message: &InboxMessage, patterns: &[(Regex, ReplyActionKind)]) -> Option<ReplyAction> {
    let content = format!("{} {}", message.subject, message.body);

    let invoice_number = invoice_number_regexes()
        .iter()
        .find_map(|re| re.captures(&content).and_then(|c| c.get(1)).map(|m| m.as_str().to_owned()))
        .unwrap_or_else(|| "unknown".to_owned());

    for (regex, kind) in patterns {
        if regex.is_match(&content) {
            return Some(ReplyAction {
                kind: *kind,
                sender_email: message.from_address.clone(),
                invoice_number,
                reason: format!("matched pattern: {}", regex.as_str()),
            });
        }
    }
    None
}

/// Periodically scans collection-sender mail and classifies replies into
/// actions (spec §4.11). `last_check` is process-scoped only; it is not
/// persisted across restarts (spec §9's accepted limitation).
pub struct ReplyClassifier<R: InboxReader> {
    reader: R,
    patterns: Vec<(Regex, ReplyActionKind)>,
    last_check: Mutex<Option<OffsetDateTime>>,
}

impl<R: InboxReader> ReplyClassifier<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            patterns: reply_patterns(),
            last_check: Mutex::new(None),
        }
    }

    /// Gives callers access to the underlying reader, e.g. to rotate a
    /// refreshed access token into it before the next [`Self::check_replies`]
    /// call without rebuilding the classifier (which would lose `last_check`).
    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// Fetches new messages since the last scan, classifies them, and
    /// advances `last_check` to now regardless of outcome (spec §4.11: no
    /// exactly-once guarantee, idempotence comes from target-state checks).
    pub fn check_replies(&self, collection_senders: &[String]) -> Result<Vec<ReplyAction>, ReaderError> {
        let since = *self.last_check.lock().expect("last_check mutex poisoned");
        let messages = self.reader.messages_since(since, collection_senders)?;
        let actions = messages.iter().filter_map(|m| classify(m, &self.patterns)).collect();
        *self.last_check.lock().expect("last_check mutex poisoned") = Some(OffsetDateTime::now_utc());
        Ok(actions)
    }

    /// Dispatches each action against `store` (spec §4.11's `execute`).
    /// Invoices are matched by `contact_email == action.sender_email`
    /// since replies arrive keyed by sender address, not `ClientId`
    /// (an ambiguity in the source `ReplyMonitor`, resolved here by scanning
    /// state for the matching contact — see the design ledger).
    pub fn execute(
        &self,
        actions: &[ReplyAction],
        store: &InvoiceStateStore,
        ledger_path: &Path,
    ) -> Result<ExecutionReport, ExecuteError> {
        let mut report = ExecutionReport::default();
        let now = OffsetDateTime::now_utc();
        let now_str = now.format(&time::format_description::well_known::Rfc3339).ok();

        for action in actions {
            let candidates = store
                .list_all_states()?
                .into_iter()
                .filter(|r| r.valid)
                .filter_map(|r| store.read(&r.client, &r.invoice).ok().flatten().map(|inv| (r.client, r.invoice, inv)))
                .filter(|(_, _, inv)| inv.contact_email == action.sender_email)
                .collect::<Vec<_>>();

            match action.kind {
                ReplyActionKind::Pause => {
                    for (client, number, mut invoice) in candidates {
                        if invoice.status.is_terminal() {
                            continue;
                        }
                        invoice.status = collections_core::invoice::InvoiceStatus::Paused;
                        store.write(&invoice, "paused")?;
                        tracing::info!(client, number, "client paused collections via reply");
                        report.paused_invoices += 1;
                    }
                }
                ReplyActionKind::MarkPaid => {
                    let hit = candidates.into_iter().find(|(_, number, _)| number.eq_ignore_ascii_case(&action.invoice_number));
                    if let Some((client, number, mut invoice)) = hit {
                        invoice.apply_paid(
                            Payment {
                                method: "email_reply".into(),
                                amount: invoice.amount,
                                source_file: format!("reply:{}", action.sender_email),
                                detected_at: now,
                            },
                            now,
                        );
                        store.mark_paid(&client, &number, &invoice)?;
                        Ledger::open(ledger_path)?.mark_paid(&number, now_str.as_deref(), Some("email_reply"))?;
                        report.marked_paid += 1;
                    } else {
                        report.unmatched += 1;
                    }
                }
                ReplyActionKind::ManualReview => {
                    let hit = candidates.into_iter().find(|(_, number, _)| number.eq_ignore_ascii_case(&action.invoice_number));
                    if let Some((_, _, mut invoice)) = hit {
                        invoice.status = collections_core::invoice::InvoiceStatus::InReview;
                        store.write(&invoice, "flagged_for_review")?;
                        report.queued_for_review += 1;
                    } else {
                        report.unmatched += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use collections_core::invoice::{ClientId, Invoice, InvoiceNumber, InvoiceStatus};
    use collections_eventlog::EventLog;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct NoopReader;
    impl InboxReader for NoopReader {
        fn messages_since(&self, _since: Option<OffsetDateTime>, _senders: &[String]) -> Result<Vec<InboxMessage>, ReaderError> {
            Ok(Vec::new())
        }
    }

    fn patterns() -> Vec<(Regex, ReplyActionKind)> {
        reply_patterns()
    }

    #[test]
    fn classifies_pause_request() {
        let msg = InboxMessage {
            subject: "Re: Invoice INV-001".into(),
            body: "Please stop sending these emails".into(),
            from_address: "client@example.com".into(),
        };
        let action = classify(&msg, &patterns()).unwrap();
        assert_eq!(action.kind, ReplyActionKind::Pause);
        assert_eq!(action.invoice_number, "INV-001");
    }

    #[test]
    fn classifies_spanish_paid_reply() {
        let msg = InboxMessage {
            subject: "Factura: FAC-2026".into(),
            body: "Ya pagado, gracias".into(),
            from_address: "cliente@example.com".into(),
        };
        let action = classify(&msg, &patterns()).unwrap();
        assert_eq!(action.kind, ReplyActionKind::MarkPaid);
        assert_eq!(action.invoice_number, "FAC-2026");
    }

    #[test]
    fn unrelated_message_is_not_classified() {
        let msg = InboxMessage {
            subject: "Lunch tomorrow?".into(),
            body: "Are you free at noon".into(),
            from_address: "friend@example.com".into(),
        };
        assert!(classify(&msg, &patterns()).is_none());
    }

    fn sample_invoice(email: &str) -> Invoice {
        Invoice {
            client: ClientId::from("ACME"),
            number: InvoiceNumber::from("INV-001"),
            amount: dec!(1500.00),
            due_date: OffsetDateTime::now_utc(),
            contact_email: email.into(),
            source_document_path: "INV-001.pdf".into(),
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
    fn execute_mark_paid_transitions_matching_invoice() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        s.write(&sample_invoice("acme@example.com"), "created").unwrap();
        let ledger_path = tmp.path().join("ledger.md");
        Ledger::open(&ledger_path).unwrap().add("INV-001", dec!(1500.00), "ACME", None).unwrap();

        let classifier = ReplyClassifier::new(NoopReader);
        let actions = vec![ReplyAction {
            kind: ReplyActionKind::MarkPaid,
            sender_email: "acme@example.com".into(),
            invoice_number: "INV-001".into(),
            reason: "matched pattern".into(),
        }];
        let report = classifier.execute(&actions, &s, &ledger_path).unwrap();
        assert_eq!(report.marked_paid, 1);
        assert!(tmp.path().join("state/archive/ACME/INV-001.json").exists());
    }

    #[test]
    fn execute_pause_affects_all_active_invoices_for_sender() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        s.write(&sample_invoice("acme@example.com"), "created").unwrap();
        let ledger_path = tmp.path().join("ledger.md");

        let classifier = ReplyClassifier::new(NoopReader);
        let actions = vec![ReplyAction {
            kind: ReplyActionKind::Pause,
            sender_email: "acme@example.com".into(),
            invoice_number: "unknown".into(),
            reason: "matched pattern".into(),
        }];
        let report = classifier.execute(&actions, &s, &ledger_path).unwrap();
        assert_eq!(report.paused_invoices, 1);
        let invoice = s.read("ACME", "INV-001").unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paused);
    }
}
