//! Due-reminder computation and the rate-limited send loop (spec §4.10).
//!
//! Grounded in `collections/scheduler.py::CollectionScheduler`: the
//! `REMINDER_RULES` table, `get_due_reminders`/`get_due`, and
//! `send_reminders`'s batch loop are carried over verbatim; the
//! `RateLimitExceeded` exception becomes a typed [`SendOutcome`] variant
//! and the email transport becomes the injected [`MailSender`] trait.

use std::path::Path;

use collections_core::invoice::{Invoice, InvoiceStatus};
use collections_ledger::Ledger;
use collections_ratelimit::{ExponentialBackoff, RateLimiter};
use collections_state::InvoiceStateStore;
use thiserror::Error;
use time::OffsetDateTime;

/// One reminder rule: fires when `days_to_due(invoice, now) == offset`.
/// Negative offsets are "before due", positive are "after due" (overdue).
#[derive(Clone, Copy, Debug)]
pub struct ReminderRule {
    pub rule_id: &'static str,
    pub offset_days: i64,
    pub template: &'static str,
}

/// Canonical reminder rule table (spec §4.10), sourced verbatim from
/// `scheduler.py::REMINDER_RULES`.
pub const REMINDER_RULES: &[ReminderRule] = &[
    ReminderRule { rule_id: "reminder_1", offset_days: -3, template: "reminder_3d" },
    ReminderRule { rule_id: "reminder_2", offset_days: 0, template: "reminder_due" },
    ReminderRule { rule_id: "overdue_1", offset_days: 5, template: "overdue_5d" },
    ReminderRule { rule_id: "overdue_2", offset_days: 7, template: "overdue_7d" },
    ReminderRule { rule_id: "final_notice", offset_days: 10, template: "final_notice" },
    ReminderRule { rule_id: "escalation", offset_days: 14, template: "escalation" },
];

const ESCALATION_RULE_ID: &str = "escalation";

/// One reminder a given invoice is due for today.
#[derive(Clone, Copy, Debug)]
pub struct DueReminder {
    pub invoice_index: usize,
    pub rule: ReminderRule,
}

/// The rendered message handed to [`MailSender`].
#[derive(Clone, Debug)]
pub struct ReminderMessage<'a> {
    pub to: &'a str,
    pub template: &'static str,
    pub rule_id: &'static str,
    pub invoice: &'a Invoice,
}

pub type MessageId = String;

/// Why a send attempt did not succeed, distinguishing transport-level
/// rate limiting from auth failures from ordinary transient errors (spec §7).
#[derive(Clone, Debug, Error)]
pub enum SendOutcome {
    #[error("mail transport reports rate limiting")]
    RateLimited,
    #[error("mail transport auth error: {0}")]
    AuthError(String),
    #[error("mail transport transient error: {0}")]
    Transient(String),
}

/// The injected mail transport (spec §1).
pub trait MailSender {
    fn send(&self, msg: &ReminderMessage<'_>) -> Result<MessageId, SendOutcome>;
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("mail transport auth error: {0}")]
    AuthError(String),
    #[error(transparent)]
    State(#[from] collections_state::StateError),
    #[error(transparent)]
    Ledger(#[from] collections_ledger::LedgerError),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SendReport {
    pub sent: usize,
    pub failed: usize,
    pub rate_limited: usize,
    /// Set when a rate limit stopped the batch; the caller should wait at
    /// least this long before the next `send_reminders` call instead of
    /// retrying on the usual cycle interval.
    pub backoff_delay: Option<std::time::Duration>,
}

/// Every `(invoice, rule)` pair due today: `status == unpaid`, the rule's
/// offset matches `days_to_due`, and the rule has not already fired for
/// this invoice (spec §4.10's idempotence guarantee). A client pause is
/// represented as `status = paused`, so filtering on `unpaid` alone
/// already implements `is_not_paused`.
pub fn get_due(invoices: &[Invoice], now: OffsetDateTime) -> Vec<DueReminder> {
    let today = now.date();
    let mut due = Vec::new();
    for (index, invoice) in invoices.iter().enumerate() {
        if invoice.status != InvoiceStatus::Unpaid {
            continue;
        }
        let days_to_due = (invoice.due_day() - today).whole_days();
        for rule in REMINDER_RULES {
            if rule.offset_days == days_to_due && !invoice.has_fired(rule.rule_id) {
                due.push(DueReminder { invoice_index: index, rule: *rule });
            }
        }
    }
    due
}

/// Sends up to `batch_size` due reminders (spec §4.10's pipeline). Successful
/// sends append a `reminder_log` entry and persist via `store`; the
/// `escalation` rule additionally transitions the invoice to `escalated`
/// and archives it. A bucket refusal or transport-reported rate limit
/// stops the batch immediately so the caller can back off and resume next
/// cycle; an auth error surfaces to the caller for the token validator to
/// handle; any other transient failure is recorded and the batch continues.
#[allow(clippy::too_many_arguments)]
pub fn send_reminders(
    invoices: &mut [Invoice],
    batch_size: usize,
    rate_limiter: &RateLimiter,
    backoff: &ExponentialBackoff,
    sender: &dyn MailSender,
    store: &InvoiceStateStore,
    ledger_path: &Path,
    now: OffsetDateTime,
) -> Result<SendReport, SchedulerError> {
    let due = get_due(invoices, now);
    let mut report = SendReport::default();
    let now_str = now.format(&time::format_description::well_known::Rfc3339).ok();

    for due_reminder in due.into_iter().take(batch_size) {
        let DueReminder { invoice_index, rule } = due_reminder;

        if !rate_limiter.try_acquire() {
            report.rate_limited += 1;
            report.backoff_delay = Some(backoff.get_delay());
            break;
        }

        let invoice = &invoices[invoice_index];
        let msg = ReminderMessage {
            to: &invoice.contact_email,
            template: rule.template,
            rule_id: rule.rule_id,
            invoice,
        };

        match sender.send(&msg) {
            Ok(_message_id) => {
                let invoice = &mut invoices[invoice_index];
                invoice.reminder_log.push(collections_core::invoice::ReminderLogEntry {
                    rule_id: rule.rule_id.to_owned(),
                    sent_at: now,
                    template: rule.template.to_owned(),
                    outcome: collections_core::invoice::ReminderOutcome::Sent,
                });

                if rule.rule_id == ESCALATION_RULE_ID {
                    invoice.apply_escalated();
                    let client = invoice.client.as_str().to_owned();
                    let number = invoice.number.as_str().to_owned();
                    store.mark_escalated(&client, &number, invoice)?;
                    Ledger::open(ledger_path)?.escalate(&number, "escalation_rule_fired", now_str.as_deref())?;
                } else {
                    store.write(invoice, "reminder_sent")?;
                }
                backoff.reset();
                report.sent += 1;
            }
            Err(SendOutcome::RateLimited) => {
                report.rate_limited += 1;
                report.backoff_delay = Some(backoff.get_delay());
                break;
            }
            Err(SendOutcome::AuthError(reason)) => {
                return Err(SchedulerError::AuthError(reason));
            }
            Err(SendOutcome::Transient(reason)) => {
                let invoice = &mut invoices[invoice_index];
                invoice.reminder_log.push(collections_core::invoice::ReminderLogEntry {
                    rule_id: rule.rule_id.to_owned(),
                    sent_at: now,
                    template: rule.template.to_owned(),
                    outcome: collections_core::invoice::ReminderOutcome::Failed,
                });
                store.write(invoice, "reminder_failed")?;
                tracing::warn!(rule = rule.rule_id, reason = %reason, "reminder send failed");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;
    use collections_core::invoice::{ClientId, InvoiceNumber};
    use collections_eventlog::EventLog;
    use rust_decimal_macros::dec;
    use std::sync::{Arc, Mutex};
    use time::Duration;

    fn invoice_due_in(days: i64) -> Invoice {
        Invoice {
            client: ClientId::from("ACME"),
            number: InvoiceNumber::from("INV-001"),
            amount: dec!(1500.00),
            due_date: OffsetDateTime::now_utc() + Duration::days(days),
            contact_email: "acme@example.com".into(),
            source_document_path: "INV-001.pdf".into(),
            confidence: 0.98,
            status: InvoiceStatus::Unpaid,
            scanned_at: OffsetDateTime::now_utc(),
            paid_at: None,
            payment: None,
            reminder_log: Vec::new(),
        }
    }

    struct RecordingSender {
        sent: Mutex<Vec<String>>,
    }

    impl MailSender for RecordingSender {
        fn send(&self, msg: &ReminderMessage<'_>) -> Result<MessageId, SendOutcome> {
            self.sent.lock().unwrap().push(msg.rule_id.to_owned());
            Ok("msg-1".to_owned())
        }
    }

    fn store(tmp: &tempfile::TempDir) -> InvoiceStateStore {
        let event_log = Arc::new(EventLog::new(tmp.path().join("events.log")));
        InvoiceStateStore::new(tmp.path().join("state"), event_log)
    }

    #[test]
    fn get_due_matches_reminder_3_days_before() {
        let invoices = vec![invoice_due_in(3)];
        let due = get_due(&invoices, OffsetDateTime::now_utc());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].rule.rule_id, "reminder_1");
    }

    #[test]
    fn already_fired_rule_is_not_due_again() {
        let mut invoice = invoice_due_in(0);
        invoice.reminder_log.push(collections_core::invoice::ReminderLogEntry {
            rule_id: "reminder_2".into(),
            sent_at: OffsetDateTime::now_utc(),
            template: "reminder_due".into(),
            outcome: collections_core::invoice::ReminderOutcome::Sent,
        });
        let due = get_due(&[invoice], OffsetDateTime::now_utc());
        assert!(due.is_empty());
    }

    #[test]
    fn paused_invoices_are_never_due() {
        let mut invoice = invoice_due_in(0);
        invoice.status = InvoiceStatus::Paused;
        let due = get_due(&[invoice], OffsetDateTime::now_utc());
        assert!(due.is_empty());
    }

    #[test]
    fn send_reminders_marks_log_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let mut invoice = invoice_due_in(0);
        s.write(&invoice, "created").unwrap();
        let ledger_path = tmp.path().join("ledger.md");

        let rate_limiter = RateLimiter::new(collections_ratelimit::RateLimitConfig::default());
        let backoff = ExponentialBackoff::default();
        let sender = RecordingSender { sent: Mutex::new(Vec::new()) };
        let mut invoices = vec![invoice.clone()];
        let report = send_reminders(&mut invoices, 20, &rate_limiter, &backoff, &sender, &s, &ledger_path, OffsetDateTime::now_utc()).unwrap();

        assert_eq!(report.sent, 1);
        assert!(invoices[0].has_fired("reminder_2"));
        invoice = s.read("ACME", "INV-001").unwrap().unwrap();
        assert!(invoice.has_fired("reminder_2"));
    }

    #[test]
    fn escalation_rule_archives_the_invoice() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let invoice = invoice_due_in(-14);
        s.write(&invoice, "created").unwrap();
        let ledger_path = tmp.path().join("ledger.md");
        Ledger::open(&ledger_path).unwrap().add("INV-001", invoice.amount, "ACME", None).unwrap();

        let rate_limiter = RateLimiter::new(collections_ratelimit::RateLimitConfig::default());
        let backoff = ExponentialBackoff::default();
        let sender = RecordingSender { sent: Mutex::new(Vec::new()) };
        let mut invoices = vec![invoice];
        let report = send_reminders(&mut invoices, 20, &rate_limiter, &backoff, &sender, &s, &ledger_path, OffsetDateTime::now_utc()).unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(invoices[0].status, InvoiceStatus::Escalated);
        assert!(tmp.path().join("state/archive/ACME/INV-001.json").exists());
        assert!(!tmp.path().join("state/ACME/INV-001.json").exists());
    }

    struct RateLimitedSender;
    impl MailSender for RateLimitedSender {
        fn send(&self, _msg: &ReminderMessage<'_>) -> Result<MessageId, SendOutcome> {
            Err(SendOutcome::RateLimited)
        }
    }

    #[test]
    fn transport_rate_limit_stops_the_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp);
        let invoice = invoice_due_in(0);
        s.write(&invoice, "created").unwrap();
        let ledger_path = tmp.path().join("ledger.md");

        let rate_limiter = RateLimiter::new(collections_ratelimit::RateLimitConfig::default());
        let backoff = ExponentialBackoff::default();
        let mut invoices = vec![invoice];
        let report = send_reminders(&mut invoices, 20, &rate_limiter, &backoff, &RateLimitedSender, &s, &ledger_path, OffsetDateTime::now_utc()).unwrap();

        assert_eq!(report.rate_limited, 1);
        assert_eq!(report.sent, 0);
        assert!(report.backoff_delay.is_some());
    }
}
