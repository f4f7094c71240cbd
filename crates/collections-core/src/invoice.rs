//! The `Invoice` aggregate (spec §3) shared by every component that reads
//! or writes invoice state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

/// A client identifier. Newtype over `String` rather than a bare `String`
/// so call sites can't accidentally swap it with an invoice number.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(s.to_owned())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An invoice number. Newtype for the same reason as [`ClientId`].
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceNumber(pub String);

impl InvoiceNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InvoiceNumber {
    fn from(s: &str) -> Self {
        InvoiceNumber(s.to_owned())
    }
}

impl std::fmt::Display for InvoiceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The canonical `(client, number)` key of an invoice.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct InvoiceKey {
    pub client: ClientId,
    pub number: InvoiceNumber,
}

impl InvoiceKey {
    pub fn new(client: impl Into<ClientId>, number: impl Into<InvoiceNumber>) -> Self {
        Self {
            client: client.into(),
            number: number.into(),
        }
    }
}

impl std::fmt::Display for InvoiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.client, self.number)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Unpaid,
    InReview,
    Paid,
    Escalated,
    Paused,
}

impl InvoiceStatus {
    /// `paid` and `escalated` are terminal (spec §3).
    pub fn is_terminal(self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Escalated)
    }
}

/// Payment evidence attached to a paid invoice (spec §3).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub method: String,
    pub amount: Decimal,
    pub source_file: String,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
}

/// The outcome of a single reminder send attempt, recorded in
/// `reminder_log` (spec §3, §4.10).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderOutcome {
    Sent,
    Failed,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReminderLogEntry {
    pub rule_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    pub template: String,
    pub outcome: ReminderOutcome,
}

/// The canonical Invoice aggregate (spec §3).
///
/// Invariant: `status == Paid` implies `paid_at.is_some() && payment.is_some()`.
/// Enforced by [`Invoice::mark_paid`] rather than at the type level, since
/// the on-disk representation must round-trip through serde regardless of
/// which fields happen to be populated during intermediate states.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Invoice {
    pub client: ClientId,
    pub number: InvoiceNumber,
    pub amount: Decimal,
    #[serde(with = "time::serde::iso8601")]
    pub due_date: OffsetDateTime,
    pub contact_email: String,
    pub source_document_path: String,
    pub confidence: f64,
    pub status: InvoiceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub scanned_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub payment: Option<Payment>,
    #[serde(default)]
    pub reminder_log: Vec<ReminderLogEntry>,
}

impl Invoice {
    pub fn key(&self) -> InvoiceKey {
        InvoiceKey {
            client: self.client.clone(),
            number: self.number.clone(),
        }
    }

    /// Calendar-day due date, dropping the time component, for reminder
    /// rule matching (spec §4.10 operates on whole days).
    pub fn due_day(&self) -> Date {
        self.due_date.date()
    }

    /// Whether `rule_id` has already fired for this invoice (spec §4.10's
    /// idempotence guarantee: a rule fires at most once per invoice).
    pub fn has_fired(&self, rule_id: &str) -> bool {
        self.reminder_log.iter().any(|e| e.rule_id == rule_id)
    }

    /// Applies the mark-paid transition in memory. Archival/persistence is
    /// the caller's (C6's) responsibility; this only maintains the
    /// `status=paid ⇒ paid_at ∧ payment` invariant.
    pub fn apply_paid(&mut self, payment: Payment, at: OffsetDateTime) {
        self.status = InvoiceStatus::Paid;
        self.paid_at = Some(at);
        self.payment = Some(payment);
    }

    pub fn apply_escalated(&mut self) {
        self.status = InvoiceStatus::Escalated;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn has_fired_checks_rule_id_only() {
        let mut inv = sample_invoice();
        assert!(!inv.has_fired("reminder_1"));
        inv.reminder_log.push(ReminderLogEntry {
            rule_id: "reminder_1".into(),
            sent_at: OffsetDateTime::now_utc(),
            template: "reminder_3d".into(),
            outcome: ReminderOutcome::Sent,
        });
        assert!(inv.has_fired("reminder_1"));
        assert!(!inv.has_fired("reminder_2"));
    }

    #[test]
    fn apply_paid_maintains_invariant() {
        let mut inv = sample_invoice();
        let now = OffsetDateTime::now_utc();
        inv.apply_paid(
            Payment {
                method: "transfer".into(),
                amount: dec!(1500.00),
                source_file: "pagado_INV-001.pdf".into(),
                detected_at: now,
            },
            now,
        );
        assert_eq!(inv.status, InvoiceStatus::Paid);
        assert!(inv.paid_at.is_some());
        assert!(inv.payment.is_some());
    }

    fn sample_invoice() -> Invoice {
        Invoice {
            client: "ACME".into(),
            number: "INV-001".into(),
            amount: dec!(1500.00),
            due_date: OffsetDateTime::now_utc(),
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
}
