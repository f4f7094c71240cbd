//! The Markdown collections ledger (spec §4.7): three tracked sections
//! (`Unpaid`, `Paid`, `Escalated`) plus a `Summary` of running totals.
//!
//! Rather than splice lines into the file in place (the original's
//! `_append_to_section`/`_update_totals` approach, which is one stray
//! string match away from corrupting the file), the whole document is
//! rebuilt from an in-memory model and rewritten atomically on every
//! mutation — the same full-state-rewrite discipline the teacher uses for
//! `KeeperState::save`. The on-disk grammar is unchanged from the
//! original's.

use std::{
    fs,
    path::{Path, PathBuf},
};

use collections_core::atomic_file::write_atomic;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invoice {0} already exists in the ledger")]
    AlreadyExists(String),
    #[error("invoice {0} not found in the unpaid section")]
    NotUnpaid(String),
    #[error("failed to serialize export: {0}")]
    Export(#[source] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnpaidEntry {
    pub invoice_number: String,
    pub amount: Decimal,
    pub client: String,
    pub due_date: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaidEntry {
    pub invoice_number: String,
    pub amount: Decimal,
    pub paid_date: Option<String>,
    pub payment_method: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalatedEntry {
    pub invoice_number: String,
    pub amount: Decimal,
    pub reason: String,
    pub escalated_date: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct Summary {
    pub unpaid_total: Decimal,
    pub paid_total: Decimal,
    pub escalated_total: Decimal,
    pub grand_total: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileResult {
    pub passed: bool,
    pub state_total: Decimal,
    pub ledger_total: Decimal,
    pub discrepancy: Decimal,
    pub state_count: usize,
    pub auto_fixed: bool,
}

pub struct Ledger {
    path: PathBuf,
    unpaid: Vec<UnpaidEntry>,
    paid: Vec<PaidEntry>,
    escalated: Vec<EscalatedEntry>,
}

impl Ledger {
    /// Opens `path`, creating an empty ledger document if absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| LedgerError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        if !path.exists() {
            let mut ledger = Self {
                path: path.clone(),
                unpaid: Vec::new(),
                paid: Vec::new(),
                escalated: Vec::new(),
            };
            ledger.flush()?;
            return Ok(ledger);
        }

        let content = fs::read_to_string(&path).map_err(|e| LedgerError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let (unpaid, paid, escalated) = parse_sections(&content);
        Ok(Self {
            path,
            unpaid,
            paid,
            escalated,
        })
    }

    fn exists_anywhere(&self, invoice_number: &str) -> bool {
        self.unpaid.iter().any(|e| e.invoice_number == invoice_number)
            || self.paid.iter().any(|e| e.invoice_number == invoice_number)
            || self.escalated.iter().any(|e| e.invoice_number == invoice_number)
    }

    /// Adds an invoice to the Unpaid section.
    pub fn add(&mut self, invoice_number: &str, amount: Decimal, client: &str, due_date: Option<&str>) -> Result<(), LedgerError> {
        if self.exists_anywhere(invoice_number) {
            return Err(LedgerError::AlreadyExists(invoice_number.to_owned()));
        }
        self.unpaid.push(UnpaidEntry {
            invoice_number: invoice_number.to_owned(),
            amount,
            client: client.to_owned(),
            due_date: due_date.map(str::to_owned),
        });
        self.flush()
    }

    /// Moves an invoice from Unpaid to Paid.
    pub fn mark_paid(&mut self, invoice_number: &str, paid_date: Option<&str>, payment_method: Option<&str>) -> Result<(), LedgerError> {
        let idx = self
            .unpaid
            .iter()
            .position(|e| e.invoice_number == invoice_number)
            .ok_or_else(|| LedgerError::NotUnpaid(invoice_number.to_owned()))?;
        let removed = self.unpaid.remove(idx);
        self.paid.push(PaidEntry {
            invoice_number: removed.invoice_number,
            amount: removed.amount,
            paid_date: paid_date.map(str::to_owned),
            payment_method: payment_method.map(str::to_owned),
        });
        self.flush()
    }

    /// Moves an invoice from Unpaid to Escalated.
    pub fn escalate(&mut self, invoice_number: &str, reason: &str, escalated_date: Option<&str>) -> Result<(), LedgerError> {
        let idx = self
            .unpaid
            .iter()
            .position(|e| e.invoice_number == invoice_number)
            .ok_or_else(|| LedgerError::NotUnpaid(invoice_number.to_owned()))?;
        let removed = self.unpaid.remove(idx);
        self.escalated.push(EscalatedEntry {
            invoice_number: removed.invoice_number,
            amount: removed.amount,
            reason: reason.to_owned(),
            escalated_date: escalated_date.map(str::to_owned),
        });
        self.flush()
    }

    pub fn get_summary(&self) -> Summary {
        let unpaid_total = self.unpaid.iter().map(|e| e.amount).sum();
        let paid_total = self.paid.iter().map(|e| e.amount).sum();
        let escalated_total = self.escalated.iter().map(|e| e.amount).sum();
        Summary {
            unpaid_total,
            paid_total,
            escalated_total,
            grand_total: unpaid_total + paid_total + escalated_total,
        }
    }

    pub fn get_all_unpaid(&self) -> &[UnpaidEntry] {
        &self.unpaid
    }

    /// Sums `amount` for every non-archived state file whose `status` is
    /// `unpaid` or `pending`, compares it to the ledger's unpaid total, and
    /// (on `auto_fix`) rewrites the Unpaid section from those state files —
    /// matching the original's resolved scope (Paid/Escalated are never
    /// auto-fixed; see the design ledger for why).
    pub fn reconcile(&mut self, state_dir: impl AsRef<Path>, auto_fix: bool) -> Result<ReconcileResult, LedgerError> {
        let state_dir = state_dir.as_ref();
        let mut state_total = Decimal::ZERO;
        let mut state_count = 0usize;
        let mut unpaid_from_state: Vec<UnpaidEntry> = Vec::new();

        if state_dir.exists() {
            for entry in walk_json_files(state_dir) {
                if entry
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n == "archive")
                    .unwrap_or(false)
                {
                    continue;
                }
                let Ok(raw) = fs::read_to_string(&entry) else { continue };
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else { continue };
                let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("");
                if status == "unpaid" || status == "pending" {
                    let amount = value
                        .get("amount")
                        .and_then(|v| v.as_str().and_then(|s| s.parse::<Decimal>().ok()).or_else(|| v.as_f64().and_then(Decimal::from_f64_retain)))
                        .unwrap_or(Decimal::ZERO);
                    state_total += amount;
                    state_count += 1;
                    unpaid_from_state.push(UnpaidEntry {
                        invoice_number: value.get("number").and_then(|v| v.as_str()).unwrap_or_default().to_owned(),
                        amount,
                        client: value.get("client").and_then(|v| v.as_str()).unwrap_or("Unknown").to_owned(),
                        due_date: None,
                    });
                }
            }
        }

        let ledger_total = self.get_summary().unpaid_total;
        let discrepancy = (state_total - ledger_total).abs();
        let passed = discrepancy < Decimal::new(1, 2);

        let mut auto_fixed = false;
        if auto_fix && !passed {
            self.unpaid = unpaid_from_state;
            self.flush()?;
            auto_fixed = true;
        }

        Ok(ReconcileResult {
            passed,
            state_total,
            ledger_total,
            discrepancy,
            state_count,
            auto_fixed,
        })
    }

    pub fn export_json(&self, output_path: impl AsRef<Path>) -> Result<(), LedgerError> {
        #[derive(Serialize)]
        struct UnpaidEntrySer<'a> {
            invoice_number: &'a str,
            amount: Decimal,
            client: &'a str,
            due_date: Option<&'a str>,
        }
        let export = serde_json::json!({
            "summary": self.get_summary(),
            "unpaid": self.unpaid.iter().map(|e| UnpaidEntrySer {
                invoice_number: &e.invoice_number,
                amount: e.amount,
                client: &e.client,
                due_date: e.due_date.as_deref(),
            }).collect::<Vec<_>>(),
        });
        let bytes = serde_json::to_vec_pretty(&export).map_err(LedgerError::Export)?;
        write_atomic(output_path.as_ref(), &bytes).map_err(|e| LedgerError::Io {
            path: output_path.as_ref().display().to_string(),
            source: e,
        })
    }

    fn flush(&mut self) -> Result<(), LedgerError> {
        let content = render(&self.unpaid, &self.paid, &self.escalated);
        write_atomic(&self.path, content.as_bytes()).map_err(|e| LedgerError::Io {
            path: self.path.display().to_string(),
            source: e,
        })
    }
}

fn money(amount: Decimal) -> String {
    let rounded = amount.round_dp(2);
    let s = rounded.to_string();
    let (int_part, frac_part) = s.split_once('.').unwrap_or((s.as_str(), "00"));
    let (sign, digits) = int_part.strip_prefix('-').map(|d| ("-", d)).unwrap_or(("", int_part));
    let mut grouped = String::new();
    for (i, c) in digits.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let grouped: String = grouped.chars().rev().collect();
    format!("{sign}{grouped}.{frac_part:0<2}")
}

fn render(unpaid: &[UnpaidEntry], paid: &[PaidEntry], escalated: &[EscalatedEntry]) -> String {
    let mut out = String::from("# Collections Ledger\n\n## Unpaid\n");
    for e in unpaid {
        out.push_str(&format!("- `{}` | ${} | {}", e.invoice_number, money(e.amount), e.client));
        if let Some(due) = &e.due_date {
            out.push_str(&format!(" | Due: {due}"));
        }
        out.push_str(" | Status: unpaid\n");
    }
    out.push_str("\n## Paid\n");
    for e in paid {
        out.push_str(&format!("- `{}` | ${}", e.invoice_number, money(e.amount)));
        if let Some(d) = &e.paid_date {
            out.push_str(&format!(" | Paid: {d}"));
        }
        if let Some(m) = &e.payment_method {
            out.push_str(&format!(" | Method: {m}"));
        }
        out.push_str(" | Status: paid\n");
    }
    out.push_str("\n## Escalated\n");
    for e in escalated {
        out.push_str(&format!("- `{}` | ${} | {}", e.invoice_number, money(e.amount), e.reason));
        if let Some(d) = &e.escalated_date {
            out.push_str(&format!(" | Escalated: {d}"));
        }
        out.push_str(" | Status: escalated\n");
    }

    let unpaid_total: Decimal = unpaid.iter().map(|e| e.amount).sum();
    let paid_total: Decimal = paid.iter().map(|e| e.amount).sum();
    let escalated_total: Decimal = escalated.iter().map(|e| e.amount).sum();
    let grand_total = unpaid_total + paid_total + escalated_total;

    out.push_str("\n## Summary\n");
    out.push_str(&format!("- **Unpaid Total:** ${}\n", money(unpaid_total)));
    out.push_str(&format!("- **Paid Total:** ${}\n", money(paid_total)));
    out.push_str(&format!("- **Escalated Total:** ${}\n", money(escalated_total)));
    out.push_str(&format!("- **Grand Total:** ${}\n", money(grand_total)));
    out
}

fn entry_regex() -> Regex {
    Regex::new(r"^- `([^`]+)` \| \$([\d,]+\.\d{2})(.*)$").expect("static pattern is valid regex")
}

fn parse_sections(content: &str) -> (Vec<UnpaidEntry>, Vec<PaidEntry>, Vec<EscalatedEntry>) {
    let re = entry_regex();
    let mut unpaid = Vec::new();
    let mut paid = Vec::new();
    let mut escalated = Vec::new();
    let mut section = "";

    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(header) = trimmed.strip_prefix("## ") {
            section = match header {
                "Unpaid" => "unpaid",
                "Paid" => "paid",
                "Escalated" => "escalated",
                _ => "",
            };
            continue;
        }
        let Some(caps) = re.captures(trimmed) else { continue };
        let invoice_number = caps[1].to_owned();
        let amount: Decimal = caps[2].replace(',', "").parse().unwrap_or(Decimal::ZERO);
        let rest = &caps[3];

        match section {
            "unpaid" => {
                let client = rest
                    .split('|')
                    .nth(1)
                    .map(|s| s.trim())
                    .unwrap_or_default()
                    .to_owned();
                let due_date = extract_field(rest, "Due");
                unpaid.push(UnpaidEntry {
                    invoice_number,
                    amount,
                    client,
                    due_date,
                });
            }
            "paid" => {
                paid.push(PaidEntry {
                    invoice_number,
                    amount,
                    paid_date: extract_field(rest, "Paid"),
                    payment_method: extract_field(rest, "Method"),
                });
            }
            "escalated" => {
                let reason = rest
                    .split('|')
                    .nth(1)
                    .map(|s| s.trim())
                    .unwrap_or_default()
                    .to_owned();
                escalated.push(EscalatedEntry {
                    invoice_number,
                    amount,
                    reason,
                    escalated_date: extract_field(rest, "Escalated"),
                });
            }
            _ => {}
        }
    }

    (unpaid, paid, escalated)
}

fn extract_field(rest: &str, label: &str) -> Option<String> {
    rest.split('|').find_map(|segment| {
        let segment = segment.trim();
        segment.strip_prefix(&format!("{label}: ")).map(str::to_owned)
    })
}

fn walk_json_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else { return out };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_json_files(&path));
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            out.push(path);
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn add_then_mark_paid_updates_totals() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::open(tmp.path().join("collections.ledger")).unwrap();
        ledger.add("INV-001", dec!(1500.00), "ACME", Some("2026-08-01")).unwrap();
        assert_eq!(ledger.get_summary().unpaid_total, dec!(1500.00));

        ledger.mark_paid("INV-001", Some("2026-07-28"), Some("transfer")).unwrap();
        let summary = ledger.get_summary();
        assert_eq!(summary.unpaid_total, dec!(0));
        assert_eq!(summary.paid_total, dec!(1500.00));
        assert_eq!(summary.grand_total, dec!(1500.00));
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::open(tmp.path().join("collections.ledger")).unwrap();
        ledger.add("INV-001", dec!(100), "ACME", None).unwrap();
        let err = ledger.add("INV-001", dec!(200), "ACME", None).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists(_)));
    }

    #[test]
    fn escalate_moves_out_of_unpaid() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::open(tmp.path().join("collections.ledger")).unwrap();
        ledger.add("INV-002", dec!(300), "WidgetCo", None).unwrap();
        ledger.escalate("INV-002", "no response after 14 days", Some("2026-08-10")).unwrap();
        assert!(ledger.get_all_unpaid().is_empty());
        assert_eq!(ledger.get_summary().escalated_total, dec!(300));
    }

    #[test]
    fn reopen_parses_persisted_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("collections.ledger");
        {
            let mut ledger = Ledger::open(&path).unwrap();
            ledger.add("INV-003", dec!(1234.5), "ACME", Some("2026-09-01")).unwrap();
        }
        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.get_all_unpaid().len(), 1);
        assert_eq!(reopened.get_all_unpaid()[0].amount, dec!(1234.50));
        assert_eq!(reopened.get_all_unpaid()[0].client, "ACME");
        assert_eq!(reopened.get_all_unpaid()[0].due_date.as_deref(), Some("2026-09-01"));
    }

    #[test]
    fn reconcile_detects_discrepancy_and_auto_fixes() {
        let tmp = tempfile::tempdir().unwrap();
        let state_dir = tmp.path().join("state/ACME");
        fs::create_dir_all(&state_dir).unwrap();
        fs::write(
            state_dir.join("INV-100.json"),
            r#"{"number":"INV-100","client":"ACME","amount":"500.00","status":"unpaid"}"#,
        )
        .unwrap();

        let mut ledger = Ledger::open(tmp.path().join("collections.ledger")).unwrap();
        ledger.add("INV-999", dec!(1.00), "Ghost", None).unwrap();

        let result = ledger.reconcile(tmp.path().join("state"), false).unwrap();
        assert!(!result.passed);
        assert_eq!(result.state_count, 1);

        let fixed = ledger.reconcile(tmp.path().join("state"), true).unwrap();
        assert!(fixed.auto_fixed);
        assert_eq!(ledger.get_all_unpaid().len(), 1);
        assert_eq!(ledger.get_all_unpaid()[0].invoice_number, "INV-100");
    }

    #[test]
    fn money_formats_with_thousands_separator() {
        assert_eq!(money(dec!(1234567.5)), "1,234,567.50");
        assert_eq!(money(dec!(0)), "0.00");
    }
}
