//! Invoice document ingestion (spec §4.9): extract structured fields from a
//! scanned document, score the extraction's confidence, and route the
//! result to auto-create / review / manual per spec §8's confidence law.
//!
//! Field patterns, weights, and routing thresholds are transcribed from
//! the original's `collections/pdf_parser.py` and `collections/invoice_scanner.py`.
//! Extraction itself (turning bytes into text + tables) is an injected
//! [`DocumentExtractor`], the same way the original takes a `pdf_parser`
//! instance rather than hardcoding `pdfplumber` calls inline.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use collections_core::{
    error::{Classify, ErrorKind},
    invoice::{ClientId, Invoice, InvoiceNumber, InvoiceStatus},
    paths::StateRoot,
};
use regex::Regex;
use ring::digest::{digest, SHA256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub const CONFIDENCE_AUTO: f64 = 0.95;
pub const CONFIDENCE_REVIEW: f64 = 0.85;

/// Raw text and tabular content pulled from a document. Production code
/// implements [`DocumentExtractor`] over a real PDF library; tests use a
/// fixture implementation.
#[derive(Clone, Debug, Default)]
pub struct ExtractedDocument {
    pub text: String,
    pub tables: Vec<Vec<Vec<String>>>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("failed to read document {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unreadable document format: {0}")]
    Unsupported(String),
}

/// The injected collaborator that turns a file on disk into text/tables
/// (spec §1's "swap the concrete PDF/OCR library without touching the
/// scoring logic").
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, ExtractError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub total: Decimal,
}

#[derive(Clone, Debug, Default)]
pub struct ParsedDocument {
    pub invoice_number: Option<String>,
    pub client_name: Option<String>,
    pub amount: Option<Decimal>,
    pub due_date: Option<OffsetDateTime>,
    pub items: Vec<LineItem>,
    pub confidence: f64,
    pub confidence_breakdown: Vec<(&'static str, f64)>,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize ingest record: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl Classify for IngestError {
    fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Extract(_) => ErrorKind::Transient,
            IngestError::Io { .. } => ErrorKind::Transient,
            IngestError::Serialize(_) => ErrorKind::Transient,
        }
    }
}

/// Where a parsed document was routed, per spec §8's confidence law.
#[derive(Clone, Debug)]
pub enum RouteOutcome {
    Auto { invoice: Box<Invoice> },
    Review { path: PathBuf },
    Manual { path: PathBuf },
}

struct FieldPattern {
    regex: Regex,
    weight: f64,
}

fn compile(pairs: &[(&str, f64)]) -> Vec<FieldPattern> {
    pairs
        .iter()
        .map(|(pattern, weight)| FieldPattern {
            regex: Regex::new(pattern).expect("static extraction pattern is valid regex"),
            weight: *weight,
        })
        .collect()
}

fn invoice_number_patterns() -> Vec<FieldPattern> {
    compile(&[
        (r"(?i)invoice\s*#?\s*:?\s*([A-Z0-9-]+)", 1.0),
        (r"(?i)factura\s*#?\s*:?\s*([A-Z0-9-]+)", 1.0),
        (r"(?i)INV-?([A-Z0-9-]+)", 0.90),
        (r"([A-Z]{2,}-\d{4,})", 0.85),
    ])
}

fn amount_patterns() -> Vec<FieldPattern> {
    compile(&[
        (r"(?i)total[:\s]*\$?([0-9,]+\.?\d*)", 1.0),
        (r"(?i)monto[:\s]*\$?([0-9,]+\.?\d*)", 1.0),
        (r"(?i)balance\s+due[:\s]*\$?([0-9,]+\.?\d*)", 0.95),
        (r"([0-9,]+\.\d{2})\s*(?:USD|COP|EUR)?", 0.90),
    ])
}

fn date_patterns() -> Vec<FieldPattern> {
    compile(&[
        (r"(?i)due\s*date[:\s]*(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})", 1.0),
        (r"(?i)fecha\s*de\s*vencimiento[:\s]*(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})", 1.0),
        (r"(\d{4}-\d{1,2}-\d{1,2})", 0.90),
        (r"(\d{1,2}\s+[A-Za-z]+\s+\d{4})", 0.85),
    ])
}

fn extract_field(text: &str, patterns: &[FieldPattern]) -> Option<(String, f64)> {
    for pattern in patterns {
        if let Some(caps) = pattern.regex.captures(text) {
            if let Some(m) = caps.get(1) {
                return Some((m.as_str().trim().to_owned(), pattern.weight));
            }
        }
    }
    None
}

fn extract_client_name(text: &str) -> Option<(String, f64)> {
    let block_patterns = [
        (r"(?is)bill\s+to\s*:?\s*\n(.+?)(?:\n|$)", 0.95),
        (r"(?is)client\s*:?\s*\n(.+?)(?:\n|$)", 0.95),
        (r"(?is)to\s*:?\s*\n(.+?)(?:\n|$)", 0.90),
    ];
    for (pattern, weight) in block_patterns {
        let re = Regex::new(pattern).expect("static client-name pattern is valid regex");
        if let Some(caps) = re.captures(text) {
            if let Some(m) = caps.get(1) {
                let value = m.as_str().lines().next().unwrap_or("").trim();
                if !value.is_empty() {
                    return Some((value.to_owned(), weight));
                }
            }
        }
    }

    let keywords = ["invoice", "factura", "date", "fecha", "total"];
    for line in text.lines().take(10) {
        let line = line.trim();
        if line.len() > 3 && !keywords.iter().any(|kw| line.to_lowercase().contains(kw)) {
            return Some((line.to_owned(), 0.75));
        }
    }
    None
}

fn extract_amount(text: &str) -> Option<(Decimal, f64)> {
    let (raw, weight) = extract_field(text, &amount_patterns())?;
    let cleaned = raw.replace(',', "").replace('$', "");
    cleaned.parse::<Decimal>().ok().map(|amount| (amount, weight))
}

const DATE_FORMATS: &[&str] = &[
    "[month padding:none]/[day padding:none]/[year]",
    "[day padding:none]/[month padding:none]/[year]",
    "[year]-[month padding:none]-[day padding:none]",
];

fn extract_due_date(text: &str) -> Option<(OffsetDateTime, f64)> {
    let (raw, weight) = extract_field(text, &date_patterns())?;
    for fmt in DATE_FORMATS {
        let Ok(desc) = time::format_description::parse(fmt) else { continue };
        if let Ok(date) = time::Date::parse(&raw, &desc) {
            return Some((date.midnight().assume_utc(), weight));
        }
    }
    None
}

fn extract_items(tables: &[Vec<Vec<String>>]) -> (Vec<LineItem>, f64) {
    let mut items = Vec::new();
    let mut hits = 0.0f64;
    for table in tables {
        let rows: &[Vec<String>] = if table.len() > 1 { &table[1..] } else { table };
        for row in rows {
            if row.len() < 3 {
                continue;
            }
            let parse_cell = |s: &str| s.replace(',', "").parse::<Decimal>().ok();
            let Some(total) = row.last().and_then(|s| parse_cell(s)) else { continue };
            let quantity = row.get(1).and_then(|s| parse_cell(s)).unwrap_or(Decimal::ONE);
            let price = row.get(2).and_then(|s| parse_cell(s)).unwrap_or(Decimal::ZERO);
            items.push(LineItem {
                description: row.first().cloned().unwrap_or_default(),
                quantity,
                price,
                total,
            });
            hits += 1.0;
        }
    }
    let confidence = if hits > 0.0 { (hits * 0.1).min(1.0) } else { 0.0 };
    (items, confidence)
}

struct FieldWeights {
    invoice_number: f64,
    client_name: f64,
    amount: f64,
    due_date: f64,
    items: f64,
}

impl Default for FieldWeights {
    fn default() -> Self {
        let raw = [0.30, 0.25, 0.30, 0.25, 0.10];
        let total: f64 = raw.iter().sum();
        let [invoice_number, client_name, amount, due_date, items] = raw.map(|w| w / total);
        Self {
            invoice_number,
            client_name,
            amount,
            due_date,
            items,
        }
    }
}

impl FieldWeights {
    fn weight_of(&self, field: &str) -> Option<f64> {
        match field {
            "invoice_number" => Some(self.invoice_number),
            "client_name" => Some(self.client_name),
            "amount" => Some(self.amount),
            "due_date" => Some(self.due_date),
            "items" => Some(self.items),
            _ => None,
        }
    }
}

fn overall_confidence(weights: &FieldWeights, breakdown: &[(&'static str, f64)]) -> f64 {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for (field, confidence) in breakdown {
        if *confidence > 0.0 {
            if let Some(weight) = weights.weight_of(field) {
                weighted_sum += confidence * weight;
                total_weight += weight;
            }
        }
    }
    if total_weight > 0.0 {
        weighted_sum / total_weight
    } else {
        0.0
    }
}

/// Parses a document's extracted text/tables into scored fields (spec §4.9).
pub fn parse_document(doc: &ExtractedDocument) -> ParsedDocument {
    let weights = FieldWeights::default();

    let invoice_number = extract_field(&doc.text, &invoice_number_patterns());
    let client_name = extract_client_name(&doc.text);
    let amount = extract_amount(&doc.text);
    let due_date = extract_due_date(&doc.text);
    let (items, items_confidence) = extract_items(&doc.tables);

    let breakdown: Vec<(&'static str, f64)> = vec![
        ("invoice_number", invoice_number.as_ref().map(|(_, c)| *c).unwrap_or(0.0)),
        ("client_name", client_name.as_ref().map(|(_, c)| *c).unwrap_or(0.0)),
        ("amount", amount.as_ref().map(|(_, c)| *c).unwrap_or(0.0)),
        ("due_date", due_date.as_ref().map(|(_, c)| *c).unwrap_or(0.0)),
        ("items", items_confidence),
    ];
    let confidence = overall_confidence(&weights, &breakdown);

    ParsedDocument {
        invoice_number: invoice_number.map(|(v, _)| v),
        client_name: client_name.map(|(v, _)| v),
        amount: amount.map(|(v, _)| v),
        due_date: due_date.map(|(v, _)| v),
        items,
        confidence,
        confidence_breakdown: breakdown,
    }
}

fn file_hash(path: &Path) -> Result<String, IngestError> {
    let bytes = std::fs::read(path).map_err(|e| IngestError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let d = digest(&SHA256, &bytes);
    Ok(d.as_ref().iter().map(|b| format!("{b:02x}")).collect())
}

/// Scans client subdirectories under `watch_dirs` for new documents, routes
/// each by confidence, and skips files whose content hash is already in
/// `known_files.json` (spec §4.9 + §8's single-ingest law).
pub struct DocumentIngestor {
    extractor: Arc<dyn DocumentExtractor>,
    roots: StateRoot,
}

impl DocumentIngestor {
    pub fn new(extractor: Arc<dyn DocumentExtractor>, roots: StateRoot) -> Self {
        Self { extractor, roots }
    }

    fn known_files(&self) -> Result<HashSet<String>, IngestError> {
        let path = self.roots.known_files_path();
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(IngestError::Serialize),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
            Err(e) => Err(IngestError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    fn save_known_files(&self, known: &HashSet<String>) -> Result<(), IngestError> {
        let path = self.roots.known_files_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IngestError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let bytes = serde_json::to_vec(&known.iter().collect::<Vec<_>>()).map_err(IngestError::Serialize)?;
        collections_core::atomic_file::write_atomic(&path, &bytes).map_err(|e| IngestError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Ingests a single document for `client`, returning `None` if its
    /// content hash was already seen.
    pub fn ingest(&self, client: &str, path: &Path) -> Result<Option<RouteOutcome>, IngestError> {
        let hash = file_hash(path)?;
        let mut known = self.known_files()?;
        if known.contains(&hash) {
            return Ok(None);
        }

        let extracted = self.extractor.extract(path)?;
        let parsed = parse_document(&extracted);

        let invoice_number = parsed.invoice_number.clone().unwrap_or_else(|| "unknown".to_owned());
        let outcome = if parsed.confidence >= CONFIDENCE_AUTO {
            let invoice = Invoice {
                client: ClientId::from(client),
                number: InvoiceNumber::from(invoice_number.as_str()),
                amount: parsed.amount.unwrap_or(Decimal::ZERO),
                due_date: parsed.due_date.unwrap_or_else(OffsetDateTime::now_utc),
                contact_email: String::new(),
                source_document_path: path.display().to_string(),
                confidence: parsed.confidence,
                status: InvoiceStatus::Unpaid,
                scanned_at: OffsetDateTime::now_utc(),
                paid_at: None,
                payment: None,
                reminder_log: Vec::new(),
            };
            RouteOutcome::Auto { invoice: Box::new(invoice) }
        } else if parsed.confidence >= CONFIDENCE_REVIEW {
            let review_path = self.roots.review_queue_path(&invoice_number);
            self.write_queue_record(&review_path, client, path, &parsed, "pending_review", None)?;
            RouteOutcome::Review { path: review_path }
        } else {
            let manual_path = self.roots.manual_path(&invoice_number);
            self.write_queue_record(
                &manual_path,
                client,
                path,
                &parsed,
                "manual_entry_required",
                Some(format!("low confidence ({:.2})", parsed.confidence)),
            )?;
            RouteOutcome::Manual { path: manual_path }
        };

        known.insert(hash);
        self.save_known_files(&known)?;
        Ok(Some(outcome))
    }

    fn write_queue_record(
        &self,
        path: &Path,
        client: &str,
        source: &Path,
        parsed: &ParsedDocument,
        status: &str,
        reason: Option<String>,
    ) -> Result<(), IngestError> {
        let record = serde_json::json!({
            "client": client,
            "invoice_number": parsed.invoice_number,
            "client_name": parsed.client_name,
            "amount": parsed.amount.map(|a| a.to_string()),
            "confidence": parsed.confidence,
            "source_document_path": source.display().to_string(),
            "timestamp": OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339).unwrap_or_default(),
            "reviewer": serde_json::Value::Null,
            "reason": reason,
            "status": status,
        });
        let bytes = serde_json::to_vec_pretty(&record).map_err(IngestError::Serialize)?;
        collections_core::atomic_file::write_atomic(path, &bytes).map_err(|e| IngestError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rust_decimal_macros::dec;

    struct FixtureExtractor {
        document: ExtractedDocument,
    }

    impl DocumentExtractor for FixtureExtractor {
        fn extract(&self, _path: &Path) -> Result<ExtractedDocument, ExtractError> {
            Ok(self.document.clone())
        }
    }

    fn high_confidence_text() -> String {
        "Bill To:\nAcme Corp\n\nInvoice #: INV-2026-001\nDue Date: 2026-08-15\nTotal: $1,500.00\n".to_owned()
    }

    #[test]
    fn high_confidence_document_parses_all_fields() {
        let doc = ExtractedDocument {
            text: high_confidence_text(),
            tables: vec![],
        };
        let parsed = parse_document(&doc);
        assert_eq!(parsed.invoice_number.as_deref(), Some("INV-2026-001"));
        assert_eq!(parsed.client_name.as_deref(), Some("Acme Corp"));
        assert_eq!(parsed.amount, Some(dec!(1500.00)));
        assert!(parsed.confidence > 0.95);
    }

    #[test]
    fn sparse_document_scores_low_confidence() {
        let doc = ExtractedDocument {
            text: "some unrelated text with no structured fields".to_owned(),
            tables: vec![],
        };
        let parsed = parse_document(&doc);
        assert!(parsed.confidence < CONFIDENCE_REVIEW);
    }

    #[test]
    fn ingest_routes_high_confidence_to_auto() {
        let tmp = tempfile::tempdir().unwrap();
        let roots = StateRoot {
            cache_root: tmp.path().join("cache"),
            state_root: tmp.path().join("state"),
        };
        collections_core::paths::ensure_layout(&roots).unwrap();
        let pdf_path = tmp.path().join("INV-2026-001.pdf");
        std::fs::write(&pdf_path, b"%PDF-fixture").unwrap();

        let extractor = Arc::new(FixtureExtractor {
            document: ExtractedDocument {
                text: high_confidence_text(),
                tables: vec![],
            },
        });
        let ingestor = DocumentIngestor::new(extractor, roots);
        let outcome = ingestor.ingest("ACME", &pdf_path).unwrap().unwrap();
        assert!(matches!(outcome, RouteOutcome::Auto { .. }));
    }

    #[test]
    fn ingest_skips_already_known_file() {
        let tmp = tempfile::tempdir().unwrap();
        let roots = StateRoot {
            cache_root: tmp.path().join("cache"),
            state_root: tmp.path().join("state"),
        };
        collections_core::paths::ensure_layout(&roots).unwrap();
        let pdf_path = tmp.path().join("INV-2026-001.pdf");
        std::fs::write(&pdf_path, b"%PDF-fixture").unwrap();

        let extractor = Arc::new(FixtureExtractor {
            document: ExtractedDocument {
                text: high_confidence_text(),
                tables: vec![],
            },
        });
        let ingestor = DocumentIngestor::new(extractor, roots);
        assert!(ingestor.ingest("ACME", &pdf_path).unwrap().is_some());
        assert!(ingestor.ingest("ACME", &pdf_path).unwrap().is_none());
    }

    #[test]
    fn low_confidence_document_routes_to_manual() {
        let tmp = tempfile::tempdir().unwrap();
        let roots = StateRoot {
            cache_root: tmp.path().join("cache"),
            state_root: tmp.path().join("state"),
        };
        collections_core::paths::ensure_layout(&roots).unwrap();
        let pdf_path = tmp.path().join("mystery.pdf");
        std::fs::write(&pdf_path, b"%PDF-fixture").unwrap();

        let extractor = Arc::new(FixtureExtractor {
            document: ExtractedDocument {
                text: "no structured fields here".to_owned(),
                tables: vec![],
            },
        });
        let ingestor = DocumentIngestor::new(extractor, roots);
        let outcome = ingestor.ingest("ACME", &pdf_path).unwrap().unwrap();
        assert!(matches!(outcome, RouteOutcome::Manual { .. }));
    }
}
