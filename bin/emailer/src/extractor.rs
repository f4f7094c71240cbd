//! [`DocumentExtractor`] backend for this binary.
//!
//! No PDF-handling crate appears anywhere in this workspace's dependency
//! corpus, so this reads the document as UTF-8 text rather than fabricating
//! a PDF dependency the rest of the codebase never reaches for. It parses
//! plain-text and already-OCR'd invoice dumps correctly; against a real
//! `%PDF-` binary it extracts whatever ASCII happens to survive lossy
//! decoding, which is usually little. Swapping in a real PDF/OCR backend
//! only requires a new [`DocumentExtractor`] impl — the scoring and routing
//! logic in `collections-ingest` never changes.
use std::path::Path;

use collections_ingest::{DocumentExtractor, ExtractedDocument, ExtractError};

pub struct PlainTextExtractor;

impl DocumentExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, ExtractError> {
        let bytes = std::fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExtractError::NotFound(path.display().to_string())
            } else {
                ExtractError::Io {
                    path: path.display().to_string(),
                    source: e,
                }
            }
        })?;

        let text = String::from_utf8(bytes).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), "document is not valid UTF-8; extracting lossily");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        });

        Ok(ExtractedDocument { text, tables: Vec::new() })
    }
}
