//! The error taxonomy shared across every component (spec §7).
//!
//! Individual components define their own `thiserror` error enums at their
//! boundary (e.g. `collections_auth::Error`, `collections_state::Error`);
//! this module defines the [`ErrorKind`] they classify into, so that
//! supervisors and CLI front-ends can match on kind without needing to know
//! every concrete error type.

use std::fmt;

use thiserror::Error;

/// Coarse error classification. Every concrete error in the workspace maps
/// to exactly one of these via [`Classify::kind`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Network timeout, 5xx, rate-limited: retried locally with backoff.
    Transient,
    /// Explicit 429 or local bucket exhausted: stop batch, resume next cycle.
    RateLimited,
    /// No token configured for an account: fail fast, surface to operator.
    AuthMissing,
    /// A refresh attempt failed once; further retries still permitted.
    AuthExpired,
    /// Refresh has failed enough times to trip the process-wide latch.
    DegradedMode,
    /// Checksum mismatch or unparseable state.
    StateCorruption,
    /// Ledger/state reconciliation mismatch.
    LedgerInconsistent,
    /// Filesystem EACCES or similar.
    PermissionDenied,
    /// Insertion collided with an existing key.
    DuplicateInvoice,
    /// Ingestor confidence below the `manual` threshold; not an error.
    ParseLowConfidence,
}

impl ErrorKind {
    /// Whether this kind warrants an escalation per spec §7's policy
    /// (`DegradedMode`, `StateCorruption`, or repeated heartbeat misses).
    pub fn escalates(self) -> bool {
        matches!(self, ErrorKind::DegradedMode | ErrorKind::StateCorruption)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::AuthMissing => "auth_missing",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::DegradedMode => "degraded_mode",
            ErrorKind::StateCorruption => "state_corruption",
            ErrorKind::LedgerInconsistent => "ledger_inconsistent",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::DuplicateInvoice => "duplicate_invoice",
            ErrorKind::ParseLowConfidence => "parse_low_confidence",
        };
        f.write_str(s)
    }
}

/// Implemented by every component-level error enum so it can be classified
/// without downcasting.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Generic filesystem-adjacent error shared by the persistence-heavy
/// components (C5-C8). Individual crates re-export or wrap this rather than
/// redefining `io::Error` handling five times over.
#[derive(Debug, Error)]
pub enum IoKindError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("permission denied at {path}")]
    PermissionDenied { path: String },
}

impl IoKindError {
    pub fn from_io(path: impl Into<String>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            IoKindError::PermissionDenied { path }
        } else {
            IoKindError::Io { path, source }
        }
    }
}

impl Classify for IoKindError {
    fn kind(&self) -> ErrorKind {
        match self {
            IoKindError::Io { .. } => ErrorKind::Transient,
            IoKindError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn degraded_and_corruption_escalate() {
        assert!(ErrorKind::DegradedMode.escalates());
        assert!(ErrorKind::StateCorruption.escalates());
        assert!(!ErrorKind::Transient.escalates());
        assert!(!ErrorKind::ParseLowConfidence.escalates());
    }
}
