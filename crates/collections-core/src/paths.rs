//! On-disk layout (spec §6): a per-user cache root for transient/queue
//! files and a per-user data root for the durable invoice state tree.
//! Every path can be overridden independently, so a single `--config`
//! file (or environment variable) can relocate any one of them without
//! disturbing the others.

use std::path::{Path, PathBuf};

/// Resolved roots for a running agent. Construct via [`StateRoot::resolve`],
/// which applies the `$HOME`-relative defaults and any overrides.
#[derive(Clone, Debug)]
pub struct StateRoot {
    /// `$HOME/.cache/novotechno-collections/` by default.
    pub cache_root: PathBuf,
    /// `$HOME/.local/share/novotechno-collections/state/` by default.
    pub state_root: PathBuf,
}

impl StateRoot {
    /// Resolves roots from explicit overrides, falling back to the
    /// `$HOME`-relative defaults from spec §6.
    pub fn resolve(cache_override: Option<PathBuf>, state_override: Option<PathBuf>) -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let cache_root = cache_override.unwrap_or_else(|| {
            home.clone()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".cache/novotechno-collections")
        });
        let state_root = state_override.unwrap_or_else(|| {
            home.unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share/novotechno-collections/state")
        });
        Self {
            cache_root,
            state_root,
        }
    }

    /// `state/{client}/{invoice_number}.json`
    pub fn invoice_path(&self, client: &str, invoice_number: &str) -> PathBuf {
        self.state_root.join(client).join(format!("{invoice_number}.json"))
    }

    /// `state/archive/{client}/{invoice_number}.json`
    pub fn archive_path(&self, client: &str, invoice_number: &str) -> PathBuf {
        self.state_root
            .join("archive")
            .join(client)
            .join(format!("{invoice_number}.json"))
    }

    /// `state/review_queue/{invoice_number}.json`
    pub fn review_queue_path(&self, invoice_number: &str) -> PathBuf {
        self.state_root
            .join("review_queue")
            .join(format!("{invoice_number}.json"))
    }

    /// `state/manual/{invoice_number}.json`
    pub fn manual_path(&self, invoice_number: &str) -> PathBuf {
        self.state_root
            .join("manual")
            .join(format!("{invoice_number}.json"))
    }

    /// `events.log`, relative to the cache root.
    pub fn event_log_path(&self) -> PathBuf {
        self.cache_root.join("events.log")
    }

    /// `queues/{recipient}.jsonl`
    pub fn mailbox_path(&self, recipient: &str) -> PathBuf {
        self.cache_root.join("queues").join(format!("{recipient}.jsonl"))
    }

    /// `queues/dedupe_{hash}.json`
    pub fn dedupe_marker_path(&self, hash: &str) -> PathBuf {
        self.cache_root
            .join("queues")
            .join(format!("dedupe_{hash}.json"))
    }

    /// `known_files.json`
    pub fn known_files_path(&self) -> PathBuf {
        self.cache_root.join("known_files.json")
    }

    /// `heartbeats/{agent}.log`
    pub fn heartbeat_path(&self, agent: &str) -> PathBuf {
        self.cache_root.join("heartbeats").join(format!("{agent}.log"))
    }

    /// `collections.ledger`
    pub fn ledger_path(&self) -> PathBuf {
        self.cache_root.join("collections.ledger")
    }

    /// `escalations.log`, appended to on every escalation (spec §7).
    pub fn escalation_log_path(&self) -> PathBuf {
        self.cache_root.join("escalations.log")
    }
}

/// Ensures every directory in the layout exists (idempotent, created with
/// `0700` where the platform supports it, since the tree holds financial
/// records and tokens).
pub fn ensure_layout(root: &StateRoot) -> std::io::Result<()> {
    for dir in [
        root.cache_root.join("queues"),
        root.cache_root.join("heartbeats"),
        root.state_root.join("archive"),
        root.state_root.join("review_queue"),
        root.state_root.join("manual"),
    ] {
        create_private_dir_all(&dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_private_dir_all(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir_all(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invoice_path_layout() {
        let root = StateRoot {
            cache_root: PathBuf::from("/tmp/cache"),
            state_root: PathBuf::from("/tmp/state"),
        };
        assert_eq!(
            root.invoice_path("ACME", "INV-001"),
            PathBuf::from("/tmp/state/ACME/INV-001.json")
        );
        assert_eq!(
            root.archive_path("ACME", "INV-001"),
            PathBuf::from("/tmp/state/archive/ACME/INV-001.json")
        );
        assert_eq!(
            root.mailbox_path("emailer"),
            PathBuf::from("/tmp/cache/queues/emailer.jsonl")
        );
    }

    #[test]
    fn ensure_layout_creates_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = StateRoot {
            cache_root: tmp.path().join("cache"),
            state_root: tmp.path().join("state"),
        };
        ensure_layout(&root).unwrap();
        assert!(root.cache_root.join("queues").is_dir());
        assert!(root.state_root.join("review_queue").is_dir());
    }
}
