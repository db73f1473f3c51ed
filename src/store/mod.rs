// src/store/mod.rs — Versioned, snapshot-capable view over the target files

pub mod backend;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::action::EditOp;
use crate::core::types::ActionRecord;
use crate::infra::errors::{EngineError, EngineResult};
use self::backend::FileBackend;

/// Immutable, content-addressed capture of all tracked files at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub id: String,
    pub iteration: u32,
    pub files: BTreeMap<String, String>,
}

/// The engine's working view of the target system's editable files.
///
/// Tracked content is authoritative; every mutation writes through to the
/// backend and appends one entry to the current iteration's action log.
/// Mutations apply strictly in the order actions were issued.
pub struct FileStore {
    backend: Arc<dyn FileBackend>,
    tracked: BTreeMap<String, String>,
    snapshots: Vec<FileSnapshot>,
    retention: usize,
    log: Vec<ActionRecord>,
}

impl FileStore {
    pub fn new(backend: Arc<dyn FileBackend>, retention: usize) -> Self {
        Self {
            backend,
            tracked: BTreeMap::new(),
            snapshots: Vec::new(),
            retention,
            log: Vec::new(),
        }
    }

    /// Pull a file into the tracked set without logging a mutation.
    /// Used at session start for the breakdown's key files.
    pub async fn track(&mut self, path: &str) -> EngineResult<()> {
        if self.tracked.contains_key(path) {
            return Ok(());
        }
        match self.backend.load(path).await.map_err(io_fatal)? {
            Some(content) => {
                self.tracked.insert(path.to_string(), content);
                Ok(())
            }
            None => Err(EngineError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    pub async fn read(&mut self, path: &str) -> EngineResult<String> {
        self.track(path).await?;
        Ok(self.tracked[path].clone())
    }

    pub async fn write(&mut self, path: &str, content: &str) -> EngineResult<()> {
        self.backend.store(path, content).await.map_err(io_fatal)?;
        self.tracked.insert(path.to_string(), content.to_string());
        self.log.push(ActionRecord::new(
            "write",
            path,
            format!("wrote {} bytes", content.len()),
        ));
        Ok(())
    }

    /// Replace `old` with `new`; `old` must occur exactly once.
    pub async fn edit(&mut self, path: &str, old: &str, new: &str) -> EngineResult<()> {
        let content = self.read(path).await?;
        let replaced = replace_exactly_once(path, &content, old, new)?;
        self.backend.store(path, &replaced).await.map_err(io_fatal)?;
        self.tracked.insert(path.to_string(), replaced);
        self.log.push(ActionRecord::new(
            "edit",
            path,
            "replaced 1 occurrence".to_string(),
        ));
        Ok(())
    }

    /// Apply sub-edits in order against a working copy. Atomic: any failing
    /// sub-edit leaves the file byte-identical to before the call.
    pub async fn multi_edit(&mut self, path: &str, edits: &[EditOp]) -> EngineResult<()> {
        if edits.is_empty() {
            return Err(EngineError::MalformedAction {
                field: "edits".into(),
                message: "at least one edit is required".into(),
            });
        }

        let mut working = self.read(path).await?;
        for (index, op) in edits.iter().enumerate() {
            working = replace_exactly_once(path, &working, &op.old, &op.new).map_err(|e| {
                tracing::warn!(path = %path, sub_edit = index + 1, "multi_edit aborted, file unchanged");
                e
            })?;
        }

        self.backend.store(path, &working).await.map_err(io_fatal)?;
        self.tracked.insert(path.to_string(), working);
        self.log.push(ActionRecord::new(
            "multi_edit",
            path,
            format!("applied {} edits", edits.len()),
        ));
        Ok(())
    }

    /// Capture the current state of all tracked files.
    pub fn snapshot(&mut self, iteration: u32) -> String {
        let id = content_hash(&self.tracked);
        self.snapshots.push(FileSnapshot {
            id: id.clone(),
            iteration,
            files: self.tracked.clone(),
        });

        // Evict the oldest non-baseline snapshot beyond the retention
        // window; the iteration-0 snapshot always survives.
        while self.snapshots.len() > self.retention {
            let Some(pos) = self.snapshots.iter().position(|s| s.iteration != 0) else {
                break;
            };
            let evicted = self.snapshots.remove(pos);
            tracing::debug!(iteration = evicted.iteration, "evicted file snapshot");
        }

        tracing::info!(iteration, snapshot_id = %id, files = self.tracked.len(), "captured file snapshot");
        id
    }

    /// Wholesale replacement of the working state from iteration `n`'s
    /// snapshot. Snapshots and pending log entries for the discarded
    /// timeline are dropped.
    pub async fn restore_iteration(&mut self, n: u32) -> EngineResult<String> {
        let snapshot = self
            .snapshots
            .iter()
            .rfind(|s| s.iteration == n)
            .cloned()
            .ok_or_else(|| EngineError::SnapshotNotFound {
                iteration: n,
                available: self.snapshots.iter().map(|s| s.iteration).collect(),
            })?;

        for (path, content) in &snapshot.files {
            self.backend.store(path, content).await.map_err(io_fatal)?;
        }
        self.tracked = snapshot.files.clone();
        self.snapshots.retain(|s| s.iteration <= n);
        self.log.clear();

        tracing::info!(iteration = n, snapshot_id = %snapshot.id, "restored file snapshot");
        Ok(snapshot.id)
    }

    pub fn latest_snapshot(&self) -> Option<&FileSnapshot> {
        self.snapshots.last()
    }

    pub fn snapshots(&self) -> &[FileSnapshot] {
        &self.snapshots
    }

    /// Re-seed snapshot history, used when resuming a persisted session.
    pub fn load_snapshots(&mut self, snapshots: Vec<FileSnapshot>) {
        self.snapshots = snapshots;
        if let Some(latest) = self.snapshots.last() {
            self.tracked = latest.files.clone();
        }
    }

    /// Append a non-file entry (e.g. bash) to the same per-iteration log.
    pub fn record(&mut self, entry: ActionRecord) {
        self.log.push(entry);
    }

    pub fn drain_log(&mut self) -> Vec<ActionRecord> {
        std::mem::take(&mut self.log)
    }

    pub fn tracked_paths(&self) -> impl Iterator<Item = &str> {
        self.tracked.keys().map(String::as_str)
    }
}

fn replace_exactly_once(
    path: &str,
    content: &str,
    old: &str,
    new: &str,
) -> EngineResult<String> {
    let count = content.matches(old).count();
    match count {
        0 => Err(EngineError::NoMatch {
            path: path.to_string(),
        }),
        1 => Ok(content.replacen(old, new, 1)),
        n => Err(EngineError::AmbiguousMatch {
            path: path.to_string(),
            count: n,
        }),
    }
}

fn content_hash(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, content) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..8])
}

fn io_fatal(e: std::io::Error) -> EngineError {
    EngineError::Fatal(anyhow::anyhow!("file backend I/O failure: {e}"))
}

#[cfg(test)]
mod tests {
    use super::backend::MemoryBackend;
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_with(files: &[(&str, &str)]) -> FileStore {
        let backend = Arc::new(MemoryBackend::with_files(files.iter().copied()));
        FileStore::new(backend, 5)
    }

    // ─── read / write ───────────────────────────────────────────

    #[tokio::test]
    async fn test_read_not_found() {
        let mut store = store_with(&[]);
        let err = store.read("missing.py").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let mut store = store_with(&[]);
        store.write("new.py", "x = 1\n").await.unwrap();
        assert_eq!(store.read("new.py").await.unwrap(), "x = 1\n");
    }

    // ─── edit ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_edit_exactly_once() {
        let mut store = store_with(&[("calc.py", "return a - b\n")]);
        store.edit("calc.py", "a - b", "a + b").await.unwrap();
        assert_eq!(store.read("calc.py").await.unwrap(), "return a + b\n");
    }

    #[tokio::test]
    async fn test_edit_no_match() {
        let mut store = store_with(&[("calc.py", "return a + b\n")]);
        let err = store.edit("calc.py", "a * b", "a + b").await.unwrap_err();
        assert!(matches!(err, EngineError::NoMatch { .. }));
        assert_eq!(store.read("calc.py").await.unwrap(), "return a + b\n");
    }

    #[tokio::test]
    async fn test_edit_ambiguous_match_leaves_file_unchanged() {
        let original = "x = a + b\ny = a + b\n";
        let mut store = store_with(&[("calc.py", original)]);
        let err = store.edit("calc.py", "a + b", "a - b").await.unwrap_err();
        match err {
            EngineError::AmbiguousMatch { count, .. } => assert_eq!(count, 2),
            other => panic!("expected AmbiguousMatch, got {other:?}"),
        }
        assert_eq!(store.read("calc.py").await.unwrap(), original);
    }

    // ─── multi_edit ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_multi_edit_applies_in_order() {
        let mut store = store_with(&[("calc.py", "def add(a, b):\n    return a - b\n")]);
        store
            .multi_edit(
                "calc.py",
                &[
                    EditOp {
                        old: "a - b".into(),
                        new: "a + b".into(),
                    },
                    // Depends on the first edit's output
                    EditOp {
                        old: "return a + b".into(),
                        new: "return float(a + b)".into(),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            store.read("calc.py").await.unwrap(),
            "def add(a, b):\n    return float(a + b)\n"
        );
    }

    #[tokio::test]
    async fn test_multi_edit_atomic_on_failure() {
        let original = "one two three\n";
        let mut store = store_with(&[("a.txt", original)]);
        let err = store
            .multi_edit(
                "a.txt",
                &[
                    EditOp {
                        old: "one".into(),
                        new: "1".into(),
                    },
                    EditOp {
                        old: "four".into(),
                        new: "4".into(),
                    },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoMatch { .. }));
        // First sub-edit must not have leaked through
        assert_eq!(store.read("a.txt").await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_multi_edit_rejects_empty_edit_list() {
        let mut store = store_with(&[("a.txt", "content")]);
        let err = store.multi_edit("a.txt", &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::MalformedAction { .. }));
    }

    // ─── snapshots ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_snapshot_restore_reproduces_content() {
        let mut store = store_with(&[("a.txt", "v1")]);
        store.read("a.txt").await.unwrap();
        store.snapshot(0);

        store.write("a.txt", "v2").await.unwrap();
        store.write("b.txt", "new file").await.unwrap();
        store.snapshot(1);

        store.restore_iteration(0).await.unwrap();
        assert_eq!(store.read("a.txt").await.unwrap(), "v1");
        // b.txt was not tracked at iteration 0, so it is no longer tracked
        assert!(!store.tracked_paths().any(|p| p == "b.txt"));
    }

    #[tokio::test]
    async fn test_restore_unknown_iteration() {
        let mut store = store_with(&[("a.txt", "v1")]);
        store.read("a.txt").await.unwrap();
        store.snapshot(0);
        let err = store.restore_iteration(9).await.unwrap_err();
        match err {
            EngineError::SnapshotNotFound {
                iteration,
                available,
            } => {
                assert_eq!(iteration, 9);
                assert_eq!(available, vec![0]);
            }
            other => panic!("expected SnapshotNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restore_discards_later_snapshots() {
        let mut store = store_with(&[("a.txt", "v0")]);
        store.read("a.txt").await.unwrap();
        store.snapshot(0);
        for i in 1..=3 {
            store.write("a.txt", &format!("v{i}")).await.unwrap();
            store.snapshot(i);
        }
        store.restore_iteration(1).await.unwrap();
        let iterations: Vec<u32> = store.snapshots().iter().map(|s| s.iteration).collect();
        assert_eq!(iterations, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_retention_never_evicts_baseline() {
        let backend = Arc::new(MemoryBackend::with_files([("a.txt", "v0")]));
        let mut store = FileStore::new(backend, 3);
        store.read("a.txt").await.unwrap();
        store.snapshot(0);
        for i in 1..=6 {
            store.write("a.txt", &format!("v{i}")).await.unwrap();
            store.snapshot(i);
        }
        let iterations: Vec<u32> = store.snapshots().iter().map(|s| s.iteration).collect();
        assert_eq!(iterations.len(), 3);
        assert_eq!(iterations[0], 0);
        assert_eq!(*iterations.last().unwrap(), 6);
    }

    #[tokio::test]
    async fn test_snapshot_id_is_content_addressed() {
        let mut store = store_with(&[("a.txt", "same")]);
        store.read("a.txt").await.unwrap();
        let id_before = store.snapshot(0);
        store.write("a.txt", "different").await.unwrap();
        let id_changed = store.snapshot(1);
        store.write("a.txt", "same").await.unwrap();
        let id_back = store.snapshot(2);

        assert_ne!(id_before, id_changed);
        assert_eq!(id_before, id_back);
    }

    // ─── action log ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_mutations_append_to_log_in_order() {
        let mut store = store_with(&[("a.txt", "alpha beta")]);
        store.write("b.txt", "new").await.unwrap();
        store.edit("a.txt", "alpha", "gamma").await.unwrap();
        store
            .multi_edit(
                "a.txt",
                &[EditOp {
                    old: "beta".into(),
                    new: "delta".into(),
                }],
            )
            .await
            .unwrap();

        let log = store.drain_log();
        let kinds: Vec<&str> = log.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, vec!["write", "edit", "multi_edit"]);
        assert!(store.drain_log().is_empty());
    }

    #[tokio::test]
    async fn test_failed_mutation_not_logged() {
        let mut store = store_with(&[("a.txt", "alpha")]);
        let _ = store.edit("a.txt", "nope", "x").await;
        assert!(store.drain_log().is_empty());
    }
}
