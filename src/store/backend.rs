// src/store/backend.rs — Raw file access behind the store

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Raw load/store of target files. The store layers tracking, edit
/// semantics, and snapshots on top; backends stay dumb.
#[async_trait]
pub trait FileBackend: Send + Sync {
    /// Returns `None` when the file does not exist.
    async fn load(&self, path: &str) -> std::io::Result<Option<String>>;
    async fn store(&self, path: &str, content: &str) -> std::io::Result<()>;
}

/// Local filesystem backend, rooted so relative target paths stay inside
/// the target system's directory.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl FileBackend for LocalBackend {
    async fn load(&self, path: &str) -> std::io::Result<Option<String>> {
        match tokio::fs::read_to_string(self.resolve(path)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn store(&self, path: &str, content: &str) -> std::io::Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, content).await
    }
}

/// In-memory backend for tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    files: Mutex<BTreeMap<String, String>>,
}

impl MemoryBackend {
    pub fn with_files<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            files: Mutex::new(
                files
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl FileBackend for MemoryBackend {
    async fn load(&self, path: &str) -> std::io::Result<Option<String>> {
        let files = self
            .files
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(files.get(path).cloned())
    }

    async fn store(&self, path: &str, content: &str) -> std::io::Result<()> {
        self.files
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(path.to_string(), content.to_string());
        Ok(())
    }
}
