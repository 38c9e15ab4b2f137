//! Template and brand-config storage
//!
//! The registry only needs "read bytes by key" and "write bytes by key", so
//! storage is a small trait with a filesystem implementation for production
//! and an in-memory one for tests and embedding.
//!
//! Keys are `/`-separated relative paths:
//!
//! ```text
//! default/<template_id>.html
//! tenants/<tenant_id>/<template_id>.html
//! tenants/<tenant_id>/config.json
//! ```

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use crate::{Error, Result};

/// Raw byte storage addressed by relative key
pub trait TemplateStore: Send + Sync {
    /// Bytes stored under `key`, `None` when absent.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace `key`.
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Names of the entries stored directly under `prefix` (one level, no
    /// sub-directories).
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Store rooted at a directory on disk
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::Storage(format!("failed to create templates directory {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Error::Storage(format!("invalid storage key: {:?}", key)));
        }
        Ok(self.root.join(rel))
    }
}

impl TemplateStore for FsStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("failed to read {}: {}", path.display(), e))),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("failed to create {}: {}", parent.display(), e)))?;
        }
        std::fs::write(&path, bytes)
            .map_err(|e| Error::Storage(format!("failed to write {}: {}", path.display(), e)))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_for(prefix.trim_end_matches('/'))?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Storage(format!("failed to list {}: {}", dir.display(), e))),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::Storage(e.to_string()))?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Process-local store, handy for tests and for embedding templates
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(self, key: &str, bytes: impl AsRef<[u8]>) -> Self {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.to_string(), bytes.as_ref().to_vec());
        }
        self
    }
}

impl TemplateStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".into()))?;
        entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".into()))?;
        Ok(entries
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }
}
