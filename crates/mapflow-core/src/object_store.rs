use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

/// Filesystem object store rooted at the data directory. Keys are
/// `/`-separated relative paths.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key '{0}'")]
    InvalidKey(String),
    #[error("I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    /// Another writer committed the key first; its bytes were kept.
    AlreadyExists,
}

const TMP_DIR: &str = ".tmp";

impl ObjectStore {
    pub const CACHE_PREFIX: &'static str = "cache/";
    pub const FEATURES_PREFIX: &'static str = "features/";
    pub const HISTORY_KEY: &'static str = "fetch_history.json";

    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(TMP_DIR)).map_err(|source| StoreError::Io {
            key: TMP_DIR.to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_entry_key(hex: &str, partial: bool) -> String {
        let shard = hex.get(..2).unwrap_or(hex);
        if partial {
            format!("{}{shard}/{hex}.partial.json", Self::CACHE_PREFIX)
        } else {
            format!("{}{shard}/{hex}.json", Self::CACHE_PREFIX)
        }
    }

    pub fn manifest_key(version: &str) -> String {
        format!("{}{version}/manifest.json", Self::FEATURES_PREFIX)
    }

    pub fn features_key(version: &str) -> String {
        format!("{}{version}/features.parquet", Self::FEATURES_PREFIX)
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let well_formed = !key.is_empty()
            && !key.contains('\\')
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
            && !key.starts_with(TMP_DIR);
        if !well_formed {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(key)?.is_file())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(io_error(key, source)),
        }
    }

    /// Write-once put. The bytes land in a temp file which is then hard-linked
    /// into place, so readers never observe a partially written object and an
    /// existing object is never replaced.
    pub fn put_new(&self, key: &str, bytes: &[u8]) -> Result<PutOutcome, StoreError> {
        let target = self.path_for(key)?;
        self.ensure_parent(key, &target)?;
        let temp = self.write_temp(key, bytes)?;

        let outcome = match fs::hard_link(&temp, &target) {
            Ok(()) => Ok(PutOutcome::Created),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(PutOutcome::AlreadyExists),
            Err(source) => Err(io_error(key, source)),
        };
        let _ = fs::remove_file(&temp);
        outcome
    }

    /// Atomic replace for mutable documents (manifests, the fetch history).
    pub fn put_replace(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let target = self.path_for(key)?;
        self.ensure_parent(key, &target)?;
        let temp = self.write_temp(key, bytes)?;
        fs::rename(&temp, &target).map_err(|source| {
            let _ = fs::remove_file(&temp);
            io_error(key, source)
        })
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io_error(key, source)),
        }
    }

    /// Every object key under `prefix`, sorted.
    pub fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let trimmed = prefix.trim_end_matches('/');
        let start = if trimmed.is_empty() {
            self.root.clone()
        } else {
            self.path_for(trimmed)?
        };

        let mut keys = Vec::new();
        if start.is_dir() {
            self.walk(&start, &mut keys)?;
        }
        keys.sort();
        Ok(keys)
    }

    fn walk(&self, dir: &Path, keys: &mut Vec<String>) -> Result<(), StoreError> {
        let entries = fs::read_dir(dir).map_err(|source| io_error(&dir.display().to_string(), source))?;
        for entry in entries {
            let entry = entry.map_err(|source| io_error(&dir.display().to_string(), source))?;
            let path = entry.path();
            if path.is_dir() {
                if path == self.root.join(TMP_DIR) {
                    continue;
                }
                self.walk(&path, keys)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let key: Vec<String> = relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy().into_owned())
                    .collect();
                keys.push(key.join("/"));
            }
        }
        Ok(())
    }

    fn ensure_parent(&self, key: &str, target: &Path) -> Result<(), StoreError> {
        match target.parent() {
            Some(parent) => fs::create_dir_all(parent).map_err(|source| io_error(key, source)),
            None => Ok(()),
        }
    }

    fn write_temp(&self, key: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let temp = self.root.join(TMP_DIR).join(format!("{}.tmp", Uuid::new_v4()));
        let written = File::create(&temp).and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
        if let Err(source) = written {
            let _ = fs::remove_file(&temp);
            return Err(io_error(key, source));
        }
        Ok(temp)
    }
}

fn io_error(key: &str, source: io::Error) -> StoreError {
    StoreError::Io {
        key: key.to_string(),
        source,
    }
}
