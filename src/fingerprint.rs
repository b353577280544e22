//! Content fingerprint cache.
//!
//! A fingerprint is a SHA-256 digest over the model identity and a file's
//! content. After a successful generation it is stored under a flat key
//! derived from the file's relative path; the next run regenerates the file
//! only when the freshly computed fingerprint differs from the stored one.

use crate::{
    config::ModelConfig,
    error::{Error, Result},
    file::SourceFile,
};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, trace};

/// Hex-encoded SHA-256 digest of `(model, content)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of `content` generated with `model`.
    #[must_use]
    pub fn compute(model: &ModelConfig, content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(model.identity().as_bytes());
        // Separator keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// The hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Flat cache key for a root-relative path: separators become `_`.
#[must_use]
pub fn cache_key(relative_path: &str) -> String {
    relative_path.replace(['/', '\\'], "_")
}

/// Durable key-value storage for fingerprints.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Reads the value stored under `key`; `Ok(None)` if there is none.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// One file per key in a single directory.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    dir: PathBuf,
}

impl FsCacheStore {
    /// Stores entries in `dir`, which is created on first write if needed.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.dir.join(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::io(&self.dir, e))?;

        let path = self.dir.join(key);
        tokio::fs::write(&path, value)
            .await
            .map_err(|e| Error::io(&path, e))
    }
}

/// In-process store; fingerprints live only as long as the store.
///
/// Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryCacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Change detection on top of a [`CacheStore`].
#[derive(Clone)]
pub struct FingerprintCache {
    store: Arc<dyn CacheStore>,
}

impl FingerprintCache {
    /// Wraps `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Returns true if `file` must be (re)generated with `model`.
    ///
    /// `force` bypasses the lookup. A missing or unreadable entry counts as
    /// never generated.
    pub async fn should_generate(&self, file: &SourceFile, model: &ModelConfig, force: bool) -> bool {
        if force {
            return true;
        }

        let key = cache_key(&file.path);
        let stored = match self.store.get(&key).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                trace!("No fingerprint stored for {}", file.path);
                return true;
            }
            Err(e) => {
                debug!("Treating unreadable cache entry for {} as missing: {}", file.path, e);
                return true;
            }
        };

        let current = Fingerprint::compute(model, &file.content);
        stored.trim() != current.as_str()
    }

    /// Persists the fingerprint of `file` after a successful generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn record_generated(&self, file: &SourceFile, model: &ModelConfig) -> Result<Fingerprint> {
        let fingerprint = Fingerprint::compute(model, &file.content);
        self.store
            .set(&cache_key(&file.path), fingerprint.as_str())
            .await?;
        Ok(fingerprint)
    }
}

impl fmt::Debug for FingerprintCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintCache").finish_non_exhaustive()
    }
}
