//! Object store boundary.
//!
//! The garbage collector only depends on this narrow listing/removal surface; the actual wire
//! protocol of the backing store is out of scope for the coordinator. Keys are `/`-separated
//! paths rooted at `root_path()`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use time::OffsetDateTime;

use crate::database::Database;

/// A single object held by the store.
#[derive(Clone, Debug)]
pub struct ObjectInfo {
    /// The full key of the object, rooted at the store's root path.
    pub path: String,
    /// The last modification time of the object.
    pub modified_at: OffsetDateTime,
}

/// The object store surface consumed by the garbage collector.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// The root path under which all of this store's keys live.
    fn root_path(&self) -> &str;

    /// List all objects under the given prefix.
    ///
    /// When `recursive` is false, only the immediate children of the prefix are returned, with
    /// directories represented as a single entry.
    async fn list_with_prefix(&self, prefix: &str, recursive: bool) -> Result<Vec<ObjectInfo>>;

    /// Remove the object under the given key. Removing an absent key is a no-op.
    async fn remove(&self, path: &str) -> Result<()>;

    /// Remove all objects under the given prefix. Removing an absent prefix is a no-op.
    async fn remove_with_prefix(&self, prefix: &str) -> Result<()>;
}

/// An object store backed by a local filesystem directory.
pub struct FsObjectStore {
    /// The filesystem directory backing the store.
    base: PathBuf,
    /// The logical root path prefixed to every key.
    root: String,
}

impl FsObjectStore {
    /// Create a new instance over the given backing directory.
    pub fn new(base: impl Into<PathBuf>, root: impl Into<String>) -> Self {
        Self { base: base.into(), root: root.into() }
    }

    /// Resolve the given key to its backing filesystem path.
    fn resolve(&self, key: &str) -> PathBuf {
        let rel = key.strip_prefix(self.root.as_str()).unwrap_or(key).trim_matches('/');
        self.base.join(rel)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn root_path(&self) -> &str {
        &self.root
    }

    async fn list_with_prefix(&self, prefix: &str, recursive: bool) -> Result<Vec<ObjectInfo>> {
        let dir = self.resolve(prefix);
        let (base, root) = (self.base.clone(), self.root.clone());
        Database::spawn_blocking(move || -> Result<Vec<ObjectInfo>> {
            let mut out = Vec::new();
            if dir.exists() {
                collect_objects(&dir, &base, &root, recursive, &mut out)?;
            }
            Ok(out)
        })
        .await?
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let target = self.resolve(path);
        Database::spawn_blocking(move || -> Result<()> {
            match std::fs::remove_file(&target) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err).with_context(|| format!("error removing object {:?}", target)),
            }
        })
        .await?
    }

    async fn remove_with_prefix(&self, prefix: &str) -> Result<()> {
        let target = self.resolve(prefix);
        Database::spawn_blocking(move || -> Result<()> {
            if !target.exists() {
                return Ok(());
            }
            let res = if target.is_dir() {
                std::fs::remove_dir_all(&target)
            } else {
                std::fs::remove_file(&target)
            };
            match res {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err).with_context(|| format!("error removing object prefix {:?}", target)),
            }
        })
        .await?
    }
}

/// Collect objects under `dir` into `out`, keyed relative to `base` under `root`.
fn collect_objects(dir: &Path, base: &Path, root: &str, recursive: bool, out: &mut Vec<ObjectInfo>) -> Result<()> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("error listing object dir {:?}", dir))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("error reading object dir entry in {:?}", dir))?;
        let path = entry.path();
        let meta = entry.metadata().with_context(|| format!("error reading object metadata {:?}", path))?;
        let modified_at = meta
            .modified()
            .map(OffsetDateTime::from)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        let key = match key_of_rel(&path, base, root) {
            Some(key) => key,
            None => continue,
        };
        if meta.is_dir() {
            if recursive {
                collect_objects(&path, base, root, recursive, out)?;
            } else {
                out.push(ObjectInfo { path: key, modified_at });
            }
        } else {
            out.push(ObjectInfo { path: key, modified_at });
        }
    }
    Ok(())
}

/// Build the key of the given backing filesystem path.
fn key_of_rel(path: &Path, base: &Path, root: &str) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    Some(format!("{}/{}", root, rel.to_string_lossy()))
}
