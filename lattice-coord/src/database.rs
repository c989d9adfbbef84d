//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/lattice/db";
/// The DB tree used for physical channel metadata.
const TREE_CHANNELS: &str = "channels";
/// The DB tree used for worker task records.
const TREE_TASKS: &str = "tasks";
/// The DB tree used for segment metadata.
const TREE_SEGMENTS: &str = "segments";
/// The DB tree used for built index metadata.
const TREE_INDEXES: &str = "indexes";
/// The DB tree used for per-channel replication checkpoints.
const TREE_CHECKPOINTS: &str = "checkpoints";
/// The DB tree used for one-time cluster flags.
const TREE_FLAGS: &str = "flags";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the coordinator's metadata database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// System runtime config.
    #[allow(dead_code)]
    config: Arc<Config>,
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path).join(config.cluster_name.as_str());
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for lattice coordinator database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { config, db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the named DB tree.
    async fn get_tree(&self, name: &'static str) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(name));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", name, err))))?;
        Ok(tree)
    }

    /// Get a handle to the DB tree for physical channel metadata.
    pub async fn get_channels_tree(&self) -> ShutdownResult<Tree> {
        self.get_tree(TREE_CHANNELS).await
    }

    /// Get a handle to the DB tree for worker task records.
    pub async fn get_tasks_tree(&self) -> ShutdownResult<Tree> {
        self.get_tree(TREE_TASKS).await
    }

    /// Get a handle to the DB tree for segment metadata.
    pub async fn get_segments_tree(&self) -> ShutdownResult<Tree> {
        self.get_tree(TREE_SEGMENTS).await
    }

    /// Get a handle to the DB tree for built index metadata.
    pub async fn get_indexes_tree(&self) -> ShutdownResult<Tree> {
        self.get_tree(TREE_INDEXES).await
    }

    /// Get a handle to the DB tree for per-channel replication checkpoints.
    pub async fn get_checkpoints_tree(&self) -> ShutdownResult<Tree> {
        self.get_tree(TREE_CHECKPOINTS).await
    }

    /// Get a handle to the DB tree for one-time cluster flags.
    pub async fn get_flags_tree(&self) -> ShutdownResult<Tree> {
        self.get_tree(TREE_FLAGS).await
    }
}
