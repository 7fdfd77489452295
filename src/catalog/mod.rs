//! Model catalog.
//!
//! - [`scanner`]: directory scan producing model descriptors
//! - [`gguf`]: bounded GGUF header inspection
//!
//! [`ModelCatalog`] remembers the most recent scan so requests can be
//! validated against what the user was actually shown.

pub mod gguf;
pub mod scanner;

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

pub use scanner::{scan, ModelDescriptor, ModelId, ScanOptions, UNKNOWN_QUANTIZATION};

use crate::config::CatalogConfig;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("cannot create {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
}

/// An immutable scan result. A rescan replaces it wholesale.
pub type Snapshot = Arc<[ModelDescriptor]>;

/// The configured model directory plus its latest scan.
pub struct ModelCatalog {
    dir: PathBuf,
    options: ScanOptions,
    latest: RwLock<Option<Snapshot>>,
}

impl ModelCatalog {
    pub fn new(dir: impl Into<PathBuf>, options: ScanOptions) -> Self {
        Self {
            dir: dir.into(),
            options,
            latest: RwLock::new(None),
        }
    }

    pub fn from_config(config: &CatalogConfig) -> Self {
        Self::new(
            config.models_dir.clone(),
            ScanOptions {
                extension: config.extension.clone(),
                inspect_headers: config.inspect_headers,
            },
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan the directory and make the result the current snapshot.
    pub fn refresh(&self) -> Result<Snapshot, CatalogError> {
        let snapshot: Snapshot = scan(&self.dir, &self.options)?.into();
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// The most recent snapshot, if any scan has completed.
    pub fn latest(&self) -> Option<Snapshot> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Find `id` in the latest snapshot, scanning first if there is none.
    pub fn lookup(&self, id: &str) -> Result<Option<ModelDescriptor>, CatalogError> {
        let snapshot = match self.latest() {
            Some(snapshot) => snapshot,
            None => self.refresh()?,
        };
        Ok(snapshot.iter().find(|m| m.id == id).cloned())
    }

    /// Find a model by id, file name or display name (case-insensitive),
    /// in that order of preference. For human input; requests use ids.
    pub fn resolve(&self, query: &str) -> Result<Option<ModelDescriptor>, CatalogError> {
        let snapshot = match self.latest() {
            Some(snapshot) => snapshot,
            None => self.refresh()?,
        };

        let by_id = snapshot.iter().find(|m| m.id == query);
        let by_file = || {
            snapshot.iter().find(|m| {
                m.path
                    .file_name()
                    .is_some_and(|f| f.to_string_lossy().eq_ignore_ascii_case(query))
            })
        };
        let by_name = || snapshot.iter().find(|m| m.name.eq_ignore_ascii_case(query));

        Ok(by_id.or_else(by_file).or_else(by_name).cloned())
    }
}
