//! StateDir: the process-wide state root holding every collection.

use std::path::{Path, PathBuf};

use crate::error::StateResult;
use crate::store::RecordStore;
use crate::types::{Application, ImageRef, LlmDeployment};

/// Root directory under which each domain collection keeps its document.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$HOME/.inferadmin/state`, falling back to a relative path when no
    /// home directory is set.
    pub fn default_root() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".inferadmin")
            .join("state")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn applications(&self) -> StateResult<RecordStore<Application>> {
        RecordStore::open_default(&self.root)
    }

    pub fn llms(&self) -> StateResult<RecordStore<LlmDeployment>> {
        RecordStore::open_default(&self.root)
    }

    pub fn images(&self) -> StateResult<RecordStore<ImageRef>> {
        RecordStore::open_default(&self.root)
    }
}
