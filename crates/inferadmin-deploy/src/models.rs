//! Local model inventory under the model storage path.
//!
//! ```text
//!   <model_storage_path>/
//!     ├── meta-llama_Llama-3.1-8B-Instruct/   complete model → listed
//!     │     ├── config.json, tokenizer.json, ...
//!     │     └── model-00001-of-00004.safetensors
//!     └── org_partial/                          missing files → skipped
//! ```
//!
//! Scans walk whole model trees and run on the CPU pool.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use inferadmin_dispatch::PoolKind;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::backend::Backend;
use crate::error::{DeployError, DeployResult};
use crate::llms::model_dir;

/// Files every servable model directory carries at its top level.
const REQUIRED_FILES: &[&str] = &[
    "generation_config.json",
    "config.json",
    "tokenizer.json",
    "special_tokens_map.json",
    "tokenizer_config.json",
    "vocab.json",
];

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A complete model found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalModel {
    /// Published name, e.g. `meta-llama/Llama-3.1-8B-Instruct`.
    pub repo_id: String,
    pub path: PathBuf,
    /// Total size of regular files, rounded to two decimals.
    pub size_gb: f64,
    /// Newest modification time of any file in the tree.
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ModelService {
    backend: Backend,
    model_storage_path: PathBuf,
}

impl ModelService {
    pub fn new(backend: Backend, model_storage_path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            model_storage_path: model_storage_path.into(),
        }
    }

    /// Every complete model under the storage path, sorted by `repo_id`.
    pub async fn list(&self) -> DeployResult<Vec<LocalModel>> {
        let storage = self.model_storage_path.clone();
        let models = self
            .backend
            .dispatcher()
            .run(PoolKind::Cpu, move || scan_models(&storage))
            .await?;
        debug!(count = models.len(), "local models scanned");
        Ok(models)
    }

    /// Remove a model directory and everything in it.
    pub async fn delete(&self, repo_id: &str) -> DeployResult<()> {
        let name = repo_id.trim();
        if matches!(name, "" | "." | "..") {
            return Err(DeployError::InvalidRequest(format!(
                "{repo_id:?} is not a model name"
            )));
        }
        let path = model_dir(&self.model_storage_path, name);
        let target = path.clone();
        let removed = self
            .backend
            .blocking(move || {
                if !target.is_dir() {
                    return Ok(false);
                }
                fs::remove_dir_all(&target).map(|()| true)
            })
            .await?
            .map_err(|e| DeployError::Io(format!("{}: {e}", path.display())))?;
        if !removed {
            return Err(DeployError::not_found("model", repo_id));
        }
        info!(repo_id = %name, path = ?path, "model deleted");
        Ok(())
    }
}

fn scan_models(storage: &Path) -> Vec<LocalModel> {
    let Ok(entries) = fs::read_dir(storage) else {
        return Vec::new();
    };
    let mut models: Vec<LocalModel> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && is_complete_model(path))
        .filter_map(|path| {
            let folder = path.file_name()?.to_str()?.to_string();
            let (size_bytes, newest) = tree_stats(&path);
            Some(LocalModel {
                repo_id: repo_id_from_folder(&folder),
                size_gb: (size_bytes as f64 / BYTES_PER_GB * 100.0).round() / 100.0,
                last_updated: newest.unwrap_or_else(Utc::now),
                path,
            })
        })
        .collect();
    models.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));
    models
}

/// At least one `.safetensors` weight file plus every required file.
fn is_complete_model(dir: &Path) -> bool {
    let has_weights = fs::read_dir(dir)
        .map(|entries| {
            entries.filter_map(Result::ok).any(|entry| {
                entry.path().extension().is_some_and(|ext| ext == "safetensors")
            })
        })
        .unwrap_or(false);
    has_weights && REQUIRED_FILES.iter().all(|name| dir.join(name).is_file())
}

/// Total bytes of regular files (symlinks excluded) and the newest mtime.
fn tree_stats(dir: &Path) -> (u64, Option<DateTime<Utc>>) {
    let mut size = 0;
    let mut newest: Option<DateTime<Utc>> = None;
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        size += metadata.len();
        if let Ok(modified) = metadata.modified() {
            let modified = DateTime::<Utc>::from(modified);
            newest = Some(newest.map_or(modified, |n| n.max(modified)));
        }
    }
    (size, newest)
}

/// Folders are named after the model with `/` stored as `_`. Only the first
/// `_` is mapped back so underscores inside the model name survive.
fn repo_id_from_folder(folder: &str) -> String {
    folder.replacen('_', "/", 1)
}
