//! Managed images: pulled by the control plane and tagged as its own.

use chrono::Utc;
use inferadmin_engine::{split_reference, EngineError};
use inferadmin_state::{ImageRef, RecordStore};
use tracing::{info, warn};

use crate::backend::Backend;
use crate::error::{DeployError, DeployResult};

#[derive(Clone)]
pub struct ImageService {
    store: RecordStore<ImageRef>,
    backend: Backend,
}

impl ImageService {
    pub fn new(store: RecordStore<ImageRef>, backend: Backend) -> Self {
        Self { store, backend }
    }

    pub async fn list(&self) -> DeployResult<Vec<ImageRef>> {
        let store = self.store.clone();
        self.backend.blocking(move || store.list_all()).await
    }

    /// Pull `reference`, tag it as managed and record it.
    ///
    /// Pulling an image that is already recorded refreshes its record.
    pub async fn pull(&self, reference: &str) -> DeployResult<ImageRef> {
        let reference = reference.trim().to_string();
        if reference.is_empty() {
            return Err(DeployError::InvalidRequest("empty image reference".to_string()));
        }

        info!(%reference, "pulling image");
        let pulled = {
            let reference = reference.clone();
            self.backend
                .engine_call(move |engine| engine.pull_image(&reference))
                .await?
        };

        let (repository, tag) = split_reference(&pulled.reference);
        let image = ImageRef {
            id: pulled.id,
            repository,
            tag,
            managed_tag: pulled.managed_tag,
            pulled_at: Utc::now(),
            size_bytes: pulled.size_bytes,
        };

        let store = self.store.clone();
        let record = image.clone();
        self.backend.blocking(move || store.update(record)).await??;
        info!(id = %image.id, managed_tag = %image.managed_tag, "image pulled");
        Ok(image)
    }

    /// Remove a managed image from the engine and forget it.
    pub async fn remove(&self, id_or_reference: &str) -> DeployResult<ImageRef> {
        let image = self.resolve_managed(id_or_reference).await?;

        let id = image.id.clone();
        match self
            .backend
            .engine_call(move |engine| engine.remove_image(&id))
            .await
        {
            Ok(()) => {}
            Err(DeployError::Engine(EngineError::ImageNotFound(_))) => {
                warn!(id = %image.id, "image already gone from the engine");
            }
            Err(e) => return Err(e),
        }

        let store = self.store.clone();
        let id = image.id.clone();
        self.backend.blocking(move || store.remove(&id)).await??;
        info!(id = %image.id, "image removed");
        Ok(image)
    }

    /// Find a managed image by id, id prefix, reference or managed tag.
    pub async fn resolve_managed(&self, id_or_reference: &str) -> DeployResult<ImageRef> {
        let images = self.list().await?;
        find_managed(&images, id_or_reference)
            .cloned()
            .ok_or_else(|| DeployError::ImageNotManaged(id_or_reference.to_string()))
    }
}

pub(crate) fn find_managed<'a>(images: &'a [ImageRef], wanted: &str) -> Option<&'a ImageRef> {
    let wanted = wanted.trim();
    if wanted.is_empty() {
        return None;
    }
    images.iter().find(|image| {
        image.id == wanted
            || image.managed_tag == wanted
            || image.reference() == wanted
            || is_id_prefix(&image.id, wanted)
    })
}

/// Short ids as printed by `docker images` (with or without `sha256:`).
fn is_id_prefix(id: &str, wanted: &str) -> bool {
    let hex = id.strip_prefix("sha256:").unwrap_or(id);
    let wanted = wanted.strip_prefix("sha256:").unwrap_or(wanted);
    wanted.len() >= 12 && hex.starts_with(wanted)
}
