//! Application deployments (chat front ends and similar).
//!
//! The application record's id *is* the container id, so a record only
//! exists for containers that were actually started.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use inferadmin_engine::{GpuRequest, PortBinding, RunSpec, VolumeMount};
use inferadmin_state::{AppType, Application, ContainerStatus, RecordStore, StateError};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::backend::Backend;
use crate::error::{DeployError, DeployResult};
use crate::images::ImageService;
use crate::reconcile::Reconciler;

const OPEN_WEBUI_PORT: u16 = 3000;
const OPEN_WEBUI_DATA_VOLUME: &str = "open-webui";
const OPEN_WEBUI_DATA_PATH: &str = "/app/backend/data";
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Request to deploy an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployApplication {
    pub name: String,
    pub app_type: AppType,
    /// Managed image id or reference.
    pub image: String,
    pub host_port: u16,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub gpu_uuids: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct ApplicationService {
    store: RecordStore<Application>,
    images: ImageService,
    backend: Backend,
    reconciler: Reconciler,
}

impl ApplicationService {
    pub fn new(
        store: RecordStore<Application>,
        images: ImageService,
        backend: Backend,
    ) -> Self {
        let reconciler = Reconciler::new(backend.clone());
        Self {
            store,
            images,
            backend,
            reconciler,
        }
    }

    /// All applications with their current engine status.
    pub async fn list(&self) -> DeployResult<Vec<Application>> {
        let store = self.store.clone();
        let apps = self.backend.blocking(move || store.list_all()).await?;
        Ok(self.reconciler.reconcile(apps).await)
    }

    pub async fn get(&self, id: &str) -> DeployResult<Application> {
        let mut app = self.require(id).await?;
        app.status = self.reconciler.status_of(&app.id).await;
        Ok(app)
    }

    pub async fn deploy(&self, request: DeployApplication) -> DeployResult<Application> {
        validate_name(&request.name)?;
        let image = self.images.resolve_managed(&request.image).await?;
        let spec = run_spec(&request, &image.managed_tag);

        info!(name = %request.name, image = %spec.image, port = request.host_port, "deploying application");
        let container_id = {
            let spec = spec.clone();
            self.backend.engine_call(move |engine| engine.run(&spec)).await?
        };

        let app = Application {
            id: container_id.clone(),
            name: request.name,
            status: ContainerStatus::Starting,
            app_type: request.app_type,
            deployed_at: Utc::now(),
            host_port: request.host_port,
            gpu_uuids: request.gpu_uuids.filter(|g| !g.is_empty()),
            logs: None,
        };

        let store = self.store.clone();
        let record = app.clone();
        let persisted = self.backend.blocking(move || store.add(record)).await;
        match persisted {
            Ok(Ok(_)) => {
                info!(id = %app.id, name = %app.name, "application deployed");
                Ok(app)
            }
            Ok(Err(e)) => {
                self.discard_container(&container_id).await;
                Err(e.into())
            }
            Err(e) => {
                self.discard_container(&container_id).await;
                Err(e)
            }
        }
    }

    /// Tear the container down and forget the application.
    pub async fn delete(&self, id: &str) -> DeployResult<()> {
        let app = self.require(id).await?;
        let removed = self.backend.teardown_container(&app.id, STOP_GRACE).await?;

        let store = self.store.clone();
        let record_id = app.id.clone();
        self.backend.blocking(move || store.remove(&record_id)).await??;
        info!(id = %app.id, name = %app.name, container_removed = removed, "application deleted");
        Ok(())
    }

    pub async fn start(&self, id: &str) -> DeployResult<()> {
        let app = self.require(id).await?;
        let container = app.id.clone();
        self.backend
            .engine_call(move |engine| engine.start(&container))
            .await?;
        info!(id = %app.id, "application started");
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> DeployResult<()> {
        let app = self.require(id).await?;
        let container = app.id.clone();
        self.backend
            .engine_call(move |engine| engine.stop(&container, STOP_GRACE))
            .await?;
        info!(id = %app.id, "application stopped");
        Ok(())
    }

    /// Fetch container logs and keep the latest copy on the record.
    ///
    /// An application deleted while its logs were being fetched stays
    /// deleted: the call then fails with `NotFound`.
    pub async fn logs(&self, id: &str, tail: Option<usize>) -> DeployResult<String> {
        let app = self.require(id).await?;
        let container = app.id.clone();
        let logs = self
            .backend
            .engine_call(move |engine| engine.logs(&container, tail))
            .await?;

        let store = self.store.clone();
        let cached = logs.clone();
        match self
            .backend
            .blocking(move || store.modify(&app.id, |record| record.logs = Some(cached)))
            .await?
        {
            Ok(_) => Ok(logs),
            Err(StateError::NotFound(_)) => Err(DeployError::not_found("application", id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn require(&self, id: &str) -> DeployResult<Application> {
        let store = self.store.clone();
        let wanted = id.to_string();
        self.backend
            .blocking(move || store.get_by_id(&wanted))
            .await?
            .ok_or_else(|| DeployError::not_found("application", id))
    }

    async fn discard_container(&self, id: &str) {
        if let Err(e) = self.backend.teardown_container(id, Duration::ZERO).await {
            error!(container = %id, error = %e, "failed to remove container of unrecorded application");
        }
    }
}

fn validate_name(name: &str) -> DeployResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(DeployError::InvalidRequest(format!(
            "application name {name:?} must be non-empty and use only [A-Za-z0-9_.-]"
        )))
    }
}

fn run_spec(request: &DeployApplication, image: &str) -> RunSpec {
    let mut spec = RunSpec::new(image, format!("inferadmin-app-{}", request.name));
    spec.labels
        .insert("deployment-type".to_string(), "application".to_string());
    match request.app_type {
        AppType::OpenWebUi => {
            spec.ports
                .push(PortBinding::public(request.host_port, OPEN_WEBUI_PORT));
            spec.volumes.push(VolumeMount {
                source: OPEN_WEBUI_DATA_VOLUME.to_string(),
                target: OPEN_WEBUI_DATA_PATH.to_string(),
                read_only: false,
            });
            spec.env
                .insert("WEBUI_ALLOW_DOWNLOADS".to_string(), "true".to_string());
        }
    }
    spec.env.extend(request.environment.clone());
    if let Some(gpus) = request.gpu_uuids.as_ref().filter(|g| !g.is_empty()) {
        spec.gpus = GpuRequest::Devices(gpus.clone());
    }
    spec
}
