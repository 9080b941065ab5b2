//! LLM deployments served by an inference engine container.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use inferadmin_engine::{GpuRequest, PortBinding, RunSpec, VolumeMount};
use inferadmin_state::{ContainerStatus, LlmDeployment, LlmEngine, RecordStore, StateError};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::backend::Backend;
use crate::error::{DeployError, DeployResult};
use crate::images::ImageService;
use crate::reconcile::Reconciler;

const VLLM_PORT: u16 = 8000;
const MODEL_MOUNT: &str = "/models";
/// vLLM can take a while to release GPU memory.
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Request to serve a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployLlm {
    /// Model name as published, e.g. `meta-llama/Llama-3.1-8B-Instruct`.
    pub model_name: String,
    #[serde(default = "default_engine")]
    pub engine: LlmEngine,
    /// Managed image id or reference.
    pub image: String,
    pub host_port: u16,
    /// GPU indices; empty means every GPU.
    #[serde(default)]
    pub gpu_ids: Vec<u32>,
    #[serde(default = "default_tensor_parallel_size")]
    pub tensor_parallel_size: u32,
    #[serde(default = "default_max_model_len")]
    pub max_model_len: u32,
}

fn default_engine() -> LlmEngine {
    LlmEngine::Vllm
}

fn default_tensor_parallel_size() -> u32 {
    1
}

fn default_max_model_len() -> u32 {
    4096
}

#[derive(Clone)]
pub struct LlmService {
    store: RecordStore<LlmDeployment>,
    images: ImageService,
    backend: Backend,
    reconciler: Reconciler,
    model_storage_path: PathBuf,
}

impl LlmService {
    pub fn new(
        store: RecordStore<LlmDeployment>,
        images: ImageService,
        backend: Backend,
        model_storage_path: impl Into<PathBuf>,
    ) -> Self {
        let reconciler = Reconciler::new(backend.clone());
        Self {
            store,
            images,
            backend,
            reconciler,
            model_storage_path: model_storage_path.into(),
        }
    }

    pub async fn list(&self) -> DeployResult<Vec<LlmDeployment>> {
        let store = self.store.clone();
        let deployments = self.backend.blocking(move || store.list_all()).await?;
        Ok(self.reconciler.reconcile(deployments).await)
    }

    pub async fn get(&self, id: &str) -> DeployResult<LlmDeployment> {
        let deployment = self.require(id).await?;
        let mut reconciled = self.reconciler.reconcile(vec![deployment]).await;
        reconciled
            .pop()
            .ok_or_else(|| DeployError::not_found("llm deployment", id))
    }

    pub async fn deploy(&self, request: DeployLlm) -> DeployResult<LlmDeployment> {
        if request.model_name.trim().is_empty() {
            return Err(DeployError::InvalidRequest("empty model name".to_string()));
        }
        if request.tensor_parallel_size == 0 || request.max_model_len == 0 {
            return Err(DeployError::InvalidRequest(
                "tensor_parallel_size and max_model_len must be positive".to_string(),
            ));
        }

        let image = self.images.resolve_managed(&request.image).await?;

        let model_path = model_dir(&self.model_storage_path, &request.model_name);
        let probe = model_path.clone();
        if !self.backend.blocking(move || probe.is_dir()).await? {
            return Err(DeployError::ModelNotFound(model_path.display().to_string()));
        }

        let store = self.store.clone();
        let taken: HashSet<String> = self
            .backend
            .blocking(move || store.list_all())
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        let id = fresh_id(&taken);

        let spec = run_spec(&id, &request, &image.managed_tag, &model_path);
        info!(%id, model = %request.model_name, image = %spec.image, port = request.host_port, "deploying llm");
        let container_id = {
            let spec = spec.clone();
            self.backend.engine_call(move |engine| engine.run(&spec)).await?
        };

        let deployment = LlmDeployment {
            id,
            model_name: request.model_name,
            engine: request.engine,
            image_id: image.id,
            deployed_at: Utc::now(),
            status: ContainerStatus::Starting,
            container_id: Some(container_id.clone()),
            host_port: request.host_port,
            gpu_ids: request.gpu_ids,
            logs: None,
        };

        let store = self.store.clone();
        let record = deployment.clone();
        let persisted = match self.backend.blocking(move || store.add(record)).await {
            Ok(result) => result.map_err(DeployError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            if let Err(cleanup) = self
                .backend
                .teardown_container(&container_id, Duration::ZERO)
                .await
            {
                error!(container = %container_id, error = %cleanup, "failed to remove container of unrecorded deployment");
            }
            return Err(e);
        }

        info!(id = %deployment.id, container = %container_id, "llm deployed");
        Ok(deployment)
    }

    pub async fn delete(&self, id: &str) -> DeployResult<()> {
        let deployment = self.require(id).await?;
        let removed = match deployment.container_id.as_deref().filter(|c| !c.is_empty()) {
            Some(container) => self.backend.teardown_container(container, STOP_GRACE).await?,
            None => false,
        };

        let store = self.store.clone();
        let record_id = deployment.id.clone();
        self.backend.blocking(move || store.remove(&record_id)).await??;
        info!(id = %deployment.id, container_removed = removed, "llm deployment deleted");
        Ok(())
    }

    /// Fetch container logs and keep the latest copy on the record.
    pub async fn logs(&self, id: &str, tail: Option<usize>) -> DeployResult<String> {
        let deployment = self.require(id).await?;
        let Some(container) = deployment.container_id.clone().filter(|c| !c.is_empty()) else {
            return Err(DeployError::not_found("container for llm deployment", id));
        };
        let logs = self
            .backend
            .engine_call(move |engine| engine.logs(&container, tail))
            .await?;

        let store = self.store.clone();
        let cached = logs.clone();
        match self
            .backend
            .blocking(move || store.modify(&deployment.id, |d| d.logs = Some(cached)))
            .await?
        {
            Ok(_) => Ok(logs),
            Err(StateError::NotFound(_)) => Err(DeployError::not_found("llm deployment", id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn require(&self, id: &str) -> DeployResult<LlmDeployment> {
        let store = self.store.clone();
        let wanted = id.to_string();
        self.backend
            .blocking(move || store.get_by_id(&wanted))
            .await?
            .ok_or_else(|| DeployError::not_found("llm deployment", id))
    }
}

/// Models are stored one directory per model, `/` in the name replaced by `_`.
pub fn model_dir(storage: &Path, model_name: &str) -> PathBuf {
    storage.join(model_name.trim().replace('/', "_"))
}

/// Eight hex chars not already used by another deployment.
fn fresh_id(taken: &HashSet<String>) -> String {
    loop {
        let id = format!("{:08x}", rand::random::<u32>());
        if !taken.contains(&id) {
            return id;
        }
    }
}

fn run_spec(id: &str, request: &DeployLlm, image: &str, model_path: &Path) -> RunSpec {
    let mut spec = RunSpec::new(image, format!("inferadmin-llm-{id}"));
    spec.labels.insert("deployment-type".to_string(), "llm".to_string());
    spec.labels.insert("deployment-id".to_string(), id.to_string());
    spec.ports.push(PortBinding::public(request.host_port, VLLM_PORT));
    spec.volumes.push(VolumeMount {
        source: model_path.display().to_string(),
        target: MODEL_MOUNT.to_string(),
        read_only: true,
    });
    spec.gpus = if request.gpu_ids.is_empty() {
        GpuRequest::All
    } else {
        GpuRequest::Devices(request.gpu_ids.iter().map(u32::to_string).collect())
    };
    match request.engine {
        LlmEngine::Vllm => {
            spec.command = vec![
                "python".to_string(),
                "-m".to_string(),
                "vllm.entrypoints.api_server".to_string(),
                "--model".to_string(),
                MODEL_MOUNT.to_string(),
                "--tensor-parallel-size".to_string(),
                request.tensor_parallel_size.to_string(),
                "--max-model-len".to_string(),
                request.max_model_len.to_string(),
                "--host".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                VLLM_PORT.to_string(),
            ];
        }
    }
    spec
}
