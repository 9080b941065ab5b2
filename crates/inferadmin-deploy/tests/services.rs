//! End-to-end service flows against an on-disk state directory and an
//! in-memory container engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use inferadmin_deploy::{
    ApplicationService, Backend, DeployApplication, DeployError, DeployLlm, ImageService,
    LlmService,
};
use inferadmin_dispatch::{Dispatcher, DispatcherConfig};
use inferadmin_engine::testing::{EngineCall, FakeEngine};
use inferadmin_engine::GpuRequest;
use inferadmin_state::{AppType, Application, ContainerStatus, LlmEngine, StateDir, StateError};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    engine: Arc<FakeEngine>,
    apps: ApplicationService,
    llms: LlmService,
    images: ImageService,
}

impl Harness {
    fn new(engine: FakeEngine) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path().join("state"));
        std::fs::create_dir_all(dir.path().join("models")).unwrap();

        let engine = Arc::new(engine);
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()));
        let backend = Backend::new(engine.clone(), dispatcher);
        let images = ImageService::new(state.images().unwrap(), backend.clone());
        let apps = ApplicationService::new(state.applications().unwrap(), images.clone(), backend.clone());
        let llms = LlmService::new(
            state.llms().unwrap(),
            images.clone(),
            backend,
            dir.path().join("models"),
        );

        Self {
            dir,
            engine,
            apps,
            llms,
            images,
        }
    }

    fn state(&self) -> StateDir {
        StateDir::new(self.dir.path().join("state"))
    }

    fn model(&self, dir_name: &str) -> PathBuf {
        let path = self.dir.path().join("models").join(dir_name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }
}

fn webui(image: &str) -> DeployApplication {
    DeployApplication {
        name: "chat".to_string(),
        app_type: AppType::OpenWebUi,
        image: image.to_string(),
        host_port: 3001,
        environment: Default::default(),
        gpu_uuids: None,
    }
}

fn vllm(model: &str, image: &str) -> DeployLlm {
    DeployLlm {
        model_name: model.to_string(),
        engine: LlmEngine::Vllm,
        image: image.to_string(),
        host_port: 8001,
        gpu_ids: vec![1],
        tensor_parallel_size: 1,
        max_model_len: 4096,
    }
}

const WEBUI: &str = "ghcr.io/open-webui/open-webui:main";
const VLLM: &str = "vllm/vllm-openai:v0.8.0";

#[tokio::test]
async fn application_lifecycle() {
    let h = Harness::new(FakeEngine::new());
    h.images.pull(WEBUI).await.unwrap();

    let app = h.apps.deploy(webui(WEBUI)).await.unwrap();
    assert_eq!(app.status, ContainerStatus::Starting);

    let spec = h.engine.container(&app.id).unwrap().spec.unwrap();
    assert_eq!(spec.image, "ghcr.io/open-webui/open-webui:main-inferadmin");
    assert_eq!(spec.name, "inferadmin-app-chat");

    // The stored record keeps the deploy-time status; list shows the live one.
    let stored = h.state().applications().unwrap().require(&app.id).unwrap();
    assert_eq!(stored.status, ContainerStatus::Starting);
    let listed = h.apps.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, ContainerStatus::Running);

    h.apps.stop(&app.id).await.unwrap();
    assert_eq!(h.apps.get(&app.id).await.unwrap().status, ContainerStatus::Exited);
    h.apps.start(&app.id).await.unwrap();
    assert_eq!(h.apps.get(&app.id).await.unwrap().status, ContainerStatus::Running);

    h.apps.delete(&app.id).await.unwrap();
    assert!(h.engine.container(&app.id).is_none());
    assert!(h.apps.list().await.unwrap().is_empty());
    assert!(matches!(
        h.apps.delete(&app.id).await,
        Err(DeployError::NotFound { .. })
    ));
}

#[tokio::test]
async fn deploy_requires_a_managed_image() {
    let h = Harness::new(FakeEngine::new());

    let result = h.apps.deploy(webui(WEBUI)).await;

    assert!(matches!(result, Err(DeployError::ImageNotManaged(_))));
    assert_eq!(h.engine.count(|c| matches!(c, EngineCall::Run(_))), 0);
    assert!(h.apps.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_persist_removes_the_new_container() {
    let h = Harness::new(FakeEngine::new());
    h.images.pull(WEBUI).await.unwrap();

    // The fake engine hands out sequential ids; occupy the first one.
    let first_id = format!("{:064x}", 1);
    h.state()
        .applications()
        .unwrap()
        .add(Application {
            id: first_id.clone(),
            name: "other".to_string(),
            status: ContainerStatus::Exited,
            app_type: AppType::OpenWebUi,
            deployed_at: Utc::now(),
            host_port: 3000,
            gpu_uuids: None,
            logs: None,
        })
        .unwrap();

    let result = h.apps.deploy(webui(WEBUI)).await;

    assert!(matches!(
        result,
        Err(DeployError::State(StateError::DuplicateId(_)))
    ));
    assert!(h.engine.container(&first_id).is_none());
    assert_eq!(h.engine.count(|c| matches!(c, EngineCall::Remove(_))), 1);
    let stored = h.state().applications().unwrap().list_all();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "other");
}

#[tokio::test]
async fn delete_tolerates_a_container_removed_elsewhere() {
    let h = Harness::new(FakeEngine::new());
    h.images.pull(WEBUI).await.unwrap();
    let app = h.apps.deploy(webui(WEBUI)).await.unwrap();
    h.engine.forget(&app.id);

    assert_eq!(h.apps.get(&app.id).await.unwrap().status, ContainerStatus::NotFound);
    h.apps.delete(&app.id).await.unwrap();

    assert!(h.state().applications().unwrap().list_all().is_empty());
}

#[tokio::test]
async fn logs_are_written_back_to_the_record() {
    let h = Harness::new(FakeEngine::new());
    h.images.pull(WEBUI).await.unwrap();
    let app = h.apps.deploy(webui(WEBUI)).await.unwrap();
    h.engine.set_logs(&app.id, "one\ntwo\nthree");

    let logs = h.apps.logs(&app.id, Some(2)).await.unwrap();

    assert_eq!(logs, "two\nthree");
    let stored = h.state().applications().unwrap().require(&app.id).unwrap();
    assert_eq!(stored.logs.as_deref(), Some("two\nthree"));
}

#[tokio::test]
async fn delete_during_log_fetch_stays_deleted() {
    let h = Harness::new(FakeEngine::new().slow_logs(Duration::from_millis(300)));
    h.images.pull(WEBUI).await.unwrap();
    let app = h.apps.deploy(webui(WEBUI)).await.unwrap();

    let fetch = tokio::spawn({
        let apps = h.apps.clone();
        let id = app.id.clone();
        async move { apps.logs(&id, None).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.apps.delete(&app.id).await.unwrap();

    let result = fetch.await.unwrap();
    assert!(matches!(result, Err(DeployError::NotFound { .. })));
    assert!(h.state().applications().unwrap().list_all().is_empty());
}

#[tokio::test]
async fn llm_delete_during_log_fetch_stays_deleted() {
    let h = Harness::new(FakeEngine::new().slow_logs(Duration::from_millis(300)));
    h.images.pull(VLLM).await.unwrap();
    h.model("org_model");
    let deployment = h.llms.deploy(vllm("org/model", VLLM)).await.unwrap();

    let fetch = tokio::spawn({
        let llms = h.llms.clone();
        let id = deployment.id.clone();
        async move { llms.logs(&id, None).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.llms.delete(&deployment.id).await.unwrap();

    let result = fetch.await.unwrap();
    assert!(matches!(result, Err(DeployError::NotFound { .. })));
    assert!(h.state().llms().unwrap().list_all().is_empty());
}

#[tokio::test]
async fn list_falls_back_when_batch_query_fails() {
    let h = Harness::new(FakeEngine::new().failing_batch());
    h.images.pull(WEBUI).await.unwrap();
    let kept = h.apps.deploy(webui(WEBUI)).await.unwrap();
    let mut second = webui(WEBUI);
    second.name = "chat-2".to_string();
    let gone = h.apps.deploy(second).await.unwrap();
    h.engine.forget(&gone.id);
    h.engine.clear_calls();

    let listed = h.apps.list().await.unwrap();

    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, kept.id);
    assert_eq!(listed[0].status, ContainerStatus::Running);
    assert_eq!(listed[1].status, ContainerStatus::NotFound);
    assert_eq!(h.engine.count(|c| matches!(c, EngineCall::GetStatus(_))), 2);
}

#[tokio::test]
async fn llm_lifecycle() {
    let h = Harness::new(FakeEngine::new());
    let image = h.images.pull(VLLM).await.unwrap();
    let model_path = h.model("org_model");

    let deployment = h.llms.deploy(vllm("org/model", VLLM)).await.unwrap();

    assert_eq!(deployment.id.len(), 8);
    assert_eq!(deployment.image_id, image.id);
    assert_eq!(deployment.status, ContainerStatus::Starting);
    let container = deployment.container_id.clone().unwrap();
    let spec = h.engine.container(&container).unwrap().spec.unwrap();
    assert_eq!(spec.name, format!("inferadmin-llm-{}", deployment.id));
    assert_eq!(spec.volumes[0].source, model_path.display().to_string());
    assert!(spec.volumes[0].read_only);
    assert_eq!(spec.gpus, GpuRequest::Devices(vec!["1".to_string()]));

    let listed = h.llms.list().await.unwrap();
    assert_eq!(listed[0].status, ContainerStatus::Running);
    assert_eq!(h.llms.get(&deployment.id).await.unwrap().status, ContainerStatus::Running);

    h.engine.set_logs(&container, "loading weights");
    assert_eq!(h.llms.logs(&deployment.id, None).await.unwrap(), "loading weights");
    let stored = h.state().llms().unwrap().require(&deployment.id).unwrap();
    assert_eq!(stored.logs.as_deref(), Some("loading weights"));

    h.llms.delete(&deployment.id).await.unwrap();
    assert!(h.engine.container(&container).is_none());
    assert!(h.llms.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn llm_deploy_requires_model_directory() {
    let h = Harness::new(FakeEngine::new());
    h.images.pull(VLLM).await.unwrap();

    let result = h.llms.deploy(vllm("org/absent", VLLM)).await;

    assert!(matches!(result, Err(DeployError::ModelNotFound(_))));
    assert_eq!(h.engine.count(|c| matches!(c, EngineCall::Run(_))), 0);
}

#[tokio::test]
async fn failed_run_leaves_no_record() {
    let h = Harness::new(FakeEngine::new().failing_run());
    h.images.pull(VLLM).await.unwrap();
    h.model("org_model");

    let result = h.llms.deploy(vllm("org/model", VLLM)).await;

    assert!(matches!(result, Err(DeployError::Engine(_))));
    assert!(h.state().llms().unwrap().list_all().is_empty());
}

#[tokio::test]
async fn image_pull_and_remove() {
    let h = Harness::new(FakeEngine::new());

    let image = h.images.pull(VLLM).await.unwrap();
    assert_eq!(image.repository, "vllm/vllm-openai");
    assert_eq!(image.tag, "v0.8.0");
    assert_eq!(image.managed_tag, "vllm/vllm-openai:v0.8.0-inferadmin");

    // Pulling again refreshes the record instead of duplicating it.
    h.images.pull(VLLM).await.unwrap();
    assert_eq!(h.images.list().await.unwrap().len(), 1);

    let resolved = h.images.resolve_managed("vllm/vllm-openai:v0.8.0-inferadmin").await.unwrap();
    assert_eq!(resolved.id, image.id);

    h.images.remove(VLLM).await.unwrap();
    assert!(!h.engine.has_image(&image.id));
    assert!(h.images.list().await.unwrap().is_empty());
    assert!(matches!(
        h.images.remove(VLLM).await,
        Err(DeployError::ImageNotManaged(_))
    ));
}

#[tokio::test]
async fn pull_of_unknown_image_is_not_recorded() {
    let h = Harness::new(FakeEngine::new());

    let result = h.images.pull("missing/image:1").await;

    assert!(matches!(result, Err(DeployError::Engine(_))));
    assert!(h.images.list().await.unwrap().is_empty());
}
