//! Startup, restart and shutdown of the whole control plane.

use std::sync::Arc;
use std::time::Duration;

use inferadmin_deploy::DeployApplication;
use inferadmin_engine::testing::{EngineCall, FakeEngine};
use inferadmin_state::{AppType, ContainerStatus};
use inferadmind::{InferAdminConfig, Lifecycle, WatchReport};

fn config(root: &std::path::Path) -> InferAdminConfig {
    InferAdminConfig {
        state_dir: root.join("state"),
        model_storage_path: root.join("models"),
        io_pool_size: 2,
        cpu_pool_size: 1,
        shutdown_timeout_secs: 5,
        ..InferAdminConfig::default()
    }
}

fn webui() -> DeployApplication {
    DeployApplication {
        name: "chat".to_string(),
        app_type: AppType::OpenWebUi,
        image: "ghcr.io/open-webui/open-webui:main".to_string(),
        host_port: 3000,
        environment: Default::default(),
        gpu_uuids: None,
    }
}

#[tokio::test]
async fn startup_probes_the_engine_and_creates_documents() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new());

    let lifecycle = Lifecycle::start_with_engine(config(dir.path()), engine.clone())
        .await
        .unwrap();

    assert_eq!(engine.calls(), vec![EngineCall::Version]);
    for name in ["applications.json", "llms.json", "images.json"] {
        let content = std::fs::read_to_string(dir.path().join("state").join(name)).unwrap();
        assert_eq!(content.trim(), "[]");
    }

    let report = lifecycle.shutdown().await;
    assert_eq!(report.workers, 3);
    assert!(!report.timed_out);
}

#[tokio::test]
async fn invalid_config_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.queue_capacity = 0;

    let result = Lifecycle::start_with_engine(config, Arc::new(FakeEngine::new())).await;

    assert!(result.is_err());
}

#[tokio::test]
async fn records_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new());

    let first = Lifecycle::start_with_engine(config(dir.path()), engine.clone())
        .await
        .unwrap();
    first
        .images()
        .pull("ghcr.io/open-webui/open-webui:main")
        .await
        .unwrap();
    let app = first.applications().deploy(webui()).await.unwrap();
    first.shutdown().await;

    let second = Lifecycle::start_with_engine(config(dir.path()), engine.clone())
        .await
        .unwrap();
    let apps = second.applications().list().await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].id, app.id);
    assert_eq!(apps[0].status, ContainerStatus::Running);
    assert_eq!(second.images().list().await.unwrap().len(), 1);
    second.shutdown().await;
}

#[tokio::test]
async fn reconcile_once_counts_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new());
    let lifecycle = Lifecycle::start_with_engine(config(dir.path()), engine.clone())
        .await
        .unwrap();
    lifecycle
        .images()
        .pull("ghcr.io/open-webui/open-webui:main")
        .await
        .unwrap();
    let kept = lifecycle.applications().deploy(webui()).await.unwrap();
    let mut other = webui();
    other.name = "chat-2".to_string();
    let gone = lifecycle.applications().deploy(other).await.unwrap();
    engine.forget(&gone.id);

    let report = lifecycle.reconcile_once().await.unwrap();

    assert_eq!(
        report,
        WatchReport {
            applications: 2,
            llms: 0,
            running: 1,
            missing: 1,
        }
    );
    assert!(engine.container(&kept.id).is_some());
    lifecycle.shutdown().await;
}

#[tokio::test]
async fn watch_stops_on_signal_and_raises_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new());
    let lifecycle = Lifecycle::start_with_engine(config(dir.path()), engine.clone())
        .await
        .unwrap();
    lifecycle
        .images()
        .pull("ghcr.io/open-webui/open-webui:main")
        .await
        .unwrap();
    lifecycle.applications().deploy(webui()).await.unwrap();
    engine.clear_calls();
    let signal = lifecycle.subscribe();
    assert!(!lifecycle.is_shutting_down());

    lifecycle
        .watch(
            Duration::from_millis(20),
            tokio::time::sleep(Duration::from_millis(150)),
        )
        .await;

    assert!(*signal.borrow());
    assert!(lifecycle.is_shutting_down());
    // The first tick fires immediately, so at least one pass ran.
    assert!(engine.count(|c| matches!(c, EngineCall::ListStatuses(_))) >= 1);
    lifecycle.shutdown().await;
}

#[tokio::test]
async fn models_in_storage_are_listed_and_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("models").join("org_model");
    std::fs::create_dir_all(&model).unwrap();
    for name in [
        "model.safetensors",
        "generation_config.json",
        "config.json",
        "tokenizer.json",
        "special_tokens_map.json",
        "tokenizer_config.json",
        "vocab.json",
    ] {
        std::fs::write(model.join(name), b"{}").unwrap();
    }
    let lifecycle = Lifecycle::start_with_engine(config(dir.path()), Arc::new(FakeEngine::new()))
        .await
        .unwrap();

    let listed = lifecycle.models().list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].repo_id, "org/model");

    lifecycle.models().delete("org/model").await.unwrap();
    assert!(!model.exists());
    assert!(lifecycle.models().list().await.unwrap().is_empty());
    lifecycle.shutdown().await;
}
