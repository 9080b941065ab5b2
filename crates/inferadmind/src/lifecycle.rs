//! Lifecycle: builds every subsystem in order and tears them down in reverse.
//!
//! ```text
//!   start:    config ─► logging ─► Dispatcher ─► engine client ─► state dir ─► services
//!   shutdown: stop signal ─► drain Dispatcher ─► release engine client
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use inferadmin_deploy::{ApplicationService, Backend, ImageService, LlmService, ModelService};
use inferadmin_dispatch::{Dispatcher, PoolKind, ShutdownReport};
use inferadmin_engine::{ContainerEngine, DockerCli};
use inferadmin_state::{ContainerStatus, StateDir};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{InferAdminConfig, DEFAULT_LOG_FILTER};

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Logs go to stderr; stdout carries command output. Calling this more than
/// once is harmless.
pub fn init_logging(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Counts from one reconciliation pass of the watch loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchReport {
    pub applications: usize,
    pub llms: usize,
    pub running: usize,
    pub missing: usize,
}

pub struct Lifecycle {
    config: InferAdminConfig,
    dispatcher: Arc<Dispatcher>,
    engine: Arc<dyn ContainerEngine>,
    applications: ApplicationService,
    llms: LlmService,
    images: ImageService,
    models: ModelService,
    shutdown_tx: watch::Sender<bool>,
}

impl Lifecycle {
    /// Start against the docker CLI named in the config.
    pub async fn start(config: InferAdminConfig) -> anyhow::Result<Self> {
        config.validate()?;
        init_logging(&config.log_filter, config.log_json);
        let dispatcher = Arc::new(Dispatcher::start(config.dispatcher())?);
        let engine: Arc<dyn ContainerEngine> =
            Arc::new(DockerCli::new(config.docker_binary.clone(), config.engine_timeout()));
        Self::assemble(config, dispatcher, engine).await
    }

    /// Start against an already constructed engine client.
    pub async fn start_with_engine(
        config: InferAdminConfig,
        engine: Arc<dyn ContainerEngine>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        init_logging(&config.log_filter, config.log_json);
        let dispatcher = Arc::new(Dispatcher::start(config.dispatcher())?);
        Self::assemble(config, dispatcher, engine).await
    }

    async fn assemble(
        config: InferAdminConfig,
        dispatcher: Arc<Dispatcher>,
        engine: Arc<dyn ContainerEngine>,
    ) -> anyhow::Result<Self> {
        info!(
            io_workers = ?dispatcher.pool_size(PoolKind::Io),
            cpu_workers = ?dispatcher.pool_size(PoolKind::Cpu),
            "dispatcher started"
        );

        // An unreachable engine is not fatal: records still list, with
        // status `error` until it comes back.
        let probe = Arc::clone(&engine);
        match dispatcher.run(PoolKind::Io, move || probe.version()).await {
            Ok(Ok(version)) => info!(%version, "container engine reachable"),
            Ok(Err(e)) => warn!(error = %e, "container engine unreachable"),
            Err(e) => warn!(error = %e, "container engine probe could not be dispatched"),
        }

        let state = StateDir::new(&config.state_dir);
        let backend = Backend::new(Arc::clone(&engine), Arc::clone(&dispatcher));
        let images = ImageService::new(state.images()?, backend.clone());
        let applications = ApplicationService::new(state.applications()?, images.clone(), backend.clone());
        let llms = LlmService::new(
            state.llms()?,
            images.clone(),
            backend.clone(),
            config.model_storage_path.clone(),
        );
        let models = ModelService::new(backend, config.model_storage_path.clone());
        info!(state_dir = ?config.state_dir, "state directory opened");

        let (shutdown_tx, _) = watch::channel(false);
        info!("inferadmin started");
        Ok(Self {
            config,
            dispatcher,
            engine,
            applications,
            llms,
            images,
            models,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &InferAdminConfig {
        &self.config
    }

    pub fn applications(&self) -> &ApplicationService {
        &self.applications
    }

    pub fn llms(&self) -> &LlmService {
        &self.llms
    }

    pub fn images(&self) -> &ImageService {
        &self.images
    }

    pub fn models(&self) -> &ModelService {
        &self.models
    }

    /// Resolves to `true` once shutdown has been requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Reconcile every collection once and summarize the result.
    pub async fn reconcile_once(&self) -> anyhow::Result<WatchReport> {
        let applications = self.applications.list().await?;
        let llms = self.llms.list().await?;
        let statuses = applications
            .iter()
            .map(|a| a.status)
            .chain(llms.iter().map(|l| l.status));

        let mut report = WatchReport {
            applications: applications.len(),
            llms: llms.len(),
            ..WatchReport::default()
        };
        for status in statuses {
            match status {
                ContainerStatus::Running => report.running += 1,
                ContainerStatus::NotFound => report.missing += 1,
                _ => {}
            }
        }
        Ok(report)
    }

    /// Reconcile every `interval` until `stop` resolves, then raise the
    /// shutdown signal.
    pub async fn watch(&self, interval: Duration, stop: impl Future<Output = ()>) {
        tokio::pin!(stop);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    info!("shutdown signal received");
                    break;
                }
                _ = ticker.tick() => match self.reconcile_once().await {
                    Ok(report) => info!(
                        applications = report.applications,
                        llms = report.llms,
                        running = report.running,
                        missing = report.missing,
                        "reconciled"
                    ),
                    Err(e) => warn!(error = %e, "reconciliation pass failed"),
                },
            }
        }
        self.shutdown_tx.send_replace(true);
    }

    /// Drain the dispatcher and release the engine client.
    pub async fn shutdown(self) -> ShutdownReport {
        self.shutdown_tx.send_replace(true);
        let Self {
            dispatcher,
            engine,
            applications,
            llms,
            images,
            ..
        } = self;

        drop((applications, llms, images));
        let report = dispatcher.shutdown().await;
        drop(engine);
        info!(
            workers = report.workers,
            timed_out = report.timed_out,
            "inferadmin stopped"
        );
        report
    }
}
