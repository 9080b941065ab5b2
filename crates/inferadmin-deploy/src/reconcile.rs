//! Reconciliation: refresh stored status fields from the container engine.
//!
//! ```text
//!   records ──► distinct runtime refs ──► list_statuses(refs)   (one call)
//!                                              │
//!                                ok ◄──────────┴──────────► failed
//!                                │                             │
//!                 missing ref → not_found        get_status(ref) per ref,
//!                                │               at most io_pool_size at once
//!                                │               NotFound → not_found
//!                                │               other    → error
//!                                ▼                             ▼
//!                        statuses written back in input order
//! ```
//!
//! The stored documents are never rewritten here: reconciled status is a
//! view over the current engine state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use inferadmin_dispatch::PoolKind;
use inferadmin_state::{Application, ContainerId, ContainerStatus, LlmDeployment, Record};
use tracing::{debug, warn};

use crate::backend::Backend;

/// A record that may point at a live container.
pub trait Reconcilable: Record {
    /// The container this record describes, if any.
    fn runtime_ref(&self) -> Option<&str>;

    fn set_status(&mut self, status: ContainerStatus);
}

impl Reconcilable for Application {
    fn runtime_ref(&self) -> Option<&str> {
        Some(self.id.as_str())
    }

    fn set_status(&mut self, status: ContainerStatus) {
        self.status = status;
    }
}

impl Reconcilable for LlmDeployment {
    fn runtime_ref(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    fn set_status(&mut self, status: ContainerStatus) {
        self.status = status;
    }
}

/// How a reconciliation pass obtained its statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// No record had a runtime reference; the engine was not asked.
    Skipped,
    Batched,
    /// The batch query failed and each reference was queried on its own.
    PerItem,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub mode: ReconcileMode,
    pub records: usize,
    pub references: usize,
    pub not_found: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    backend: Backend,
}

impl Reconciler {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// Return `records` with their status replaced by the engine's view.
    pub async fn reconcile<T: Reconcilable>(&self, records: Vec<T>) -> Vec<T> {
        self.reconcile_with_outcome(records).await.0
    }

    pub async fn reconcile_with_outcome<T: Reconcilable>(
        &self,
        mut records: Vec<T>,
    ) -> (Vec<T>, ReconcileOutcome) {
        let refs = distinct_refs(&records);
        if refs.is_empty() {
            let outcome = ReconcileOutcome {
                mode: ReconcileMode::Skipped,
                records: records.len(),
                references: 0,
                not_found: 0,
                errors: 0,
            };
            return (records, outcome);
        }

        let (statuses, mode) = match self.query_batch(&refs).await {
            Ok(found) => (fill_missing(&refs, found), ReconcileMode::Batched),
            Err(reason) => {
                warn!(
                    collection = T::COLLECTION,
                    references = refs.len(),
                    error = %reason,
                    "batched status query failed, querying containers one by one"
                );
                (self.query_each(&refs).await, ReconcileMode::PerItem)
            }
        };

        for record in records.iter_mut() {
            let Some(id) = runtime_ref(record).map(str::to_string) else {
                continue;
            };
            if let Some(status) = statuses.get(&id) {
                record.set_status(*status);
            }
        }

        let outcome = ReconcileOutcome {
            mode,
            records: records.len(),
            references: refs.len(),
            not_found: statuses
                .values()
                .filter(|s| **s == ContainerStatus::NotFound)
                .count(),
            errors: statuses
                .values()
                .filter(|s| **s == ContainerStatus::Error)
                .count(),
        };
        debug!(collection = T::COLLECTION, ?outcome, "reconciled");
        (records, outcome)
    }

    /// Status of a single container. Never fails: a missing container is
    /// `not_found`, any other failure is `error`.
    pub async fn status_of(&self, id: &str) -> ContainerStatus {
        let engine = Arc::clone(self.backend.engine());
        let query = id.to_string();
        let result = self
            .backend
            .dispatcher()
            .run(PoolKind::Io, move || engine.get_status(&query))
            .await;
        match result {
            Ok(Ok(status)) => status,
            Ok(Err(e)) if e.is_not_found() => ContainerStatus::NotFound,
            Ok(Err(e)) => {
                warn!(container = %id, error = %e, "status query failed");
                ContainerStatus::Error
            }
            Err(e) => {
                warn!(container = %id, error = %e, "status query could not be dispatched");
                ContainerStatus::Error
            }
        }
    }

    async fn query_batch(
        &self,
        refs: &[ContainerId],
    ) -> Result<HashMap<ContainerId, ContainerStatus>, String> {
        let ids = refs.to_vec();
        let engine = Arc::clone(self.backend.engine());
        match self
            .backend
            .dispatcher()
            .run(PoolKind::Io, move || engine.list_statuses(&ids))
            .await
        {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Query every reference, keeping at most one I/O pool's worth of
    /// queries in flight so the fallback never saturates the queue itself.
    async fn query_each(&self, refs: &[ContainerId]) -> HashMap<ContainerId, ContainerStatus> {
        let in_flight = self.backend.dispatcher().config().io_pool_size.max(1);
        stream::iter(refs)
            .map(|id| async move { (id.clone(), self.status_of(id).await) })
            .buffer_unordered(in_flight)
            .collect()
            .await
    }
}

fn runtime_ref<T: Reconcilable>(record: &T) -> Option<&str> {
    record.runtime_ref().filter(|r| !r.is_empty())
}

fn distinct_refs<T: Reconcilable>(records: &[T]) -> Vec<ContainerId> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter_map(runtime_ref)
        .filter(|r| seen.insert(*r))
        .map(str::to_string)
        .collect()
}

fn fill_missing(
    refs: &[ContainerId],
    mut found: HashMap<ContainerId, ContainerStatus>,
) -> HashMap<ContainerId, ContainerStatus> {
    for id in refs {
        found.entry(id.clone()).or_insert(ContainerStatus::NotFound);
    }
    found
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use inferadmin_dispatch::{Dispatcher, DispatcherConfig};
    use inferadmin_engine::testing::{EngineCall, FakeEngine};
    use inferadmin_state::{AppType, LlmEngine};

    use super::*;

    fn app(id: &str, status: ContainerStatus) -> Application {
        Application {
            id: id.to_string(),
            name: format!("app-{id}"),
            status,
            app_type: AppType::OpenWebUi,
            deployed_at: Utc::now(),
            host_port: 3000,
            gpu_uuids: None,
            logs: None,
        }
    }

    fn llm(id: &str, container: Option<&str>) -> LlmDeployment {
        LlmDeployment {
            id: id.to_string(),
            model_name: "org/model".to_string(),
            engine: LlmEngine::Vllm,
            image_id: "sha256:abc".to_string(),
            deployed_at: Utc::now(),
            status: ContainerStatus::Starting,
            container_id: container.map(str::to_string),
            host_port: 8000,
            gpu_ids: vec![0],
            logs: None,
        }
    }

    fn reconciler(engine: FakeEngine) -> (Reconciler, Arc<FakeEngine>) {
        let engine = Arc::new(engine);
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()));
        let backend = Backend::new(engine.clone(), dispatcher);
        (Reconciler::new(backend), engine)
    }

    fn statuses(apps: &[Application]) -> Vec<ContainerStatus> {
        apps.iter().map(|a| a.status).collect()
    }

    #[tokio::test]
    async fn batch_result_is_applied_in_input_order() {
        let (reconciler, engine) = reconciler(
            FakeEngine::new()
                .with_container("c1", ContainerStatus::Exited)
                .with_container("c2", ContainerStatus::Running),
        );
        let records = vec![
            app("c2", ContainerStatus::Starting),
            app("c1", ContainerStatus::Running),
        ];

        let (out, outcome) = reconciler.reconcile_with_outcome(records).await;

        assert_eq!(out[0].id, "c2");
        assert_eq!(out[1].id, "c1");
        assert_eq!(statuses(&out), vec![ContainerStatus::Running, ContainerStatus::Exited]);
        assert_eq!(outcome.mode, ReconcileMode::Batched);
        assert_eq!(engine.count(|c| matches!(c, EngineCall::ListStatuses(_))), 1);
        assert_eq!(engine.count(|c| matches!(c, EngineCall::GetStatus(_))), 0);
    }

    #[tokio::test]
    async fn refs_missing_from_batch_are_not_found() {
        let (reconciler, _) =
            reconciler(FakeEngine::new().with_container("c1", ContainerStatus::Running));
        let records = vec![
            app("c1", ContainerStatus::Starting),
            app("gone", ContainerStatus::Running),
        ];

        let (out, outcome) = reconciler.reconcile_with_outcome(records).await;

        assert_eq!(statuses(&out), vec![ContainerStatus::Running, ContainerStatus::NotFound]);
        assert_eq!(outcome.not_found, 1);
    }

    #[tokio::test]
    async fn failed_batch_falls_back_to_every_reference() {
        let (reconciler, engine) = reconciler(
            FakeEngine::new()
                .failing_batch()
                .with_container("c1", ContainerStatus::Running)
                .with_container("c2", ContainerStatus::Paused)
                .failing_status("c3")
                .with_container("c3", ContainerStatus::Running),
        );
        let records = vec![
            app("c1", ContainerStatus::Starting),
            app("c2", ContainerStatus::Starting),
            app("c3", ContainerStatus::Starting),
            app("c4", ContainerStatus::Running),
        ];

        let (out, outcome) = reconciler.reconcile_with_outcome(records).await;

        assert_eq!(
            statuses(&out),
            vec![
                ContainerStatus::Running,
                ContainerStatus::Paused,
                ContainerStatus::Error,
                ContainerStatus::NotFound,
            ]
        );
        assert_eq!(outcome.mode, ReconcileMode::PerItem);
        assert_eq!(outcome.not_found, 1);
        assert_eq!(outcome.errors, 1);

        let mut queried: Vec<String> = engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::GetStatus(id) => Some(id),
                _ => None,
            })
            .collect();
        queried.sort();
        assert_eq!(queried, vec!["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn records_without_container_pass_through() {
        let (reconciler, engine) =
            reconciler(FakeEngine::new().with_container("abc", ContainerStatus::Running));
        let records = vec![llm("d1", None), llm("d2", Some("")), llm("d3", Some("abc"))];

        let out = reconciler.reconcile(records).await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].status, ContainerStatus::Starting);
        assert_eq!(out[1].status, ContainerStatus::Starting);
        assert_eq!(out[2].status, ContainerStatus::Running);
        assert_eq!(
            engine.calls(),
            vec![EngineCall::ListStatuses(vec!["abc".to_string()])]
        );
    }

    #[tokio::test]
    async fn nothing_to_reconcile_skips_the_engine() {
        let (reconciler, engine) = reconciler(FakeEngine::new());

        let (out, outcome) = reconciler
            .reconcile_with_outcome(vec![llm("d1", None)])
            .await;

        assert_eq!(out.len(), 1);
        assert_eq!(outcome.mode, ReconcileMode::Skipped);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn shared_reference_is_queried_once() {
        let (reconciler, engine) = reconciler(
            FakeEngine::new()
                .failing_batch()
                .with_container("c1", ContainerStatus::Running),
        );
        let records = vec![llm("d1", Some("c1")), llm("d2", Some("c1"))];

        let out = reconciler.reconcile(records).await;

        assert!(out.iter().all(|r| r.status == ContainerStatus::Running));
        assert_eq!(engine.count(|c| matches!(c, EngineCall::GetStatus(_))), 1);
    }

    #[tokio::test]
    async fn fallback_with_more_references_than_queue_slots_reports_live_status() {
        let mut engine = FakeEngine::new().failing_batch();
        let mut records = Vec::new();
        for i in 0..60 {
            let id = format!("c{i}");
            engine = engine.with_container(&id, ContainerStatus::Running);
            records.push(app(&id, ContainerStatus::Starting));
        }
        let engine = Arc::new(engine);
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig {
            io_pool_size: 2,
            queue_capacity: 4,
            ..DispatcherConfig::default()
        }));
        let reconciler = Reconciler::new(Backend::new(engine.clone(), dispatcher));

        let (out, outcome) = reconciler.reconcile_with_outcome(records).await;

        assert_eq!(outcome.mode, ReconcileMode::PerItem);
        assert_eq!(outcome.errors, 0);
        assert!(out.iter().all(|r| r.status == ContainerStatus::Running));
        assert_eq!(engine.count(|c| matches!(c, EngineCall::GetStatus(_))), 60);
    }

    #[tokio::test]
    async fn dispatcher_shutdown_marks_records_as_error() {
        let (reconciler, _) =
            reconciler(FakeEngine::new().with_container("c1", ContainerStatus::Running));
        reconciler.backend.dispatcher().shutdown().await;

        let out = reconciler.reconcile(vec![app("c1", ContainerStatus::Running)]).await;

        assert_eq!(out[0].status, ContainerStatus::Error);
    }

    #[tokio::test]
    async fn status_of_missing_container_is_not_found() {
        let (reconciler, _) = reconciler(FakeEngine::new());
        assert_eq!(reconciler.status_of("nope").await, ContainerStatus::NotFound);
    }
}
