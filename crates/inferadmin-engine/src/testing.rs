//! In-memory `ContainerEngine` for tests.
//!
//! Records every call so tests can assert on how many round trips a code
//! path made, and can inject failures into batch or per-container queries.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use inferadmin_state::{ContainerId, ContainerStatus};

use crate::client::{split_reference, ContainerEngine, PulledImage, RunSpec, MANAGED_TAG_SUFFIX};
use crate::error::{EngineError, EngineResult};

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Version,
    ListStatuses(Vec<ContainerId>),
    GetStatus(String),
    Run(String),
    Start(String),
    Stop(String),
    Remove(String),
    Logs(String),
    PullImage(String),
    RemoveImage(String),
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub status: ContainerStatus,
    pub logs: String,
    pub spec: Option<RunSpec>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<ContainerId, FakeContainer>,
    images: HashMap<String, PulledImage>,
    calls: Vec<EngineCall>,
    fail_batch: bool,
    fail_run: bool,
    failing_status: HashSet<ContainerId>,
    logs_delay: Option<Duration>,
    next_id: u64,
}

/// A container engine that lives entirely in memory.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an existing container.
    pub fn with_container(self, id: &str, status: ContainerStatus) -> Self {
        self.lock().containers.insert(
            id.to_string(),
            FakeContainer {
                status,
                logs: String::new(),
                spec: None,
            },
        );
        self
    }

    /// Make every `list_statuses` call fail.
    pub fn failing_batch(self) -> Self {
        self.lock().fail_batch = true;
        self
    }

    /// Make `get_status` fail with a non-not-found error for `id`.
    pub fn failing_status(self, id: &str) -> Self {
        self.lock().failing_status.insert(id.to_string());
        self
    }

    /// Make every `run` call fail.
    pub fn failing_run(self) -> Self {
        self.lock().fail_run = true;
        self
    }

    /// Hold every `logs` call for `delay` after the logs have been read.
    pub fn slow_logs(self, delay: Duration) -> Self {
        self.lock().logs_delay = Some(delay);
        self
    }

    pub fn set_logs(&self, id: &str, logs: &str) {
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.logs = logs.to_string();
        }
    }

    /// Change a container's status behind the control plane's back.
    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.status = status;
        }
    }

    /// Drop a container behind the control plane's back.
    pub fn forget(&self, id: &str) {
        self.lock().containers.remove(id);
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.lock().containers.get(id).cloned()
    }

    pub fn has_image(&self, id: &str) -> bool {
        self.lock().images.contains_key(id)
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

impl ContainerEngine for FakeEngine {
    fn version(&self) -> EngineResult<String> {
        self.lock().calls.push(EngineCall::Version);
        Ok("fake-1.0".to_string())
    }

    fn list_statuses(&self, ids: &[ContainerId]) -> EngineResult<HashMap<ContainerId, ContainerStatus>> {
        let mut state = self.lock();
        state.calls.push(EngineCall::ListStatuses(ids.to_vec()));
        if state.fail_batch {
            return Err(EngineError::Command("batch queries unavailable".to_string()));
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.containers.get(id).map(|c| (id.clone(), c.status)))
            .collect())
    }

    fn get_status(&self, id: &str) -> EngineResult<ContainerStatus> {
        let mut state = self.lock();
        state.calls.push(EngineCall::GetStatus(id.to_string()));
        if state.failing_status.contains(id) {
            return Err(EngineError::Command(format!("cannot inspect {id}")));
        }
        state
            .containers
            .get(id)
            .map(|c| c.status)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    fn run(&self, spec: &RunSpec) -> EngineResult<ContainerId> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Run(spec.name.clone()));
        if state.fail_run {
            return Err(EngineError::ImageNotFound(spec.image.clone()));
        }
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                status: ContainerStatus::Running,
                logs: String::new(),
                spec: Some(spec.clone()),
            },
        );
        Ok(id)
    }

    fn start(&self, id: &str) -> EngineResult<()> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Start(id.to_string()));
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        container.status = ContainerStatus::Running;
        Ok(())
    }

    fn stop(&self, id: &str, _grace: Duration) -> EngineResult<()> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Stop(id.to_string()));
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        container.status = ContainerStatus::Exited;
        Ok(())
    }

    fn remove(&self, id: &str) -> EngineResult<()> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Remove(id.to_string()));
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    fn logs(&self, id: &str, tail: Option<usize>) -> EngineResult<String> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Logs(id.to_string()));
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let logs = match tail {
            Some(n) => {
                let lines: Vec<&str> = container.logs.lines().collect();
                lines[lines.len().saturating_sub(n)..].join("\n")
            }
            None => container.logs.clone(),
        };
        let delay = state.logs_delay;
        drop(state);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(logs)
    }

    fn pull_image(&self, reference: &str) -> EngineResult<PulledImage> {
        let mut state = self.lock();
        state.calls.push(EngineCall::PullImage(reference.to_string()));
        if reference.starts_with("missing/") {
            return Err(EngineError::ImageNotFound(reference.to_string()));
        }
        let (repository, tag) = split_reference(reference);
        let image = PulledImage {
            id: format!("sha256:{repository}-{tag}"),
            reference: reference.to_string(),
            managed_tag: format!("{reference}{MANAGED_TAG_SUFFIX}"),
            created: None,
            size_bytes: 4096,
        };
        state.images.insert(image.id.clone(), image.clone());
        Ok(image)
    }

    fn remove_image(&self, id: &str) -> EngineResult<()> {
        let mut state = self.lock();
        state.calls.push(EngineCall::RemoveImage(id.to_string()));
        state
            .images
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::ImageNotFound(id.to_string()))
    }
}
