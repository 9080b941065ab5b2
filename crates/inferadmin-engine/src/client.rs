//! The `ContainerEngine` trait and the request/response types it speaks.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use inferadmin_state::{ContainerId, ContainerStatus};

use crate::error::EngineResult;

/// Label key put on every container the control plane starts.
pub const MANAGED_BY_LABEL: &str = "managed-by";
/// Label value paired with [`MANAGED_BY_LABEL`].
pub const MANAGED_BY_VALUE: &str = "inferadmin";
/// Suffix of the extra tag marking a pulled image as managed.
pub const MANAGED_TAG_SUFFIX: &str = "-inferadmin";

/// Blocking container engine operations.
///
/// Implementations are shared process-wide behind an `Arc` and must not
/// keep mutable local state; every mutation happens engine-side.
pub trait ContainerEngine: Send + Sync + 'static {
    /// Engine server version. Used as a reachability check at startup.
    fn version(&self) -> EngineResult<String>;

    /// Status of many containers in one call.
    ///
    /// Containers that do not exist are simply absent from the map.
    fn list_statuses(&self, ids: &[ContainerId]) -> EngineResult<HashMap<ContainerId, ContainerStatus>>;

    /// Status of one container. Fails with `NotFound` if it does not exist.
    fn get_status(&self, id: &str) -> EngineResult<ContainerStatus>;

    /// Create and start a detached container, returning its id.
    fn run(&self, spec: &RunSpec) -> EngineResult<ContainerId>;

    fn start(&self, id: &str) -> EngineResult<()>;

    /// Stop a container, giving it `grace` to exit before it is killed.
    fn stop(&self, id: &str, grace: Duration) -> EngineResult<()>;

    /// Force-remove a container. Named volumes are kept.
    fn remove(&self, id: &str) -> EngineResult<()>;

    /// Timestamped logs, optionally only the last `tail` lines.
    fn logs(&self, id: &str, tail: Option<usize>) -> EngineResult<String>;

    /// Pull an image and add the managed tag.
    fn pull_image(&self, reference: &str) -> EngineResult<PulledImage>;

    fn remove_image(&self, id: &str) -> EngineResult<()>;
}

// ── Run spec ───────────────────────────────────────────────────────

/// Host port published for a container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
}

impl PortBinding {
    /// Publish `container_port` on all host interfaces at `host_port`.
    pub fn public(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: "0.0.0.0".to_string(),
            host_port,
            container_port,
        }
    }
}

/// Bind mount or named volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// Host path or volume name.
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// GPU access requested for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GpuRequest {
    #[default]
    None,
    All,
    Devices(Vec<String>),
}

/// Everything needed to start a container.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub command: Vec<String>,
    pub ports: Vec<PortBinding>,
    pub volumes: Vec<VolumeMount>,
    pub env: BTreeMap<String, String>,
    /// Extra labels; the managed-by label is always added.
    pub labels: BTreeMap<String, String>,
    pub gpus: GpuRequest,
}

impl RunSpec {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            command: Vec::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            gpus: GpuRequest::None,
        }
    }

    /// Labels including the managed-by marker.
    pub fn all_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels
    }
}

// ── Images ─────────────────────────────────────────────────────────

/// An image after a successful pull + managed tag.
#[derive(Debug, Clone, PartialEq)]
pub struct PulledImage {
    pub id: String,
    pub reference: String,
    pub managed_tag: String,
    pub created: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}

/// Split `repo[:tag]` into repository and tag (default `latest`).
///
/// A colon that belongs to a registry port (`host:5000/repo`) is not a tag.
pub fn split_reference(reference: &str) -> (String, String) {
    let name_start = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[name_start..].rfind(':') {
        Some(i) => {
            let at = name_start + i;
            (reference[..at].to_string(), reference[at + 1..].to_string())
        }
        None => (reference.to_string(), "latest".to_string()),
    }
}
