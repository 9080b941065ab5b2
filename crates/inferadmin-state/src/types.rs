//! Domain types persisted by the record store.
//!
//! All types round-trip through JSON. Timestamps serialize as RFC 3339
//! text; unknown fields in a stored document are ignored on read so older
//! binaries can read documents written by newer ones.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::Record;

/// Container id as reported by the container engine.
pub type ContainerId = String;

// ── Status ─────────────────────────────────────────────────────────

/// Lifecycle status of a container, as last observed.
///
/// `NotFound` and `Error` never come from the engine itself: they are
/// assigned during reconciliation when the container is gone or the
/// status lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Starting,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    NotFound,
    Error,
    Unknown,
}

impl ContainerStatus {
    /// Map an engine state string (`docker inspect` `.State.Status`) to a status.
    pub fn parse(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            "not_found" => Self::NotFound,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::NotFound => "not_found",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Application ────────────────────────────────────────────────────

/// Kinds of application the control plane knows how to deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    OpenWebUi,
}

/// A deployed application container (e.g. a chat front end).
///
/// The record id is the container id, so the record is its own runtime
/// reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub id: ContainerId,
    pub name: String,
    pub status: ContainerStatus,
    pub app_type: AppType,
    pub deployed_at: DateTime<Utc>,
    pub host_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_uuids: Option<Vec<String>>,
    /// Last fetched container logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

impl Record for Application {
    const COLLECTION: &'static str = "applications.json";

    fn id(&self) -> &str {
        &self.id
    }
}

// ── LLM deployment ─────────────────────────────────────────────────

/// Inference engines an LLM can be served with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmEngine {
    Vllm,
}

/// A model served by an inference engine container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmDeployment {
    /// Short deployment id (8 hex chars), independent of the container id.
    pub id: String,
    pub model_name: String,
    pub engine: LlmEngine,
    pub image_id: String,
    pub deployed_at: DateTime<Utc>,
    pub status: ContainerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<ContainerId>,
    pub host_port: u16,
    #[serde(default)]
    pub gpu_ids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

impl Record for LlmDeployment {
    const COLLECTION: &'static str = "llms.json";

    fn id(&self) -> &str {
        &self.id
    }
}

// ── Image ──────────────────────────────────────────────────────────

/// A container image pulled and tagged as managed by InferAdmin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRef {
    /// Engine image id (`sha256:...`).
    pub id: String,
    pub repository: String,
    pub tag: String,
    /// The extra tag marking the image as managed (`<reference>-inferadmin`).
    pub managed_tag: String,
    pub pulled_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl ImageRef {
    /// The reference the image was pulled by (`repository:tag`).
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl Record for ImageRef {
    const COLLECTION: &'static str = "images.json";

    fn id(&self) -> &str {
        &self.id
    }
}
