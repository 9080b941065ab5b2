//! inferadmin-engine — the container engine as seen by the control plane.
//!
//! [`ContainerEngine`] is a blocking interface: every call may hit a socket
//! or spawn a subprocess, so callers run it through the dispatcher's I/O
//! pool. [`DockerCli`] implements it by shelling out to the `docker` binary
//! with a per-call timeout.
//!
//! The `testing` feature exposes `testing::FakeEngine`, an in-memory engine
//! that records calls and can inject failures.

pub mod client;
pub mod docker;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{
    split_reference, ContainerEngine, GpuRequest, PortBinding, PulledImage, RunSpec, VolumeMount,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, MANAGED_TAG_SUFFIX,
};
pub use docker::DockerCli;
pub use error::{EngineError, EngineResult};
