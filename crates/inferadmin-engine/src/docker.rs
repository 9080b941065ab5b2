//! DockerCli — `ContainerEngine` over the `docker` command-line client.
//!
//! Each call spawns one `docker` subprocess, captures stdout/stderr on
//! reader threads (so a chatty `docker logs` cannot fill the pipe and stall
//! the child), and kills the child if it outlives the configured timeout.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use inferadmin_state::{ContainerId, ContainerStatus};

use crate::client::{ContainerEngine, GpuRequest, PulledImage, RunSpec, MANAGED_TAG_SUFFIX};
use crate::error::{EngineError, EngineResult};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured result of one CLI invocation that exited on its own.
#[derive(Debug)]
struct Output {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Container engine backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the CLI and return stdout, mapping a non-zero exit to an error.
    ///
    /// `subject` names the container or image the call is about and ends up
    /// in `NotFound`/`ImageNotFound`.
    fn call(&self, args: &[String], subject: &str, timeout: Duration) -> EngineResult<String> {
        let output = self.exec(args, timeout)?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(classify_failure(&output.stderr, subject))
        }
    }

    fn exec(&self, args: &[String], timeout: Duration) -> EngineResult<Output> {
        debug!(binary = ?self.binary, ?args, "invoking engine cli");
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("{}: {e}", self.binary.display())))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_with_deadline(&mut child, timeout)?;
        let Some(status) = status else {
            warn!(binary = ?self.binary, ?args, ?timeout, "engine call timed out, killing it");
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::Timeout(timeout));
        };

        Ok(Output {
            success: status.success(),
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
        })
    }
}

impl ContainerEngine for DockerCli {
    fn version(&self) -> EngineResult<String> {
        let out = self.call(
            &args(["version", "--format", "{{.Server.Version}}"]),
            "engine",
            self.timeout,
        )?;
        Ok(out.trim().to_string())
    }

    fn list_statuses(&self, ids: &[ContainerId]) -> EngineResult<HashMap<ContainerId, ContainerStatus>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let out = self.call(
            &args(["ps", "--all", "--no-trunc", "--format", "{{.ID}}\t{{.State}}"]),
            "containers",
            self.timeout,
        )?;
        let listed = parse_ps_output(&out)?;
        Ok(match_statuses(ids, &listed))
    }

    fn get_status(&self, id: &str) -> EngineResult<ContainerStatus> {
        let out = self.call(
            &args(["inspect", "--type", "container", "--format", "{{.State.Status}}", id]),
            id,
            self.timeout,
        )?;
        Ok(ContainerStatus::parse(&out))
    }

    fn run(&self, spec: &RunSpec) -> EngineResult<ContainerId> {
        let out = self.call(&run_args(spec), &spec.image, self.timeout)?;
        let id = out.lines().last().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            return Err(EngineError::Parse("docker run printed no container id".to_string()));
        }
        Ok(id)
    }

    fn start(&self, id: &str) -> EngineResult<()> {
        self.call(&args(["start", id]), id, self.timeout)?;
        Ok(())
    }

    fn stop(&self, id: &str, grace: Duration) -> EngineResult<()> {
        let grace_secs = grace.as_secs().to_string();
        // The CLI only returns after the grace period, so allow for it.
        let timeout = self.timeout.max(grace + Duration::from_secs(10));
        self.call(&args(["stop", "--time", &grace_secs, id]), id, timeout)?;
        Ok(())
    }

    fn remove(&self, id: &str) -> EngineResult<()> {
        self.call(&args(["rm", "--force", id]), id, self.timeout)?;
        Ok(())
    }

    fn logs(&self, id: &str, tail: Option<usize>) -> EngineResult<String> {
        let mut argv = args(["logs", "--timestamps"]);
        if let Some(tail) = tail {
            argv.push("--tail".to_string());
            argv.push(tail.to_string());
        }
        argv.push(id.to_string());
        let output = self.exec(&argv, self.timeout)?;
        if !output.success {
            return Err(classify_failure(&output.stderr, id));
        }
        // The container's stderr stream comes back on the CLI's stderr.
        Ok(output.stdout + &output.stderr)
    }

    fn pull_image(&self, reference: &str) -> EngineResult<PulledImage> {
        // Pulls can take minutes; only the metadata calls use the short timeout.
        let pull_timeout = self.timeout.max(Duration::from_secs(30 * 60));
        self.call(&args(["pull", reference]), reference, pull_timeout)?;

        let managed_tag = format!("{reference}{MANAGED_TAG_SUFFIX}");
        self.call(&args(["tag", reference, &managed_tag]), reference, self.timeout)?;

        let out = self.call(
            &args(["image", "inspect", "--format", "{{.Id}}\t{{.Created}}\t{{.Size}}", reference]),
            reference,
            self.timeout,
        )?;
        let (id, created, size_bytes) = parse_image_inspect(&out)?;
        Ok(PulledImage {
            id,
            reference: reference.to_string(),
            managed_tag,
            created,
            size_bytes,
        })
    }

    fn remove_image(&self, id: &str) -> EngineResult<()> {
        self.call(&args(["rmi", "--force", id]), id, self.timeout)?;
        Ok(())
    }
}

// ── Argument building ──────────────────────────────────────────────

fn args<'a>(parts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    parts.into_iter().map(str::to_string).collect()
}

/// Build the `docker run` argument list for a spec.
pub(crate) fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut argv = args(["run", "--detach", "--name", &spec.name]);
    for (key, value) in spec.all_labels() {
        argv.push("--label".to_string());
        argv.push(format!("{key}={value}"));
    }
    for port in &spec.ports {
        argv.push("--publish".to_string());
        argv.push(format!("{}:{}:{}", port.host_ip, port.host_port, port.container_port));
    }
    for volume in &spec.volumes {
        argv.push("--volume".to_string());
        let mode = if volume.read_only { ":ro" } else { "" };
        argv.push(format!("{}:{}{mode}", volume.source, volume.target));
    }
    for (key, value) in &spec.env {
        argv.push("--env".to_string());
        argv.push(format!("{key}={value}"));
    }
    match &spec.gpus {
        GpuRequest::None => {}
        GpuRequest::All => {
            argv.push("--gpus".to_string());
            argv.push("all".to_string());
        }
        GpuRequest::Devices(ids) => {
            argv.push("--gpus".to_string());
            // The CLI parses this value as CSV, so the device list is quoted.
            argv.push(format!("\"device={}\"", ids.join(",")));
        }
    }
    argv.push(spec.image.clone());
    argv.extend(spec.command.iter().cloned());
    argv
}

// ── Output parsing ─────────────────────────────────────────────────

/// Map CLI stderr to an engine error.
pub(crate) fn classify_failure(stderr: &str, subject: &str) -> EngineError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such container") || lower.contains("no such object") {
        EngineError::NotFound(subject.to_string())
    } else if lower.contains("no such image")
        || lower.contains("manifest unknown")
        || lower.contains("pull access denied")
        || lower.contains("unable to find image")
    {
        EngineError::ImageNotFound(subject.to_string())
    } else {
        EngineError::Command(stderr.trim().to_string())
    }
}

/// Parse `docker ps --format "{{.ID}}\t{{.State}}"` output.
pub(crate) fn parse_ps_output(out: &str) -> EngineResult<Vec<(String, ContainerStatus)>> {
    out.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (id, state) = line
                .split_once('\t')
                .ok_or_else(|| EngineError::Parse(format!("malformed ps line: {line:?}")))?;
            Ok((id.trim().to_string(), ContainerStatus::parse(state)))
        })
        .collect()
}

/// Resolve each requested id against the listed containers.
///
/// Requested ids may be full ids or unambiguous prefixes of them.
pub(crate) fn match_statuses(
    requested: &[ContainerId],
    listed: &[(String, ContainerStatus)],
) -> HashMap<ContainerId, ContainerStatus> {
    requested
        .iter()
        .filter(|id| !id.is_empty())
        .filter_map(|id| {
            listed
                .iter()
                .find(|(listed_id, _)| listed_id == id || listed_id.starts_with(id.as_str()))
                .map(|(_, status)| (id.clone(), *status))
        })
        .collect()
}

/// Parse `docker image inspect --format "{{.Id}}\t{{.Created}}\t{{.Size}}"`.
pub(crate) fn parse_image_inspect(out: &str) -> EngineResult<(String, Option<DateTime<Utc>>, u64)> {
    let line = out.lines().next().unwrap_or_default();
    let mut fields = line.split('\t');
    let (Some(id), Some(created), Some(size)) = (fields.next(), fields.next(), fields.next()) else {
        return Err(EngineError::Parse(format!("malformed image inspect output: {line:?}")));
    };
    let created = DateTime::parse_from_rfc3339(created.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc));
    let size = size
        .trim()
        .parse()
        .map_err(|e| EngineError::Parse(format!("image size {size:?}: {e}")))?;
    Ok((id.trim().to_string(), created, size))
}

// ── Process plumbing ───────────────────────────────────────────────

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Poll the child until it exits or `timeout` elapses (`Ok(None)`).
fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
) -> EngineResult<Option<std::process::ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| EngineError::Spawn(e.to_string()))?
        {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
