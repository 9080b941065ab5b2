//! Dispatcher — routes blocking operations to the I/O or CPU pool.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::pool::{Job, WorkerPool};

/// Which pool an operation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Engine calls, subprocesses, file reads and writes.
    Io,
    /// Parsing, hashing, directory scans that are compute-heavy.
    Cpu,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io => f.write_str("io"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

/// Pool sizing and shutdown parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Worker threads in the I/O pool.
    pub io_pool_size: usize,
    /// Worker threads in the CPU pool; 0 means processors minus one (min 1).
    pub cpu_pool_size: usize,
    /// Pending jobs each pool queues before submissions fail with `Saturated`.
    pub queue_capacity: usize,
    /// How long `shutdown` waits for workers to finish.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            io_pool_size: 10,
            cpu_pool_size: 0,
            queue_capacity: 256,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    /// Resolved worker count for a pool.
    pub fn pool_size(&self, kind: PoolKind) -> usize {
        match kind {
            PoolKind::Io => self.io_pool_size.max(1),
            PoolKind::Cpu if self.cpu_pool_size == 0 => thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1),
            PoolKind::Cpu => self.cpu_pool_size,
        }
    }
}

/// Outcome of [`Dispatcher::shutdown`].
#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownReport {
    /// Worker threads that were asked to stop.
    pub workers: usize,
    /// True if workers were still running when the timeout elapsed.
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Handle to an operation submitted to a pool. Resolves with its result.
#[must_use = "the operation still runs if dropped, but its result is lost"]
pub struct Pending<R> {
    rx: oneshot::Receiver<Result<R, String>>,
}

impl<R> Future for Pending<R> {
    type Output = DispatchResult<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(DispatchError::Panicked(message)),
            Err(_) => Err(DispatchError::Cancelled),
        })
    }
}

/// Offloads blocking operations onto bounded worker pools.
///
/// Held behind an `Arc` and injected into every component that needs it.
pub struct Dispatcher {
    config: DispatcherConfig,
    io: Mutex<Option<Arc<WorkerPool>>>,
    cpu: Mutex<Option<Arc<WorkerPool>>>,
    closed: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher whose pools are built on first use.
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            io: Mutex::new(None),
            cpu: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a dispatcher and build both pools immediately.
    pub fn start(config: DispatcherConfig) -> DispatchResult<Self> {
        let dispatcher = Self::new(config);
        dispatcher.pool(PoolKind::Io)?;
        dispatcher.pool(PoolKind::Cpu)?;
        Ok(dispatcher)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Worker count of a pool, or `None` if it has not been built.
    pub fn pool_size(&self, kind: PoolKind) -> Option<usize> {
        self.slot(kind)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|pool| pool.size())
    }

    /// Queue `op` on the `kind` pool and return a handle to its result.
    ///
    /// Fails immediately with `Saturated` when the pool's queue is full and
    /// with `ShutDown` after [`Dispatcher::shutdown`].
    pub fn submit<F, R>(&self, kind: PoolKind, op: F) -> DispatchResult<Pending<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool(kind)?;
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(op)).map_err(panic_message);
            // The caller may have stopped waiting; the work is done either way.
            let _ = tx.send(outcome);
        });
        pool.submit(job)?;
        Ok(Pending { rx })
    }

    /// Run `op` on the `kind` pool and wait for its result.
    pub async fn run<F, R>(&self, kind: PoolKind, op: F) -> DispatchResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit(kind, op)?.await
    }

    /// Stop accepting work, drain both pools and join their workers.
    ///
    /// Waits at most `shutdown_timeout`; workers still busy after that are
    /// left to finish on their own and the report says so.
    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        self.closed.store(true, Ordering::SeqCst);

        let mut handles = Vec::new();
        for kind in [PoolKind::Io, PoolKind::Cpu] {
            let pool = self
                .slot(kind)
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(pool) = pool {
                handles.extend(pool.close());
            }
        }
        let workers = handles.len();

        // Join on a plain thread so an overrunning worker cannot hold the
        // async runtime open past the timeout.
        let (done_tx, done_rx) = oneshot::channel();
        let joiner = thread::Builder::new()
            .name("inferadmin-dispatch-drain".to_string())
            .spawn(move || {
                for handle in handles {
                    let _ = handle.join();
                }
                let _ = done_tx.send(());
            });

        let timed_out = match joiner {
            Ok(_) => tokio::time::timeout(self.config.shutdown_timeout, done_rx)
                .await
                .is_err(),
            Err(e) => {
                warn!(error = %e, "failed to spawn drain thread, not waiting for workers");
                false
            }
        };

        let elapsed = started.elapsed();
        if timed_out {
            warn!(
                workers,
                timeout = ?self.config.shutdown_timeout,
                "dispatcher shutdown timed out with work still running"
            );
        } else {
            info!(workers, ?elapsed, "dispatcher drained");
        }
        ShutdownReport {
            workers,
            timed_out,
            elapsed,
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn slot(&self, kind: PoolKind) -> &Mutex<Option<Arc<WorkerPool>>> {
        match kind {
            PoolKind::Io => &self.io,
            PoolKind::Cpu => &self.cpu,
        }
    }

    /// Get the pool for `kind`, building it with configured sizing if needed.
    fn pool(&self, kind: PoolKind) -> DispatchResult<Arc<WorkerPool>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::ShutDown);
        }
        let mut slot = self.slot(kind).lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        // A shutdown may have emptied the slots since the check above.
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::ShutDown);
        }
        let size = self.config.pool_size(kind);
        debug!(pool = %kind, size, "building worker pool");
        let pool = Arc::new(WorkerPool::new(kind, size, self.config.queue_capacity)?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
