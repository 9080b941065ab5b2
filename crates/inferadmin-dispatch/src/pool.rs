//! Worker pool — a fixed set of OS threads pulling jobs from a bounded queue.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::dispatcher::PoolKind;
use crate::error::{DispatchError, DispatchResult};

/// A unit of work. Jobs never unwind: the dispatcher wraps every operation
/// in `catch_unwind` before it reaches the queue.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads sharing one bounded job queue.
pub struct WorkerPool {
    kind: PoolKind,
    size: usize,
    /// `None` once the pool has been closed.
    sender: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `size` workers named `inferadmin-{kind}-{index}`.
    pub fn new(kind: PoolKind, size: usize, queue_capacity: usize) -> DispatchResult<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Job>(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("inferadmin-{kind}-{index}"))
                .spawn(move || worker_loop(receiver))
                .map_err(|e| DispatchError::Spawn(e.to_string()))?;
            workers.push(handle);
        }

        info!(pool = %kind, workers = size, queue_capacity, "worker pool initialized");
        Ok(Self {
            kind,
            size,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Enqueue a job without blocking. Fails fast when the queue is full.
    pub(crate) fn submit(&self, job: Job) -> DispatchResult<()> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(DispatchError::ShutDown);
        };
        sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => DispatchError::Saturated(self.kind),
            TrySendError::Disconnected(_) => DispatchError::ShutDown,
        })
    }

    /// Stop accepting jobs and hand back the worker handles.
    ///
    /// Workers keep running until the queue is drained, then exit.
    pub(crate) fn close(&self) -> Vec<JoinHandle<()>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        debug!(pool = %self.kind, workers = handles.len(), "worker pool closed");
        handles
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        // Release the queue lock before running the job so siblings can pick up work.
        let next = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        match next {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}
