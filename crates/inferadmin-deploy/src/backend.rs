//! Shared handle to the engine and the dispatcher.
//!
//! Every engine call and every store access made by the services goes
//! through [`Backend`], which runs it on the dispatcher's I/O pool so the
//! async caller never blocks.

use std::sync::Arc;
use std::time::Duration;

use inferadmin_dispatch::{Dispatcher, PoolKind};
use inferadmin_engine::{ContainerEngine, EngineResult};
use tracing::debug;

use crate::error::DeployResult;

#[derive(Clone)]
pub struct Backend {
    engine: Arc<dyn ContainerEngine>,
    dispatcher: Arc<Dispatcher>,
}

impl Backend {
    pub fn new(engine: Arc<dyn ContainerEngine>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { engine, dispatcher }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Run a blocking engine call on the I/O pool.
    pub async fn engine_call<F, R>(&self, op: F) -> DeployResult<R>
    where
        F: FnOnce(&dyn ContainerEngine) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        Ok(self
            .dispatcher
            .run(PoolKind::Io, move || op(engine.as_ref()))
            .await??)
    }

    /// Run any other blocking operation (store I/O, filesystem checks) on the I/O pool.
    pub async fn blocking<F, R>(&self, op: F) -> DeployResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.dispatcher.run(PoolKind::Io, op).await?)
    }

    /// Stop the container if it is running, then force-remove it.
    ///
    /// A container that is already gone is not an error. Returns whether a
    /// container was actually removed.
    pub async fn teardown_container(&self, id: &str, grace: Duration) -> DeployResult<bool> {
        let id = id.to_string();
        self.engine_call(move |engine| {
            match engine.get_status(&id) {
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e),
                Ok(status) if status.is_running() => match engine.stop(&id, grace) {
                    Err(e) if e.is_not_found() => return Ok(false),
                    other => other?,
                },
                Ok(_) => {}
            }
            match engine.remove(&id) {
                Ok(()) => {
                    debug!(container = %id, "container removed");
                    Ok(true)
                }
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }
}
