//! inferadmin-dispatch — offload blocking calls without stalling async tasks.
//!
//! Container-engine queries, subprocess calls and filesystem scans are all
//! synchronous. Running them directly on a tokio worker would stall every
//! other task scheduled there, so they are handed to a [`Dispatcher`] which
//! runs them on dedicated OS threads and hands the result back through a
//! oneshot channel.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher
//!   ├── Io pool  (inferadmin-io-N threads, bounded queue)
//!   └── Cpu pool (inferadmin-cpu-N threads, bounded queue)
//!
//! caller ──run(kind, op)──▶ queue ──▶ worker ──▶ oneshot ──▶ caller.await
//! ```
//!
//! Pools are built eagerly by [`Dispatcher::start`] or lazily on first use by
//! a dispatcher made with [`Dispatcher::new`]. [`Dispatcher::shutdown`] stops
//! intake, lets workers drain, and joins them under a timeout.

pub mod dispatcher;
pub mod error;
pub mod pool;

pub use dispatcher::{Dispatcher, DispatcherConfig, Pending, PoolKind, ShutdownReport};
pub use error::{DispatchError, DispatchResult};
