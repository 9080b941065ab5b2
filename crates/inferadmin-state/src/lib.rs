//! inferadmin-state — durable record store for InferAdmin.
//!
//! Every domain collection (applications, LLM deployments, images) lives in
//! its own JSON document under a shared state directory. A document is a
//! JSON array of records; a record is anything implementing [`Record`].
//!
//! # Architecture
//!
//! ```text
//! StateDir (root)
//!   ├── applications.json   RecordStore<Application>
//!   ├── llms.json           RecordStore<LlmDeployment>
//!   └── images.json         RecordStore<ImageRef>
//! ```
//!
//! Mutations read the whole document, change it in memory and write it back
//! through a temp file + atomic rename. All handles on one document share a
//! process-wide writer lock, so concurrent `add`/`update`/`remove` calls on
//! one collection never lose each other's changes. Reads take no
//! lock and always observe a complete document.

pub mod dir;
pub mod error;
pub mod record;
pub mod store;
pub mod types;

pub use dir::StateDir;
pub use error::{StateError, StateResult};
pub use record::Record;
pub use store::RecordStore;
pub use types::*;
