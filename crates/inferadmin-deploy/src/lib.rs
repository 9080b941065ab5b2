//! inferadmin-deploy — reconciliation and the deployment services.
//!
//! ```text
//!   ApplicationService ─┐
//!   LlmService ─────────┼──► Backend ──► Dispatcher (I/O pool) ──► RecordStore
//!   ImageService ───────┘       │                               └─► ContainerEngine
//!                               └──► Reconciler (status view over stored records)
//!   ModelService ──────────────────► Dispatcher (CPU pool) ──► model storage scan
//! ```
//!
//! Services are cheap to clone and safe to share across tasks. Store I/O and
//! engine calls never run on the async executor.

pub mod applications;
pub mod backend;
pub mod error;
pub mod images;
pub mod llms;
pub mod models;
pub mod reconcile;

pub use applications::{ApplicationService, DeployApplication};
pub use backend::Backend;
pub use error::{DeployError, DeployResult};
pub use images::ImageService;
pub use llms::{model_dir, DeployLlm, LlmService};
pub use models::{LocalModel, ModelService};
pub use reconcile::{Reconcilable, ReconcileMode, ReconcileOutcome, Reconciler};
