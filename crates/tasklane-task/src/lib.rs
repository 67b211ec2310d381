//! Task lifecycle for Tasklane
//!
//! Turns task descriptions into Kubernetes Jobs and follows them to completion:
//! - [`desirer`] compiles `Task` / `StagingTask` into Jobs and deletes them by GUID
//! - [`reconciler`] watches task pods, reports completion once, and garbage
//!   collects the Job after a TTL
//! - [`reporter`] delivers the completion callback over HTTP
//! - [`client`] holds the Kubernetes-facing capabilities the above depend on

pub mod client;
pub mod desirer;
pub mod error;
pub mod reconciler;
pub mod reporter;
pub mod task;

pub use desirer::{TaskDesirer, TaskJobDeleter};
pub use error::TaskError;
pub use reconciler::TaskReconciler;
pub use reporter::CallbackReporter;
pub use task::{StagingTask, Task};
