//! Tasklane operator wiring
//!
//! Builds the long-running pieces the `tasklane` binary composes: the task
//! completion controller and the HTTPS admission webhook.

pub mod controller_runner;
pub mod webhook_server;
