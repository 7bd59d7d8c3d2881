//! Single-flight orchestration of long-running background runs.
//!
//! A caller opens a [`listener::ContextScope`], subscribes to a run category, and asks the
//! controller (through [`orchestrator::RunClient`]) to start a run. The controller admits at
//! most one run process-wide via [`registry::RunRegistry`], drives the job, and streams
//! typed [`model::RunEvent`]s back over the [`channel::EventBus`].

pub mod channel;
pub mod cli;
pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod listener;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod session;
