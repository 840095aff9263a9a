//! Persisted job queue and worker runner.

pub mod queue;
pub mod runner;

pub use queue::{JobKind, JobStatus, QueuedJob};
pub use runner::{JobRunner, RunnerDeps, spawn_runner};
