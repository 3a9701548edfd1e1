//! Transcode fleet runner.
//!
//! This crate provides:
//! - Stage queues with per-stage concurrency caps
//! - The per-task state machine (waiting through terminal states)
//! - The carry store threading artifact paths between stages
//! - System probing for heartbeat telemetry
//! - The runner service: registration, polling, dispatch, shutdown

pub mod carry;
pub mod config;
pub mod error;
pub mod probe;
pub mod queue;
pub mod service;
pub mod state;
pub mod workspace;

pub use carry::{CarryEntry, CarryStore};
pub use config::RunnerConfig;
pub use error::{RunnerError, RunnerResult};
pub use queue::{QueueStats, StageCounts, StageQueues};
pub use service::RunnerService;
pub use state::{StageContext, StageOutcome, StageProcessor, TaskState};
pub use workspace::Workspace;
