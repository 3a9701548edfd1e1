//! Shared data models for the vconv transcode runner.
//!
//! This crate provides Serde-serializable types for:
//! - Tasks, statuses, and pipeline stages
//! - Convert parameters and resolutions
//! - Per-stage progress records
//! - Task results and error envelopes
//! - Machine telemetry reported with heartbeats

pub mod error;
pub mod machine;
pub mod progress;
pub mod task;

pub use error::{ErrorCode, TaskError, TempFiles};
pub use machine::{CpuInfo, DeviceInfo, DiskInfo, Encoder, GpuInfo, MemoryInfo};
pub use progress::{ConvertInfo, ResultStatus, StageProgress, TaskResult, UploadInfo};
pub use task::{ConvertParams, Resolution, Stage, Task, TaskStatus};
pub use task::{DEFAULT_AUDIO_CODEC, DEFAULT_PRESET, DEFAULT_VIDEO_CODEC};
