//! Media pipeline primitives: source download and ffmpeg transcode.
//!
//! This crate provides:
//! - Chunked resumable HTTP downloads with part-file bookkeeping
//! - FFprobe input inspection
//! - Bitrate targeting for a fixed output-size ceiling
//! - FFmpeg subprocess supervision with structured progress

pub mod bitrate;
pub mod download;
pub mod error;
pub mod probe;
pub mod progress;
pub mod transcode;

pub use bitrate::{solve_video_bitrate, BitrateTarget};
pub use download::{purge_parts, DownloadConfig, Downloader};
pub use error::{MediaError, MediaResult};
pub use probe::{probe_video, VideoInfo};
pub use progress::{SpeedWindow, TranscodeProgress, TransferProgress};
pub use transcode::{transcode, TranscodeOutcome, TranscodeSpec};
