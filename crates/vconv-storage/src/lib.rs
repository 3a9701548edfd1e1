//! S3-compatible object storage for transcode outputs.
//!
//! This crate provides:
//! - Per-upload client construction from control-plane credentials
//! - Single-shot and multipart uploads with per-part progress
//! - Post-upload size verification
//! - Presigned GET URL generation

pub mod client;
pub mod error;

pub use client::{ObjectMetadata, ObjectStore, StoreConfig, UploadSummary};
pub use error::{StorageError, StorageResult};
