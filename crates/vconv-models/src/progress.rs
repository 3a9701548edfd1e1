//! Per-stage progress records and the terminal result envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Resolution;

/// Shared progress shape for every stage.
///
/// Sizes and speeds are in bytes / bytes-per-second, `eta` in seconds,
/// `progress` an integer percentage 0..=100.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgress {
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub total_size: u64,
    pub current_size: u64,
    pub progress: u8,
    pub current_speed: u64,
    pub average_speed: u64,
    pub eta: u64,
}

impl StageProgress {
    /// Start a fresh record at zero percent.
    pub fn begin(total_size: u64) -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            total_size,
            current_size: 0,
            progress: 0,
            current_speed: 0,
            average_speed: 0,
            eta: 0,
        }
    }

    /// Close the record at 100 percent.
    pub fn finish(&mut self) {
        self.end_time = Some(Utc::now());
        self.current_size = self.total_size;
        self.progress = 100;
        self.current_speed = 0;
        self.eta = 0;
    }
}

/// Convert-stage progress: the shared shape plus encoder counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertInfo {
    #[serde(flatten)]
    pub base: StageProgress,
    pub current_fps: f64,
    pub current_frame: u64,
    /// Encoder output bitrate in kbit/s
    pub current_bitrate: u64,
    pub preset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

impl ConvertInfo {
    pub fn begin(preset: impl Into<String>, resolution: Option<Resolution>) -> Self {
        Self {
            base: StageProgress::begin(0),
            current_fps: 0.0,
            current_frame: 0,
            current_bitrate: 0,
            preset: preset.into(),
            resolution,
        }
    }
}

/// Upload-stage progress: the shared shape plus the produced object URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInfo {
    #[serde(flatten)]
    pub base: StageProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl UploadInfo {
    pub fn begin(total_size: u64) -> Self {
        Self {
            base: StageProgress::begin(total_size),
            target_url: None,
            hash: None,
        }
    }
}

/// Terminal outcome of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failed,
}

/// Result envelope posted with `/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Wall-clock duration of the whole pipeline in milliseconds
    pub total_duration: u64,
    /// Source size divided by output size
    pub compression_ratio: f64,
    pub status: ResultStatus,
    /// Presigned URL of the uploaded object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_progress_finish() {
        let mut p = StageProgress::begin(1000);
        p.current_size = 400;
        p.progress = 40;
        p.finish();
        assert_eq!(p.progress, 100);
        assert_eq!(p.current_size, 1000);
        assert!(p.end_time.is_some());
    }

    #[test]
    fn test_convert_info_flattens_base() {
        let info = ConvertInfo::begin("fast", None);
        let json = serde_json::to_value(&info).unwrap();
        // Base fields appear at the top level on the wire.
        assert!(json.get("currentSize").is_some());
        assert!(json.get("currentFps").is_some());
        assert!(json.get("base").is_none());
    }

    #[test]
    fn test_result_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&ResultStatus::Success).unwrap(),
            "\"success\""
        );
    }
}
