//! Task entity, status enum, and pipeline stages.

use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::progress::{ConvertInfo, StageProgress, TaskResult, UploadInfo};

/// Default video codec requested when the control plane sends none.
pub const DEFAULT_VIDEO_CODEC: &str = "h264";
/// Default audio codec.
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
/// Default encoding preset.
pub const DEFAULT_PRESET: &str = "medium";

/// Lifecycle status of a task as the control plane sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created, bound to no runner yet
    #[default]
    Waiting,
    /// Source fetch in progress
    Downloading,
    /// Encoder running
    Converting,
    /// Object-store transfer in progress
    Uploading,
    /// Terminal success
    Finished,
    /// Terminal failure
    Failed,
    /// Held by an operator; never entered by the runner
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Downloading => "DOWNLOADING",
            TaskStatus::Converting => "CONVERTING",
            TaskStatus::Uploading => "UPLOADING",
            TaskStatus::Finished => "FINISHED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Paused => "PAUSED",
        }
    }

    /// Check if this is a terminal state (no more transitions expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One of the three pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Download,
    Convert,
    Upload,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Convert => "convert",
            Stage::Upload => "upload",
        }
    }

    /// The stage a task moves to after this one completes.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Download => Some(Stage::Convert),
            Stage::Convert => Some(Stage::Upload),
            Stage::Upload => None,
        }
    }

    /// Status a task carries while this stage is driving it.
    pub fn active_status(&self) -> TaskStatus {
        match self {
            Stage::Download => TaskStatus::Downloading,
            Stage::Convert => TaskStatus::Converting,
            Stage::Upload => TaskStatus::Uploading,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output frame size requested for the encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Encoding parameters attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertParams {
    /// Video codec family (e.g. "h264", "hevc") or explicit encoder name
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    /// Audio codec
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// Encoder preset (e.g. "fast", "medium", "slow")
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Output resolution; source resolution is kept when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

fn default_video_codec() -> String {
    DEFAULT_VIDEO_CODEC.to_string()
}
fn default_audio_codec() -> String {
    DEFAULT_AUDIO_CODEC.to_string()
}
fn default_preset() -> String {
    DEFAULT_PRESET.to_string()
}

impl Default for ConvertParams {
    fn default() -> Self {
        Self {
            video_codec: DEFAULT_VIDEO_CODEC.to_string(),
            audio_codec: DEFAULT_AUDIO_CODEC.to_string(),
            preset: DEFAULT_PRESET.to_string(),
            resolution: None,
        }
    }
}

impl ConvertParams {
    /// Returns a new set of params with the given resolution.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution { width, height });
        self
    }
}

/// A transcode task owned by this runner.
///
/// Identity and source come from the control plane; the per-stage info
/// records are maintained locally and mirrored back as progress ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Opaque, globally unique id
    pub id: String,
    /// URL of the source bytes
    pub source: String,
    /// Current lifecycle status
    #[serde(default)]
    pub status: TaskStatus,
    /// Higher runs first; FIFO within equal priorities
    #[serde(default)]
    pub priority: i64,
    /// Encoding parameters
    #[serde(default)]
    pub convert_params: ConvertParams,
    /// Download stage progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_info: Option<StageProgress>,
    /// Convert stage progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convert_info: Option<ConvertInfo>,
    /// Upload stage progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_info: Option<UploadInfo>,
    /// Populated only on terminal success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Populated only on terminal failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl Task {
    /// Create a task in WAITING state.
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            status: TaskStatus::Waiting,
            priority: 0,
            convert_params: ConvertParams::default(),
            download_info: None,
            convert_info: None,
            upload_info: None,
            result: None,
            error: None,
        }
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the convert parameters.
    pub fn with_params(mut self, params: ConvertParams) -> Self {
        self.convert_params = params;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
