//! Task error envelope reported with `/fail`.

use serde::{Deserialize, Serialize};

/// Machine-readable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "DOWNLOAD_ERROR")]
    Download,
    #[serde(rename = "CONVERT_ERROR")]
    Convert,
    #[serde(rename = "UPLOAD_ERROR")]
    Upload,
    #[serde(rename = "CONFIG_ERROR")]
    Config,
    #[serde(rename = "UNEXPECTED_ERROR")]
    Unexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Download => "DOWNLOAD_ERROR",
            ErrorCode::Convert => "CONVERT_ERROR",
            ErrorCode::Upload => "UPLOAD_ERROR",
            ErrorCode::Config => "CONFIG_ERROR",
            ErrorCode::Unexpected => "UNEXPECTED_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scratch files relevant to a failure, for operator cleanup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempFiles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcode_path: Option<String>,
}

impl TempFiles {
    pub fn is_empty(&self) -> bool {
        self.download_path.is_none() && self.transcode_path.is_none()
    }
}

/// Error envelope attached to a FAILED task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub message: String,
    pub code: ErrorCode,
    /// Full subprocess command line, when a subprocess was involved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Path most relevant to the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_files: Option<TempFiles>,
}

impl TaskError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            command: None,
            path: None,
            temp_files: None,
        }
    }

    pub fn download(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Download, message)
    }

    pub fn convert(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Convert, message)
    }

    pub fn upload(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Upload, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unexpected, message)
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_temp_files(mut self, temp_files: TempFiles) -> Self {
        if !temp_files.is_empty() {
            self.temp_files = Some(temp_files);
        }
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_format() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::Download).unwrap(),
            "\"DOWNLOAD_ERROR\""
        );
        let back: ErrorCode = serde_json::from_str("\"CONVERT_ERROR\"").unwrap();
        assert_eq!(back, ErrorCode::Convert);
    }

    #[test]
    fn test_task_error_envelope() {
        let err = TaskError::convert("encoder exited with code 1")
            .with_command("ffmpeg -y -i in.mp4 out.mp4")
            .with_temp_files(TempFiles {
                download_path: Some("/tmp/videoconverter/t1/source.mp4".into()),
                transcode_path: None,
            });

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "CONVERT_ERROR");
        assert!(!err.message.is_empty());
        assert_eq!(
            json["tempFiles"]["downloadPath"],
            "/tmp/videoconverter/t1/source.mp4"
        );
    }

    #[test]
    fn test_empty_temp_files_omitted() {
        let err = TaskError::download("gone").with_temp_files(TempFiles::default());
        assert!(err.temp_files.is_none());
    }
}
