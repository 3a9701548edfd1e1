//! Per-task scratch directories.
//!
//! Layout under the scratch root:
//! - `<root>/<taskId>/` holds the downloaded source (and its part files
//!   while a transfer is in flight)
//! - `<root>/<taskId>_converted.mp4` is the transcode output

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::error::RunnerResult;

const FALLBACK_SOURCE_NAME: &str = "source.mp4";

/// Scratch-space manager rooted at one directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the scratch root if missing.
    pub async fn ensure_root(&self) -> RunnerResult<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Scratch directory for one task.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    /// Create and return the task directory.
    pub async fn create_task_dir(&self, task_id: &str) -> RunnerResult<PathBuf> {
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Destination path for the downloaded source, named after the URL's
    /// final segment when that is filesystem-safe.
    pub fn download_dest(&self, task_id: &str, source_url: &str) -> PathBuf {
        self.task_dir(task_id).join(source_file_name(source_url))
    }

    /// Transcode output path for one task.
    pub fn converted_path(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{}_converted.mp4", task_id))
    }

    /// Remove every scratch file belonging to a task.
    pub async fn cleanup(&self, task_id: &str) {
        let dir = self.task_dir(task_id);
        if fs::try_exists(&dir).await.unwrap_or(false) {
            if let Err(e) = fs::remove_dir_all(&dir).await {
                warn!("Failed to remove scratch dir {}: {}", dir.display(), e);
            } else {
                debug!("Removed scratch dir {}", dir.display());
            }
        }

        let converted = self.converted_path(task_id);
        if fs::try_exists(&converted).await.unwrap_or(false) {
            if let Err(e) = fs::remove_file(&converted).await {
                warn!(
                    "Failed to remove converted file {}: {}",
                    converted.display(),
                    e
                );
            }
        }
    }
}

/// File name derived from the URL path; anything unsafe falls back to a
/// fixed name.
fn source_file_name(url: &str) -> String {
    let tail = url
        .split(['?', '#'])
        .next()
        .unwrap_or("")
        .rsplit('/')
        .next()
        .unwrap_or("");

    let safe = !tail.is_empty()
        && tail != "."
        && tail != ".."
        && tail
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if safe {
        tail.to_string()
    } else {
        FALLBACK_SOURCE_NAME.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_source_file_name_from_url() {
        assert_eq!(source_file_name("http://src/a.mp4"), "a.mp4");
        assert_eq!(
            source_file_name("https://cdn.example.com/v/clip-01.mkv?sig=abc"),
            "clip-01.mkv"
        );
        assert_eq!(source_file_name("http://src/"), FALLBACK_SOURCE_NAME);
        assert_eq!(
            source_file_name("http://src/we%20ird"),
            FALLBACK_SOURCE_NAME
        );
    }

    #[test]
    fn test_layout_paths() {
        let ws = Workspace::new("/tmp/videoconverter");
        assert_eq!(ws.task_dir("t1"), PathBuf::from("/tmp/videoconverter/t1"));
        assert_eq!(
            ws.converted_path("t1"),
            PathBuf::from("/tmp/videoconverter/t1_converted.mp4")
        );
        assert_eq!(
            ws.download_dest("t1", "http://src/a.mp4"),
            PathBuf::from("/tmp/videoconverter/t1/a.mp4")
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_dir_and_converted_file() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::new(root.path());

        let dir = ws.create_task_dir("t1").await.unwrap();
        fs::write(dir.join("a.mp4.part0"), b"partial").await.unwrap();
        fs::write(ws.converted_path("t1"), b"converted").await.unwrap();

        ws.cleanup("t1").await;

        assert!(!dir.exists());
        assert!(!ws.converted_path("t1").exists());
    }

    #[tokio::test]
    async fn test_cleanup_is_safe_when_nothing_exists() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::new(root.path());
        ws.cleanup("missing").await;
    }
}
