//! Per-task state machine.
//!
//! Each state's `process` either returns the next state to drive
//! immediately within the same stage, or `None` to yield at a stage
//! boundary (the queue schedules the next stage). Errors become a
//! `TaskError`, the task is marked FAILED, and the runner routes it
//! through a fresh `Failed` instance.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use vconv_client::ControlPlane;
use vconv_media::{
    transcode, BitrateTarget, Downloader, MediaError, TranscodeProgress, TranscodeSpec,
    TransferProgress,
};
use vconv_models::{
    ConvertInfo, ResultStatus, Stage, StageProgress, Task, TaskError, TaskResult, TaskStatus,
    TempFiles, UploadInfo,
};
use vconv_storage::{ObjectMetadata, ObjectStore, StoreConfig};

use crate::carry::CarryEntry;
use crate::workspace::Workspace;

/// Everything a stage needs to drive its states.
#[derive(Clone)]
pub struct StageContext {
    pub client: ControlPlane,
    pub downloader: Arc<Downloader>,
    pub workspace: Workspace,
    /// Latest probe verdict; flips how the video codec is resolved
    pub hardware: Arc<AtomicBool>,
    pub bitrate: BitrateTarget,
    pub cancel: watch::Receiver<bool>,
}

/// What a stage hands back to the runner for queue and carry mutations.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Downloaded {
        path: std::path::PathBuf,
    },
    Converted {
        path: std::path::PathBuf,
        duration: f64,
        bitrate: u64,
    },
    Uploaded {
        target_url: String,
    },
}

/// Explicit machine states.
#[derive(Debug)]
pub enum TaskState {
    Waiting,
    Downloading,
    Converting,
    Uploading,
    Complete,
    Failed(TaskError),
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Downloading => "downloading",
            TaskState::Converting => "converting",
            TaskState::Uploading => "uploading",
            TaskState::Complete => "complete",
            TaskState::Failed(_) => "failed",
        }
    }

    /// Entry state for a stage processor.
    pub fn entry_for(stage: Stage) -> TaskState {
        match stage {
            Stage::Download => TaskState::Waiting,
            Stage::Convert => TaskState::Converting,
            Stage::Upload => TaskState::Uploading,
        }
    }
}

/// Drives the states belonging to one stage for one task.
pub struct StageProcessor {
    stage: Stage,
    ctx: StageContext,
}

impl StageProcessor {
    pub fn new(stage: Stage, ctx: StageContext) -> Self {
        Self { stage, ctx }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Enter at this stage's entry state and drive until a state yields.
    ///
    /// On error the task is marked FAILED with the error attached; the
    /// caller owns the `Failed` transition.
    pub async fn run(&self, task: &mut Task, carry: &CarryEntry) -> Result<StageOutcome, TaskError> {
        let mut state = TaskState::entry_for(self.stage);
        let mut outcome: Option<StageOutcome> = None;

        loop {
            info!(task_id = %task.id, state = state.name(), "Processing task");
            match state.process(task, &self.ctx, carry, &mut outcome).await {
                Ok(Some(next)) => state = next,
                Ok(None) => break,
                Err(e) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(e.clone());
                    return Err(e);
                }
            }
        }

        outcome.ok_or_else(|| {
            TaskError::unexpected(format!("stage {} yielded without an outcome", self.stage))
        })
    }
}

/// Drive a fresh `Failed` instance: post the terminal failure and clean
/// local state. Never propagates further.
pub async fn run_failed(ctx: &StageContext, task: &mut Task, err: TaskError) {
    let state = TaskState::Failed(err);
    info!(task_id = %task.id, state = state.name(), "Processing task");
    if let TaskState::Failed(err) = state {
        task.status = TaskStatus::Failed;
        task.error = Some(err.clone());

        if let Err(e) = ctx.client.fail(&task.id, &err).await {
            error!(task_id = %task.id, "Failed to report terminal failure: {}", e);
        }
        ctx.workspace.cleanup(&task.id).await;
    }
}

impl TaskState {
    async fn process(
        &self,
        task: &mut Task,
        ctx: &StageContext,
        carry: &CarryEntry,
        outcome: &mut Option<StageOutcome>,
    ) -> Result<Option<TaskState>, TaskError> {
        match self {
            TaskState::Waiting => Ok(Some(TaskState::Downloading)),
            TaskState::Downloading => download(task, ctx, outcome).await.map(|_| None),
            TaskState::Converting => convert(task, ctx, carry, outcome).await.map(|_| None),
            TaskState::Uploading => {
                upload(task, ctx, carry, outcome).await?;
                Ok(Some(TaskState::Complete))
            }
            TaskState::Complete => {
                complete(task, ctx).await?;
                Ok(None)
            }
            // Failed is driven through run_failed on a fresh instance.
            TaskState::Failed(_) => Ok(None),
        }
    }
}

async fn download(
    task: &mut Task,
    ctx: &StageContext,
    outcome: &mut Option<StageOutcome>,
) -> Result<(), TaskError> {
    task.status = TaskStatus::Downloading;

    ctx.workspace
        .create_task_dir(&task.id)
        .await
        .map_err(|e| TaskError::download(format!("cannot create scratch dir: {}", e)))?;
    let dest = ctx.workspace.download_dest(&task.id, &task.source);

    let (tx, forwarder) = spawn_download_reporter(ctx.client.clone(), task.id.clone());
    let sender = tx.clone();
    let downloaded = ctx
        .downloader
        .download(
            &task.source,
            &dest,
            move |progress| {
                let _ = sender.send(progress);
            },
            ctx.cancel.clone(),
        )
        .await;
    drop(tx);
    let mut record = forwarder.await.unwrap_or_else(|_| StageProgress::begin(0));

    let downloaded = downloaded.map_err(|e| {
        TaskError::download(e.to_string())
            .with_path(dest.to_string_lossy())
            .with_temp_files(TempFiles {
                download_path: Some(dest.to_string_lossy().into_owned()),
                transcode_path: None,
            })
    })?;

    record.finish();
    task.download_info = Some(record);

    let path_str = downloaded.to_string_lossy().into_owned();
    ctx.client
        .download_complete(&task.id, &path_str)
        .await
        .map_err(|e| {
            TaskError::unexpected(format!("downloadComplete marker failed: {}", e))
                .with_path(path_str.clone())
        })?;

    *outcome = Some(StageOutcome::Downloaded { path: downloaded });
    Ok(())
}

async fn convert(
    task: &mut Task,
    ctx: &StageContext,
    carry: &CarryEntry,
    outcome: &mut Option<StageOutcome>,
) -> Result<(), TaskError> {
    task.status = TaskStatus::Converting;

    let input = carry
        .downloaded_file_path
        .clone()
        .ok_or_else(|| TaskError::unexpected("no downloaded file recorded for convert stage"))?;
    let output = ctx.workspace.converted_path(&task.id);

    let spec = TranscodeSpec {
        video_codec: task.convert_params.video_codec.clone(),
        audio_codec: task.convert_params.audio_codec.clone(),
        preset: task.convert_params.preset.clone(),
        resolution: task
            .convert_params
            .resolution
            .map(|r| (r.width, r.height)),
        hardware: ctx.hardware.load(Ordering::Relaxed),
        bitrate: ctx.bitrate.clone(),
    };

    let (tx, forwarder) = spawn_convert_reporter(
        ctx.client.clone(),
        task.id.clone(),
        ConvertInfo::begin(spec.preset.clone(), task.convert_params.resolution),
    );
    let sender = tx.clone();
    let result = transcode(
        &input,
        &output,
        &spec,
        move |progress| {
            let _ = sender.send(progress);
        },
        ctx.cancel.clone(),
    )
    .await;
    drop(tx);
    let mut record = forwarder
        .await
        .unwrap_or_else(|_| ConvertInfo::begin(task.convert_params.preset.as_str(), None));

    let converted = result.map_err(|e| convert_error(e, &input, &output))?;

    record.base.finish();
    task.convert_info = Some(record);

    *outcome = Some(StageOutcome::Converted {
        path: output,
        duration: converted.duration,
        bitrate: converted.bitrate,
    });
    Ok(())
}

fn convert_error(e: MediaError, input: &Path, output: &Path) -> TaskError {
    let temp_files = TempFiles {
        download_path: Some(input.to_string_lossy().into_owned()),
        transcode_path: Some(output.to_string_lossy().into_owned()),
    };

    match e {
        MediaError::FfmpegFailed {
            message,
            command,
            stderr_tail,
            ..
        } => {
            let message = if stderr_tail.is_empty() {
                message
            } else {
                format!("{}: {}", message, stderr_tail)
            };
            TaskError::convert(message)
                .with_command(command)
                .with_temp_files(temp_files)
        }
        other => TaskError::convert(other.to_string()).with_temp_files(temp_files),
    }
}

async fn upload(
    task: &mut Task,
    ctx: &StageContext,
    carry: &CarryEntry,
    outcome: &mut Option<StageOutcome>,
) -> Result<(), TaskError> {
    task.status = TaskStatus::Uploading;

    let input = carry
        .converted_file_path
        .clone()
        .ok_or_else(|| TaskError::unexpected("no converted file recorded for upload stage"))?;

    let size = tokio::fs::metadata(&input)
        .await
        .map(|m| m.len())
        .map_err(|e| {
            TaskError::upload(format!("converted file missing: {}", e))
                .with_path(input.to_string_lossy())
        })?;

    // Credentials are fetched fresh for every upload; the control plane
    // may rotate them at any time.
    let creds = ctx
        .client
        .object_store_credentials()
        .await
        .map_err(|e| TaskError::upload(format!("cannot fetch store credentials: {}", e)))?;
    let store = ObjectStore::connect(StoreConfig {
        endpoint: creds.endpoint,
        access_key: creds.access_key,
        secret_key: creds.secret_key,
        bucket: creds.bucket,
    });

    let resolution = task
        .convert_params
        .resolution
        .or_else(|| task.convert_info.as_ref().and_then(|c| c.resolution));
    let metadata = ObjectMetadata {
        task_id: task.id.clone(),
        timestamp: Utc::now().timestamp_millis(),
        duration: carry.converted_duration.unwrap_or(0.0),
        bitrate: carry.converted_bitrate.unwrap_or(0),
        size,
        width: resolution.map(|r| r.width).unwrap_or(0),
        height: resolution.map(|r| r.height).unwrap_or(0),
    };

    let key = format!("{}.mp4", task.id);
    let (tx, forwarder) = spawn_upload_reporter(
        ctx.client.clone(),
        task.id.clone(),
        UploadInfo::begin(size),
    );
    let sender = tx.clone();
    let summary = store
        .upload_file(&input, &key, metadata, move |uploaded, percent| {
            let _ = sender.send((uploaded, percent));
        })
        .await;
    drop(tx);
    let mut record = forwarder.await.unwrap_or_else(|_| UploadInfo::begin(size));

    let summary = summary.map_err(|e| {
        TaskError::upload(e.to_string()).with_path(input.to_string_lossy())
    })?;

    record.base.finish();
    record.target_url = Some(summary.target_url.clone());
    task.upload_info = Some(record);

    *outcome = Some(StageOutcome::Uploaded {
        target_url: summary.target_url,
    });
    Ok(())
}

async fn complete(task: &mut Task, ctx: &StageContext) -> Result<(), TaskError> {
    task.status = TaskStatus::Finished;

    let result = build_result(task);
    ctx.client
        .complete(&task.id, &result)
        .await
        .map_err(|e| TaskError::unexpected(format!("complete call failed: {}", e)))?;
    task.result = Some(result);

    ctx.workspace.cleanup(&task.id).await;
    info!(task_id = %task.id, "Task finished");
    Ok(())
}

/// Terminal result from the per-stage records.
fn build_result(task: &Task) -> TaskResult {
    let now = Utc::now();
    let started = task
        .download_info
        .as_ref()
        .map(|d| d.start_time)
        .unwrap_or(now);
    let total_duration = (now - started).num_milliseconds().max(0) as u64;

    let source_size = task
        .download_info
        .as_ref()
        .map(|d| d.total_size)
        .unwrap_or(0);
    let output_size = task
        .upload_info
        .as_ref()
        .map(|u| u.base.total_size)
        .unwrap_or(0);
    let compression_ratio = if output_size > 0 {
        source_size as f64 / output_size as f64
    } else {
        0.0
    };

    TaskResult {
        total_duration,
        compression_ratio,
        status: ResultStatus::Success,
        path: task.upload_info.as_ref().and_then(|u| u.target_url.clone()),
    }
}

/// Forward download progress to the control plane off the stage's path.
/// Returns the final record when the sender closes.
fn spawn_download_reporter(
    client: ControlPlane,
    task_id: String,
) -> (
    mpsc::UnboundedSender<TransferProgress>,
    tokio::task::JoinHandle<StageProgress>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<TransferProgress>();
    let handle = tokio::spawn(async move {
        let mut record = StageProgress::begin(0);
        while let Some(progress) = rx.recv().await {
            record.total_size = progress.total_size;
            record.current_size = progress.current_size;
            record.progress = progress.progress;
            record.current_speed = progress.current_speed;
            record.average_speed = progress.average_speed;
            record.eta = progress.eta;
            if let Err(e) = client.report_download(&task_id, &record).await {
                warn!(task_id = %task_id, "Download progress tick failed: {}", e);
            }
        }
        record
    });
    (tx, handle)
}

fn spawn_convert_reporter(
    client: ControlPlane,
    task_id: String,
    initial: ConvertInfo,
) -> (
    mpsc::UnboundedSender<TranscodeProgress>,
    tokio::task::JoinHandle<ConvertInfo>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<TranscodeProgress>();
    let handle = tokio::spawn(async move {
        let mut record = initial;
        while let Some(progress) = rx.recv().await {
            record.base.progress = progress.percent;
            record.current_frame = progress.frame;
            record.current_fps = progress.fps;
            record.current_bitrate = progress.bitrate_kbps;
            if let Err(e) = client.report_convert(&task_id, &record).await {
                warn!(task_id = %task_id, "Convert progress tick failed: {}", e);
            }
        }
        record
    });
    (tx, handle)
}

fn spawn_upload_reporter(
    client: ControlPlane,
    task_id: String,
    initial: UploadInfo,
) -> (
    mpsc::UnboundedSender<(u64, u8)>,
    tokio::task::JoinHandle<UploadInfo>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(u64, u8)>();
    let handle = tokio::spawn(async move {
        let mut record = initial;
        while let Some((uploaded, percent)) = rx.recv().await {
            record.base.current_size = uploaded;
            record.base.progress = percent;
            if let Err(e) = client.report_upload(&task_id, &record).await {
                warn!(task_id = %task_id, "Upload progress tick failed: {}", e);
            }
        }
        record
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vconv_models::UploadInfo;

    #[test]
    fn test_entry_states_per_stage() {
        assert!(matches!(
            TaskState::entry_for(Stage::Download),
            TaskState::Waiting
        ));
        assert!(matches!(
            TaskState::entry_for(Stage::Convert),
            TaskState::Converting
        ));
        assert!(matches!(
            TaskState::entry_for(Stage::Upload),
            TaskState::Uploading
        ));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(TaskState::Waiting.name(), "waiting");
        assert_eq!(
            TaskState::Failed(TaskError::unexpected("x")).name(),
            "failed"
        );
    }

    #[test]
    fn test_build_result_compression_ratio() {
        let mut task = Task::new("t1", "http://src/a.mp4");

        let mut download = StageProgress::begin(20_000_000);
        download.finish();
        task.download_info = Some(download);

        let mut upload = UploadInfo::begin(10_000_000);
        upload.base.finish();
        upload.target_url = Some("https://store/a?sig=1".into());
        task.upload_info = Some(upload);

        let result = build_result(&task);
        assert_eq!(result.status, ResultStatus::Success);
        assert!((result.compression_ratio - 2.0).abs() < f64::EPSILON);
        assert_eq!(result.path.as_deref(), Some("https://store/a?sig=1"));
    }

    #[test]
    fn test_build_result_handles_missing_records() {
        let task = Task::new("t1", "http://src/a.mp4");
        let result = build_result(&task);
        assert_eq!(result.compression_ratio, 0.0);
        assert!(result.path.is_none());
    }

    #[test]
    fn test_convert_error_carries_command_and_temp_files() {
        let err = convert_error(
            MediaError::FfmpegFailed {
                message: "encoder exited with exit status: 1".into(),
                command: "ffmpeg -y -i in.mp4 out.mp4".into(),
                stderr_tail: "Cannot load libcuda.so.1".into(),
                exit_code: Some(1),
            },
            Path::new("/tmp/videoconverter/t1/a.mp4"),
            Path::new("/tmp/videoconverter/t1_converted.mp4"),
        );

        assert_eq!(err.code, vconv_models::ErrorCode::Convert);
        assert!(err.message.contains("Cannot load libcuda"));
        assert!(err.command.as_deref().unwrap().starts_with("ffmpeg"));
        let temp = err.temp_files.unwrap();
        assert!(temp.download_path.unwrap().ends_with("a.mp4"));
        assert!(temp.transcode_path.unwrap().ends_with("t1_converted.mp4"));
    }
}
