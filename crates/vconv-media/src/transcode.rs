//! FFmpeg transcode driver.
//!
//! Supervises one encoder subprocess per call: solves the target bitrate
//! from the probed duration, builds the command line, parses the
//! `-progress pipe:2` stream, and turns a non-zero exit into an error
//! carrying the full command line and the tail of stderr.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bitrate::{solve_video_bitrate, BitrateTarget};
use crate::error::{MediaError, MediaResult};
use crate::probe::probe_video;
use crate::progress::TranscodeProgress;

/// Audio bitrate written to the output stream.
const OUTPUT_AUDIO_BITRATE: &str = "128k";
/// Stderr lines kept for error reporting.
const STDERR_TAIL_LINES: usize = 30;

/// Everything the driver needs to encode one file.
#[derive(Debug, Clone)]
pub struct TranscodeSpec {
    /// Codec family ("h264", "hevc") or an explicit encoder name
    pub video_codec: String,
    pub audio_codec: String,
    pub preset: String,
    /// Output frame size; source size kept when absent
    pub resolution: Option<(u32, u32)>,
    /// Prefer the NVENC encoder variant
    pub hardware: bool,
    pub bitrate: BitrateTarget,
}

/// What a successful encode reports back.
#[derive(Debug, Clone)]
pub struct TranscodeOutcome {
    /// Input duration in seconds
    pub duration: f64,
    /// Solved video bitrate in bits/second
    pub bitrate: u64,
}

/// Resolve a codec family to a concrete encoder name.
///
/// Explicit ffmpeg encoder names (libx264, h264_nvenc, ...) pass through
/// untouched.
fn map_video_codec(codec: &str, hardware: bool) -> String {
    match (codec.to_ascii_lowercase().as_str(), hardware) {
        ("h264" | "avc", true) => "h264_nvenc".to_string(),
        ("h264" | "avc", false) => "libx264".to_string(),
        ("hevc" | "h265", true) => "hevc_nvenc".to_string(),
        ("hevc" | "h265", false) => "libx265".to_string(),
        _ => codec.to_string(),
    }
}

/// Build the full ffmpeg argument list for one encode.
fn build_args(input: &Path, output: &Path, spec: &TranscodeSpec, video_bitrate: u64) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-v".into(),
        "error".into(),
        "-progress".into(),
        "pipe:2".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-c:v".into(),
        map_video_codec(&spec.video_codec, spec.hardware),
        "-preset".into(),
        spec.preset.clone(),
        // Variable bitrate: target, 1.5x ceiling, 2x buffer.
        "-b:v".into(),
        video_bitrate.to_string(),
        "-maxrate".into(),
        (video_bitrate + video_bitrate / 2).to_string(),
        "-bufsize".into(),
        (video_bitrate * 2).to_string(),
    ];

    if let Some((width, height)) = spec.resolution {
        args.push("-vf".into());
        args.push(format!("scale={}:{}", width, height));
    }

    args.extend([
        "-c:a".into(),
        spec.audio_codec.clone(),
        "-b:a".into(),
        OUTPUT_AUDIO_BITRATE.into(),
        "-movflags".into(),
        "+faststart".into(),
        output.to_string_lossy().into_owned(),
    ]);

    args
}

/// Parse one stderr line from the `-progress pipe:2` stream.
///
/// Returns a snapshot to emit when the line closes an update block, and
/// whether the line belonged to the progress stream at all (non-progress
/// lines are encoder diagnostics worth keeping).
fn parse_progress_line(
    line: &str,
    current: &mut TranscodeProgress,
    duration_secs: f64,
) -> (Option<TranscodeProgress>, bool) {
    let Some((key, value)) = line.trim().split_once('=') else {
        return (None, false);
    };

    match key {
        "frame" => {
            if let Ok(frame) = value.trim().parse() {
                current.frame = frame;
            }
        }
        "fps" => {
            if let Ok(fps) = value.trim().parse() {
                current.fps = fps;
            }
        }
        "bitrate" => {
            // Format: "1234.5kbits/s" or "N/A".
            if let Some(kbps) = value.trim().strip_suffix("kbits/s") {
                if let Ok(kbps) = kbps.trim().parse::<f64>() {
                    current.bitrate_kbps = kbps as u64;
                }
            }
        }
        "out_time_us" => {
            if let Ok(us) = value.trim().parse::<i64>() {
                current.out_time_ms = us / 1000;
            }
        }
        "out_time_ms" => {
            if let Ok(ms) = value.trim().parse::<i64>() {
                current.out_time_ms = ms;
            }
        }
        "progress" => {
            let encoded_secs = current.out_time_ms as f64 / 1000.0;
            current.percent = if duration_secs > 0.0 {
                ((encoded_secs / duration_secs) * 100.0).clamp(0.0, 100.0) as u8
            } else {
                0
            };
            if value.trim() == "end" {
                current.percent = 100;
            }
            return (Some(current.clone()), true);
        }
        // Remaining -progress keys (speed, total_size, ...) are noise here.
        "speed" | "out_time" | "total_size" | "dup_frames" | "drop_frames" => {}
        key if key.starts_with("stream_") => {}
        _ => return (None, false),
    }

    (None, true)
}

/// Transcode `input` into `output`.
///
/// Probes the input first (no duration is a hard error), solves the video
/// bitrate against the size ceiling, then supervises the encoder. On
/// cancellation the subprocess is killed and the partial output removed.
pub async fn transcode(
    input: &Path,
    output: &Path,
    spec: &TranscodeSpec,
    on_progress: impl Fn(TranscodeProgress) + Send + 'static,
    mut cancel: watch::Receiver<bool>,
) -> MediaResult<TranscodeOutcome> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)?;

    let info = probe_video(input).await?;
    let video_bitrate = solve_video_bitrate(info.duration, &spec.bitrate);

    let args = build_args(input, output, spec, video_bitrate);
    let command_line = format!("ffmpeg {}", args.join(" "));
    debug!("Running {}", command_line);

    let mut child = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr = child.stderr.take().expect("stderr not captured");
    let duration_secs = info.duration;

    // Reader task: progress stream plus a tail of diagnostic lines.
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut current = TranscodeProgress::default();
        let mut tail: Vec<String> = Vec::new();

        while let Ok(Some(line)) = lines.next_line().await {
            let (snapshot, was_progress) =
                parse_progress_line(&line, &mut current, duration_secs);
            if let Some(snapshot) = snapshot {
                on_progress(snapshot);
            }
            if !was_progress && !line.trim().is_empty() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.remove(0);
                }
                tail.push(line);
            }
        }
        tail
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.changed() => {
            if *cancel.borrow() {
                warn!("Transcode cancelled, killing encoder");
                let _ = child.kill().await;
                let _ = reader.await;
                remove_partial(output).await;
                return Err(MediaError::Cancelled);
            }
            child.wait().await?
        }
    };

    let tail = reader.await.unwrap_or_default();

    if !status.success() {
        remove_partial(output).await;
        return Err(MediaError::FfmpegFailed {
            message: format!("encoder exited with {}", status),
            command: command_line,
            stderr_tail: tail.join("\n"),
            exit_code: status.code(),
        });
    }

    let produced = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
    if produced == 0 {
        remove_partial(output).await;
        return Err(MediaError::FfmpegFailed {
            message: "encoder exited cleanly but produced no output".to_string(),
            command: command_line,
            stderr_tail: tail.join("\n"),
            exit_code: status.code(),
        });
    }

    info!(
        "Transcoded {} -> {} ({} bytes, {} bps target)",
        input.display(),
        output.display(),
        produced,
        video_bitrate
    );

    Ok(TranscodeOutcome {
        duration: info.duration,
        bitrate: video_bitrate,
    })
}

async fn remove_partial(output: &Path) {
    if tokio::fs::try_exists(output).await.unwrap_or(false) {
        if let Err(e) = tokio::fs::remove_file(output).await {
            warn!("Failed to remove partial output {}: {}", output.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> TranscodeSpec {
        TranscodeSpec {
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            preset: "medium".to_string(),
            resolution: Some((1280, 720)),
            hardware: false,
            bitrate: BitrateTarget::default(),
        }
    }

    #[test]
    fn test_codec_mapping() {
        assert_eq!(map_video_codec("h264", true), "h264_nvenc");
        assert_eq!(map_video_codec("h264", false), "libx264");
        assert_eq!(map_video_codec("hevc", true), "hevc_nvenc");
        assert_eq!(map_video_codec("h265", false), "libx265");
        // Explicit encoder names pass through regardless of hardware.
        assert_eq!(map_video_codec("libx264", true), "libx264");
        assert_eq!(map_video_codec("vp9", false), "vp9");
    }

    #[test]
    fn test_build_args_vbr_and_muxer_flags() {
        let args = build_args(
            &PathBuf::from("in.mp4"),
            &PathBuf::from("out.mp4"),
            &spec(),
            1_000_000,
        );

        let find = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .map(|i| args[i + 1].clone())
        };

        assert_eq!(find("-b:v").as_deref(), Some("1000000"));
        assert_eq!(find("-maxrate").as_deref(), Some("1500000"));
        assert_eq!(find("-bufsize").as_deref(), Some("2000000"));
        assert_eq!(find("-vf").as_deref(), Some("scale=1280:720"));
        assert_eq!(find("-b:a").as_deref(), Some("128k"));
        assert_eq!(find("-movflags").as_deref(), Some("+faststart"));
        assert_eq!(args[0], "-y");
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn test_build_args_without_resolution_has_no_filter() {
        let mut s = spec();
        s.resolution = None;
        let args = build_args(
            &PathBuf::from("in.mp4"),
            &PathBuf::from("out.mp4"),
            &s,
            500_000,
        );
        assert!(!args.contains(&"-vf".to_string()));
    }

    #[test]
    fn test_progress_block_emits_on_progress_key() {
        let mut current = TranscodeProgress::default();

        assert!(parse_progress_line("frame=250", &mut current, 100.0).0.is_none());
        assert!(parse_progress_line("fps=25.0", &mut current, 100.0).0.is_none());
        assert!(parse_progress_line("bitrate= 800.5kbits/s", &mut current, 100.0)
            .0
            .is_none());
        assert!(parse_progress_line("out_time_us=50000000", &mut current, 100.0)
            .0
            .is_none());

        let (snapshot, _) = parse_progress_line("progress=continue", &mut current, 100.0);
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.frame, 250);
        assert_eq!(snapshot.bitrate_kbps, 800);
        assert_eq!(snapshot.out_time_ms, 50_000);
        assert_eq!(snapshot.percent, 50);
    }

    #[test]
    fn test_progress_end_pins_percent() {
        let mut current = TranscodeProgress::default();
        parse_progress_line("out_time_us=99000000", &mut current, 100.0);
        let (snapshot, _) = parse_progress_line("progress=end", &mut current, 100.0);
        assert_eq!(snapshot.unwrap().percent, 100);
    }

    #[test]
    fn test_diagnostic_lines_are_kept_out_of_progress() {
        let mut current = TranscodeProgress::default();
        let (snapshot, was_progress) = parse_progress_line(
            "Cannot load libcuda.so.1",
            &mut current,
            100.0,
        );
        assert!(snapshot.is_none());
        assert!(!was_progress);
    }
}
