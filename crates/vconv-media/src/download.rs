//! Chunked, resumable HTTP download engine.
//!
//! A download is split into ranged chunks, each streamed into a sibling
//! part file (`<dest>.part<i>`). Part files left by an interrupted run are
//! picked up and extended, so a restart only fetches the missing byte
//! ranges. When every chunk is complete the parts are concatenated into
//! the destination in index order and removed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};
use crate::progress::{percent_of, SpeedWindow, TransferProgress};

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
/// Hard cap on the number of chunks per download.
pub const MAX_CHUNKS: u32 = 32;
/// Chunks transferred concurrently.
pub const DEFAULT_PARALLEL: usize = 8;
/// Attempts per chunk before the whole download fails.
pub const CHUNK_RETRIES: u32 = 5;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub chunk_size: u64,
    pub min_chunks: u32,
    pub max_chunks: u32,
    pub max_parallel: usize,
    pub chunk_retries: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_chunks: 1,
            max_chunks: MAX_CHUNKS,
            max_parallel: DEFAULT_PARALLEL,
            chunk_retries: CHUNK_RETRIES,
        }
    }
}

/// Inclusive byte range owned by one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkSpan {
    index: u32,
    start: u64,
    end: u64,
}

impl ChunkSpan {
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Split `total` bytes into ranged chunks.
///
/// The chunk count is `ceil(total / chunk_size)` clamped into
/// `[min_chunks, max_chunks]`; spans divide the file evenly with the last
/// chunk taking the remainder.
fn plan_chunks(total: u64, config: &DownloadConfig) -> Vec<ChunkSpan> {
    debug_assert!(total > 0);

    let by_size = total.div_ceil(config.chunk_size).max(1);
    let count = by_size.clamp(config.min_chunks.max(1) as u64, config.max_chunks as u64);
    let per_chunk = total.div_ceil(count);

    (0..count)
        .map(|i| {
            let start = i * per_chunk;
            let end = (start + per_chunk).min(total) - 1;
            ChunkSpan {
                index: i as u32,
                start,
                end,
            }
        })
        .filter(|span| span.start < total)
        .collect()
}

/// Sibling part file for one chunk of `dest`.
fn part_path(dest: &Path, index: u32) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(format!(".part{}", index));
    PathBuf::from(name)
}

/// Bytes already present in a part file, restarting oversized parts.
async fn resume_offset(part: &Path, span: &ChunkSpan) -> MediaResult<u64> {
    match fs::metadata(part).await {
        Ok(meta) if meta.len() > span.len() => {
            warn!(
                "Part file {} larger than its range ({} > {}), restarting chunk",
                part.display(),
                meta.len(),
                span.len()
            );
            fs::remove_file(part).await?;
            Ok(0)
        }
        Ok(meta) => Ok(meta.len()),
        Err(_) => Ok(0),
    }
}

/// Concatenate completed parts into `dest`, unlinking each as it is
/// consumed, and verify the final size.
async fn assemble_parts(dest: &Path, spans: &[ChunkSpan], expected: u64) -> MediaResult<()> {
    let mut out = fs::File::create(dest).await?;

    for span in spans {
        let part = part_path(dest, span.index);
        let mut input = fs::File::open(&part).await?;
        tokio::io::copy(&mut input, &mut out).await?;
        fs::remove_file(&part).await?;
    }
    out.flush().await?;
    drop(out);

    let actual = fs::metadata(dest).await?.len();
    if actual != expected {
        return Err(MediaError::SizeMismatch { expected, actual });
    }
    Ok(())
}

/// Remove any part files left next to `dest` (caller-requested purge after
/// a cancellation).
pub async fn purge_parts(dest: &Path) -> MediaResult<()> {
    for index in 0..MAX_CHUNKS {
        let part = part_path(dest, index);
        if fs::try_exists(&part).await.unwrap_or(false) {
            fs::remove_file(&part).await?;
        }
    }
    Ok(())
}

/// Chunked resumable downloader.
pub struct Downloader {
    http: Client,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> MediaResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, config })
    }

    /// Download `url` into `dest`.
    ///
    /// `on_progress` fires at least once per second while bytes move, and
    /// once more with 100 % after assembly. `cancel` aborts in-flight
    /// transfers; part files are kept for a later resume.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: impl Fn(TransferProgress) + Send + Sync + 'static,
        cancel: watch::Receiver<bool>,
    ) -> MediaResult<PathBuf> {
        let total = self.probe_size(url).await?;
        let spans = plan_chunks(total, &self.config);

        debug!(
            url,
            total,
            chunks = spans.len(),
            "Planned chunked download to {}",
            dest.display()
        );

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Resume bookkeeping: count bytes already on disk per chunk.
        let mut offsets = Vec::with_capacity(spans.len());
        let mut resumed: u64 = 0;
        for span in &spans {
            let have = resume_offset(&part_path(dest, span.index), span).await?;
            resumed += have;
            offsets.push(have);
        }
        if resumed > 0 {
            info!(
                "Resuming download of {}: {} of {} bytes already on disk",
                dest.display(),
                resumed,
                total
            );
        }

        let downloaded = Arc::new(AtomicU64::new(resumed));
        let on_progress = Arc::new(on_progress);

        // Reporter task: rolling-window speed, ETA, >= 1 Hz emission.
        let (done_tx, done_rx) = watch::channel(false);
        let reporter = tokio::spawn(report_progress(
            Arc::clone(&downloaded),
            total,
            resumed,
            Arc::clone(&on_progress),
            done_rx,
        ));

        let result = self
            .fetch_chunks(url, dest, &spans, &offsets, &downloaded, cancel)
            .await;
        let _ = done_tx.send(true);
        let _ = reporter.await;
        result?;

        assemble_parts(dest, &spans, total).await?;

        on_progress(TransferProgress {
            total_size: total,
            current_size: total,
            progress: 100,
            current_speed: 0,
            average_speed: 0,
            eta: 0,
        });

        info!("Downloaded {} ({} bytes)", dest.display(), total);
        Ok(dest.to_path_buf())
    }

    /// HEAD the source for its size; chunked transfer needs it up front.
    async fn probe_size(&self, url: &str) -> MediaResult<u64> {
        let response = self
            .http
            .head(url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| MediaError::download_failed(format!("HEAD {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(MediaError::download_failed(format!(
                "HEAD {} returned {}",
                url,
                response.status()
            )));
        }

        match response.content_length() {
            Some(len) if len > 0 => Ok(len),
            _ => Err(MediaError::download_failed(format!(
                "{} has no usable content-length",
                url
            ))),
        }
    }

    /// Run all incomplete chunks, at most `max_parallel` at a time.
    async fn fetch_chunks(
        &self,
        url: &str,
        dest: &Path,
        spans: &[ChunkSpan],
        offsets: &[u64],
        downloaded: &Arc<AtomicU64>,
        cancel: watch::Receiver<bool>,
    ) -> MediaResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));
        let mut workers = JoinSet::new();

        for (span, have) in spans.iter().zip(offsets) {
            if *have >= span.len() {
                continue;
            }

            let http = self.http.clone();
            let url = url.to_string();
            let part = part_path(dest, span.index);
            let span = *span;
            let downloaded = Arc::clone(downloaded);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let retries = self.config.chunk_retries;

            workers.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| MediaError::Cancelled)?;
                fetch_chunk(&http, &url, &part, span, &downloaded, cancel, retries).await
            });
        }

        let mut failure: Option<MediaError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // First failure wins; stop the rest promptly.
                    if failure.is_none() {
                        failure = Some(e);
                        workers.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(MediaError::download_failed(format!(
                            "chunk worker panicked: {}",
                            e
                        )));
                        workers.abort_all();
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Fetch one chunk with per-chunk retry and backoff. Bytes already in the
/// part file count toward the range on every attempt.
async fn fetch_chunk(
    http: &Client,
    url: &str,
    part: &Path,
    span: ChunkSpan,
    downloaded: &Arc<AtomicU64>,
    cancel: watch::Receiver<bool>,
    retries: u32,
) -> MediaResult<()> {
    let mut attempt = 0u32;
    let mut backoff = BASE_BACKOFF;

    loop {
        if *cancel.borrow() {
            return Err(MediaError::Cancelled);
        }

        match stream_chunk_once(http, url, part, span, downloaded, cancel.clone()).await {
            Ok(()) => return Ok(()),
            Err(MediaError::Cancelled) => return Err(MediaError::Cancelled),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(
                    chunk = span.index,
                    attempt, "Chunk fetch failed, retrying in {:?}: {}", backoff, e
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => {
                return Err(MediaError::download_failed(format!(
                    "chunk {} exhausted {} retries: {}",
                    span.index, retries, e
                )));
            }
        }
    }
}

/// One ranged GET streamed into the part file in append mode.
async fn stream_chunk_once(
    http: &Client,
    url: &str,
    part: &Path,
    span: ChunkSpan,
    downloaded: &Arc<AtomicU64>,
    mut cancel: watch::Receiver<bool>,
) -> MediaResult<()> {
    let have = match fs::metadata(part).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    if have >= span.len() {
        return Ok(());
    }

    let range = format!("bytes={}-{}", span.start + have, span.end);
    let response = http
        .get(url)
        .header(reqwest::header::RANGE, range)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(MediaError::download_failed(format!(
            "ranged GET returned {}",
            response.status()
        )));
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(part)
        .await?;
    let mut body = response.bytes_stream();

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                // A dropped sender means the owner is gone; stop as if
                // cancelled, keeping the part file for resume.
                if changed.is_err() || *cancel.borrow() {
                    file.flush().await?;
                    return Err(MediaError::Cancelled);
                }
            }
            next = body.next() => {
                match next {
                    Some(Ok(bytes)) => {
                        file.write_all(&bytes).await?;
                        downloaded.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    }
                    Some(Err(e)) => {
                        file.flush().await?;
                        return Err(MediaError::Http(e));
                    }
                    None => break,
                }
            }
        }
    }
    file.flush().await?;

    let written = fs::metadata(part).await?.len();
    if written < span.len() {
        return Err(MediaError::download_failed(format!(
            "chunk {} body ended early: {} of {} bytes",
            span.index,
            written,
            span.len()
        )));
    }
    Ok(())
}

/// Emit one progress sample per second until signalled done.
async fn report_progress(
    downloaded: Arc<AtomicU64>,
    total: u64,
    resumed: u64,
    on_progress: Arc<impl Fn(TransferProgress) + Send + Sync>,
    mut done: watch::Receiver<bool>,
) {
    let mut window = SpeedWindow::new();
    let mut last = resumed;
    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = done.changed() => {
                if *done.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let current = downloaded.load(Ordering::Relaxed);
                window.push(current.saturating_sub(last));
                last = current;

                let current_speed = window.current();
                let elapsed = started.elapsed().as_secs().max(1);
                let average_speed = current.saturating_sub(resumed) / elapsed;
                let remaining = total.saturating_sub(current);
                let eta = if current_speed > 0 { remaining / current_speed } else { 0 };

                on_progress(TransferProgress {
                    total_size: total,
                    current_size: current,
                    progress: percent_of(current, total),
                    current_speed,
                    average_speed,
                    eta,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(chunk_size: u64) -> DownloadConfig {
        DownloadConfig {
            chunk_size,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_exact_chunk_boundary() {
        // size = N * chunkSize produces N chunks of exactly chunkSize.
        let plan = plan_chunks(4 * 1024, &config(1024));
        assert_eq!(plan.len(), 4);
        for (i, span) in plan.iter().enumerate() {
            assert_eq!(span.len(), 1024);
            assert_eq!(span.start, i as u64 * 1024);
        }
        assert_eq!(plan.last().unwrap().end, 4 * 1024 - 1);
    }

    #[test]
    fn test_plan_remainder_goes_to_last_chunk() {
        let plan = plan_chunks(2_500, &config(1024));
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].len(), 1024);
        assert_eq!(plan[2].len(), 2_500 - 2 * 1024);
        assert_eq!(plan[2].end, 2_499);
    }

    #[test]
    fn test_plan_clamps_to_max_chunks() {
        // 200 MiB at 5 MiB chunks would be 40; clamped to 32.
        let plan = plan_chunks(200 * 1024 * 1024, &DownloadConfig::default());
        assert_eq!(plan.len(), 32);
        let covered: u64 = plan.iter().map(|s| s.len()).sum();
        assert_eq!(covered, 200 * 1024 * 1024);
    }

    #[test]
    fn test_plan_single_chunk_for_small_file() {
        let plan = plan_chunks(10, &DownloadConfig::default());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].start, 0);
        assert_eq!(plan[0].end, 9);
    }

    #[test]
    fn test_plan_respects_min_chunks() {
        let cfg = DownloadConfig {
            chunk_size: 1024 * 1024,
            min_chunks: 4,
            ..Default::default()
        };
        let plan = plan_chunks(100, &cfg);
        // Tiny file still split into min_chunks ranges only while they
        // hold at least one byte.
        assert!(plan.len() <= 4);
        let covered: u64 = plan.iter().map(|s| s.len()).sum();
        assert_eq!(covered, 100);
    }

    #[test]
    fn test_part_path_naming() {
        let part = part_path(Path::new("/tmp/videoconverter/t1/source.mp4"), 3);
        assert_eq!(
            part,
            PathBuf::from("/tmp/videoconverter/t1/source.mp4.part3")
        );
    }

    #[tokio::test]
    async fn test_resume_offset_counts_existing_bytes() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("video.mp4");
        let span = ChunkSpan {
            index: 0,
            start: 0,
            end: 1023,
        };

        let part = part_path(&dest, 0);
        fs::write(&part, vec![7u8; 512]).await.unwrap();
        assert_eq!(resume_offset(&part, &span).await.unwrap(), 512);
    }

    #[tokio::test]
    async fn test_resume_offset_restarts_oversized_part() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("video.mp4");
        let span = ChunkSpan {
            index: 0,
            start: 0,
            end: 99,
        };

        let part = part_path(&dest, 0);
        fs::write(&part, vec![7u8; 500]).await.unwrap();
        assert_eq!(resume_offset(&part, &span).await.unwrap(), 0);
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn test_assemble_parts_in_order_and_verify() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");
        let spans = [
            ChunkSpan {
                index: 0,
                start: 0,
                end: 2,
            },
            ChunkSpan {
                index: 1,
                start: 3,
                end: 5,
            },
        ];

        fs::write(part_path(&dest, 0), b"abc").await.unwrap();
        fs::write(part_path(&dest, 1), b"def").await.unwrap();

        assemble_parts(&dest, &spans, 6).await.unwrap();

        assert_eq!(fs::read(&dest).await.unwrap(), b"abcdef");
        assert!(!part_path(&dest, 0).exists());
        assert!(!part_path(&dest, 1).exists());
    }

    #[tokio::test]
    async fn test_assemble_detects_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");
        let spans = [ChunkSpan {
            index: 0,
            start: 0,
            end: 9,
        }];

        fs::write(part_path(&dest, 0), b"short").await.unwrap();

        let err = assemble_parts(&dest, &spans, 10).await.unwrap_err();
        assert!(matches!(
            err,
            MediaError::SizeMismatch {
                expected: 10,
                actual: 5
            }
        ));
    }

    #[tokio::test]
    async fn test_purge_parts_removes_siblings() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("video.mp4");

        fs::write(part_path(&dest, 0), b"x").await.unwrap();
        fs::write(part_path(&dest, 5), b"y").await.unwrap();

        purge_parts(&dest).await.unwrap();
        assert!(!part_path(&dest, 0).exists());
        assert!(!part_path(&dest, 5).exists());
    }
}
