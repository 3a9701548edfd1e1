//! Runner configuration from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use vconv_media::DownloadConfig;
use vconv_models::Encoder;

use crate::error::{RunnerError, RunnerResult};

/// Directory under the system temp root holding all scratch files.
const SCRATCH_DIR_NAME: &str = "videoconverter";

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Control-plane base URL
    pub base_url: String,
    /// One-time provisioning secret; unnecessary once an identity file exists
    pub bootstrap_token: Option<String>,
    /// Machine name reported at registration
    pub machine_name: String,
    /// Operator encoder hint; the probe may override it
    pub encoder_hint: Encoder,
    /// Debug logging outside production
    pub debug: bool,
    /// Concurrent downloads
    pub download_slots: usize,
    /// Concurrent encodes
    pub convert_slots: usize,
    /// Concurrent uploads
    pub upload_slots: usize,
    /// Control-plane poll cadence
    pub poll_interval: Duration,
    /// Heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Dispatch tick
    pub dispatch_interval: Duration,
    /// Bound on the shutdown drain
    pub shutdown_timeout: Duration,
    /// Scratch root for task workspaces
    pub scratch_root: PathBuf,
    /// Downloader tuning
    pub download: DownloadConfig,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl RunnerConfig {
    /// Load from the environment. `BASE_URL` is required; a missing value
    /// is a fatal configuration error.
    pub fn from_env() -> RunnerResult<Self> {
        let base_url = std::env::var("BASE_URL")
            .map_err(|_| RunnerError::config("BASE_URL not set"))?;

        let machine_name = std::env::var("HOSTNAME").ok().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "vconv-runner".to_string())
        });

        let encoder_hint = std::env::var("ENCODER")
            .map(|v| Encoder::from_hint(&v))
            .unwrap_or_default();

        let debug = std::env::var("NODE_ENV")
            .map(|v| v != "production")
            .unwrap_or(false);

        let mut download = DownloadConfig::default();
        download.chunk_size = env_parsed("DOWNLOAD_CHUNK_SIZE", download.chunk_size);
        download.min_chunks = env_parsed("DOWNLOAD_MIN_CHUNKS", download.min_chunks);
        download.max_parallel = env_parsed("DOWNLOAD_PARALLEL", download.max_parallel);

        Ok(Self {
            base_url,
            bootstrap_token: std::env::var("token").ok(),
            machine_name,
            encoder_hint,
            debug,
            download_slots: env_parsed("DOWNLOAD_SLOTS", 1),
            convert_slots: env_parsed("CONVERT_SLOTS", 1),
            upload_slots: env_parsed("UPLOAD_SLOTS", 1),
            poll_interval: Duration::from_secs(env_parsed("POLL_INTERVAL_SECS", 5)),
            heartbeat_interval: Duration::from_secs(env_parsed("HEARTBEAT_INTERVAL_SECS", 20)),
            dispatch_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(env_parsed("SHUTDOWN_TIMEOUT_SECS", 30)),
            scratch_root: std::env::temp_dir().join(SCRATCH_DIR_NAME),
            download,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_root_under_system_temp() {
        let root = std::env::temp_dir().join(SCRATCH_DIR_NAME);
        assert!(root.ends_with("videoconverter"));
        assert!(root.starts_with(std::env::temp_dir()));
    }
}
