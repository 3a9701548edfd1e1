//! Progress structures shared by the downloader and the transcoder.

use std::collections::VecDeque;

/// Samples kept in the rolling speed window.
const SPEED_WINDOW_SAMPLES: usize = 5;

/// Transfer progress for downloads and uploads.
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    pub total_size: u64,
    pub current_size: u64,
    /// Integer percentage 0..=100
    pub progress: u8,
    /// Bytes per second over the rolling window
    pub current_speed: u64,
    /// Bytes per second since the transfer began
    pub average_speed: u64,
    /// Seconds remaining at the current speed
    pub eta: u64,
}

/// One parsed update from the encoder's progress stream.
#[derive(Debug, Clone, Default)]
pub struct TranscodeProgress {
    pub frame: u64,
    pub fps: f64,
    /// Encoder output bitrate in kbit/s
    pub bitrate_kbps: u64,
    /// Output timestamp in milliseconds
    pub out_time_ms: i64,
    /// Percentage of the input duration encoded, 0..=100
    pub percent: u8,
}

/// Rolling window over per-second byte deltas.
///
/// `current` averages the retained samples; the caller pushes one sample
/// per tick and reads the smoothed rate back.
#[derive(Debug)]
pub struct SpeedWindow {
    samples: VecDeque<u64>,
}

impl SpeedWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(SPEED_WINDOW_SAMPLES),
        }
    }

    /// Record bytes moved since the previous tick.
    pub fn push(&mut self, delta: u64) {
        if self.samples.len() == SPEED_WINDOW_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(delta);
    }

    /// Smoothed bytes-per-tick over the window; zero before any sample.
    pub fn current(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        self.samples.iter().sum::<u64>() / self.samples.len() as u64
    }
}

impl Default for SpeedWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Integer percentage of `current` against `total`, saturating at 100.
pub(crate) fn percent_of(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((current.saturating_mul(100)) / total).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_window_averages_last_samples() {
        let mut window = SpeedWindow::new();
        assert_eq!(window.current(), 0);

        for delta in [100, 200, 300] {
            window.push(delta);
        }
        assert_eq!(window.current(), 200);

        // Window keeps only the newest five samples.
        for delta in [400, 500, 600] {
            window.push(delta);
        }
        assert_eq!(window.current(), (200 + 300 + 400 + 500 + 600) / 5);
    }

    #[test]
    fn test_percent_saturates() {
        assert_eq!(percent_of(0, 100), 0);
        assert_eq!(percent_of(50, 100), 50);
        assert_eq!(percent_of(150, 100), 100);
        assert_eq!(percent_of(10, 0), 0);
    }
}
