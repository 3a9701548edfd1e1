//! Video bitrate targeting against a fixed output-size ceiling.

/// Default output-size ceiling: 3.8 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = (3.8 * 1024.0 * 1024.0 * 1024.0) as u64;
/// Audio bitrate reserved out of the budget, bits/second.
pub const DEFAULT_AUDIO_BITRATE: u64 = 192_000;
/// Never target below this, bits/second.
pub const MIN_VIDEO_BITRATE: u64 = 100_000;

/// Constraints fed to the solver.
#[derive(Debug, Clone)]
pub struct BitrateTarget {
    /// Output file must not exceed this many bytes
    pub max_file_size: u64,
    /// Upper bound on the video bitrate, bits/second
    pub max_video_bitrate: u64,
    /// Audio bitrate reserved from the size budget, bits/second
    pub audio_bitrate: u64,
}

impl Default for BitrateTarget {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_video_bitrate: 8_000_000,
            audio_bitrate: DEFAULT_AUDIO_BITRATE,
        }
    }
}

/// Solve the video bitrate (bits/second) for a given input duration.
///
/// budget = max_file_size * 8 / duration, minus the audio share, capped by
/// the configured ceiling and floored at 100 kbps.
pub fn solve_video_bitrate(duration_secs: f64, target: &BitrateTarget) -> u64 {
    debug_assert!(duration_secs > 0.0);

    let budget = ((target.max_file_size as f64) * 8.0 / duration_secs) as u64;
    let video = budget.saturating_sub(target.audio_bitrate);

    video.min(target.max_video_bitrate).max(MIN_VIDEO_BITRATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_input_hits_the_ceiling() {
        // A one-minute input easily fits 3.8 GiB; ceiling wins.
        let target = BitrateTarget::default();
        assert_eq!(solve_video_bitrate(60.0, &target), target.max_video_bitrate);
    }

    #[test]
    fn test_long_input_is_size_bound() {
        let target = BitrateTarget {
            max_video_bitrate: 50_000_000,
            ..Default::default()
        };
        // Ten hours: budget = 3.8 GiB * 8 / 36000 s ≈ 906 kbps, minus audio.
        let solved = solve_video_bitrate(36_000.0, &target);
        let budget = (DEFAULT_MAX_FILE_SIZE as f64 * 8.0 / 36_000.0) as u64;
        assert_eq!(solved, budget - DEFAULT_AUDIO_BITRATE);
        assert!(solved < target.max_video_bitrate);
    }

    #[test]
    fn test_floor_at_100_kbps() {
        let target = BitrateTarget {
            max_file_size: 1024 * 1024, // 1 MiB for a very long input
            ..Default::default()
        };
        assert_eq!(solve_video_bitrate(100_000.0, &target), MIN_VIDEO_BITRATE);
    }
}
