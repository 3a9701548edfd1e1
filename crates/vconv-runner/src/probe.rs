//! System probe: CPU, memory, disk, and optional GPU telemetry.
//!
//! Probing is best-effort. Any individual failure degrades that block and
//! logs a warning; the probe as a whole never aborts the runner.

use std::process::Stdio;
use std::time::Duration;

use sysinfo::{Disks, System};
use tokio::process::Command;
use tracing::{debug, warn};

use vconv_models::{CpuInfo, DeviceInfo, DiskInfo, Encoder, GpuInfo, MemoryInfo};

/// Vendor tool calls are bounded by this.
const GPU_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Snapshot the machine and decide the encoder capability.
///
/// `hint` is the operator's `ENCODER` setting: a probe that conclusively
/// finds or rules out an NVENC GPU overrides it; an inconclusive probe
/// (vendor tool missing) leaves it in place.
pub async fn probe_system(hint: Encoder) -> (DeviceInfo, Encoder) {
    let mut info = snapshot_host();

    let encoder = match probe_gpu().await {
        GpuProbe::Found(gpu) => {
            info.gpu = Some(gpu);
            Encoder::Hardware
        }
        GpuProbe::NotFound => Encoder::Cpu,
        GpuProbe::Unavailable => {
            debug!("GPU vendor tool unavailable, keeping encoder hint {}", hint);
            hint
        }
    };

    (info, encoder)
}

/// CPU, memory, and disk via sysinfo.
fn snapshot_host() -> DeviceInfo {
    let mut sys = System::new_all();
    sys.refresh_all();

    let cpus = sys.cpus();
    let cpu = match cpus.first() {
        Some(first) => CpuInfo {
            brand: first.brand().to_string(),
            cores: cpus.len(),
            speed: first.frequency(),
            load: sys.global_cpu_info().cpu_usage(),
        },
        None => {
            warn!("CPU probe returned no cores");
            DeviceInfo::unknown().cpu
        }
    };

    let total_mem = sys.total_memory();
    let used_mem = sys.used_memory();
    let memory = MemoryInfo {
        total: total_mem,
        free: sys.available_memory(),
        used: used_mem,
        used_percent: percent(used_mem, total_mem),
    };

    let disks = Disks::new_with_refreshed_list();
    let (disk_total, disk_free) = disks
        .iter()
        .fold((0u64, 0u64), |(total, free), disk| {
            (total + disk.total_space(), free + disk.available_space())
        });
    let disk = DiskInfo {
        total: disk_total,
        free: disk_free,
        used: disk_total.saturating_sub(disk_free),
        used_percent: percent(disk_total.saturating_sub(disk_free), disk_total),
    };

    DeviceInfo {
        cpu,
        memory,
        disk,
        gpu: None,
    }
}

fn percent(part: u64, whole: u64) -> f32 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0) as f32
}

enum GpuProbe {
    Found(GpuInfo),
    /// Tool ran and reported no usable GPU
    NotFound,
    /// Tool missing or timed out
    Unavailable,
}

/// Query the first GPU row from nvidia-smi, bounded by the probe timeout.
async fn probe_gpu() -> GpuProbe {
    if which::which("nvidia-smi").is_err() {
        return GpuProbe::Unavailable;
    }

    let command = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.used,utilization.gpu,temperature.gpu,driver_version",
            "--format=csv,noheader,nounits",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = match tokio::time::timeout(GPU_PROBE_TIMEOUT, command).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("nvidia-smi failed to run: {}", e);
            return GpuProbe::Unavailable;
        }
        Err(_) => {
            warn!("nvidia-smi timed out after {:?}", GPU_PROBE_TIMEOUT);
            return GpuProbe::Unavailable;
        }
    };

    if !output.status.success() {
        debug!(
            "nvidia-smi exited with {}: no usable GPU",
            output.status
        );
        return GpuProbe::NotFound;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match stdout.lines().find_map(parse_gpu_row) {
        Some(gpu) => GpuProbe::Found(gpu),
        None => GpuProbe::NotFound,
    }
}

/// Parse one `csv,noheader,nounits` row from nvidia-smi.
fn parse_gpu_row(line: &str) -> Option<GpuInfo> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return None;
    }

    let memory_total_mib: u64 = fields[1].parse().ok()?;
    let memory_used_mib: u64 = fields[2].parse().ok()?;
    let utilization: f32 = fields[3].parse().ok()?;

    Some(GpuInfo {
        vendor: "NVIDIA".to_string(),
        model: fields[0].to_string(),
        memory_total: memory_total_mib * BYTES_PER_MIB,
        memory_used: memory_used_mib * BYTES_PER_MIB,
        utilization,
        temperature: fields.get(4).and_then(|f| f.parse().ok()),
        driver_version: fields.get(5).map(|f| f.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpu_row() {
        let gpu =
            parse_gpu_row("NVIDIA GeForce RTX 3080, 10240, 1024, 37, 55, 535.154.05").unwrap();
        assert_eq!(gpu.model, "NVIDIA GeForce RTX 3080");
        assert_eq!(gpu.memory_total, 10240 * BYTES_PER_MIB);
        assert_eq!(gpu.memory_used, 1024 * BYTES_PER_MIB);
        assert_eq!(gpu.utilization, 37.0);
        assert_eq!(gpu.temperature, Some(55.0));
        assert_eq!(gpu.driver_version.as_deref(), Some("535.154.05"));
    }

    #[test]
    fn test_parse_gpu_row_rejects_garbage() {
        assert!(parse_gpu_row("").is_none());
        assert!(parse_gpu_row("No devices were found").is_none());
        assert!(parse_gpu_row("name, not-a-number, 0, 0").is_none());
    }

    #[test]
    fn test_percent_bounds() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(50, 100), 50.0);
        assert_eq!(percent(100, 100), 100.0);
    }
}
