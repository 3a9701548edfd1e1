//! Machine telemetry reported at registration and with each heartbeat.

use serde::{Deserialize, Serialize};

/// Encoder capability of this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoder {
    /// NVENC-capable GPU available
    Hardware,
    #[default]
    Cpu,
}

impl Encoder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoder::Hardware => "hardware",
            Encoder::Cpu => "cpu",
        }
    }

    /// Parse an operator hint; anything unrecognized reads as CPU.
    pub fn from_hint(hint: &str) -> Self {
        match hint.trim().to_ascii_lowercase().as_str() {
            "hardware" | "gpu" | "nvenc" => Encoder::Hardware,
            _ => Encoder::Cpu,
        }
    }
}

impl std::fmt::Display for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuInfo {
    pub brand: String,
    pub cores: usize,
    /// Clock speed in MHz
    pub speed: u64,
    /// Current load, 0..=100
    pub load: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub used_percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub used_percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuInfo {
    pub vendor: String,
    pub model: String,
    pub memory_total: u64,
    pub memory_used: u64,
    /// GPU utilization, 0..=100
    pub utilization: f32,
    /// Core temperature in Celsius
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_version: Option<String>,
}

/// Full hardware snapshot for one heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disk: DiskInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuInfo>,
}

impl DeviceInfo {
    /// Minimal placeholder used when probing fails entirely.
    pub fn unknown() -> Self {
        Self {
            cpu: CpuInfo {
                brand: "unknown".to_string(),
                cores: 0,
                speed: 0,
                load: 0.0,
            },
            memory: MemoryInfo {
                total: 0,
                free: 0,
                used: 0,
                used_percent: 0.0,
            },
            disk: DiskInfo {
                total: 0,
                free: 0,
                used: 0,
                used_percent: 0.0,
            },
            gpu: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_wire_format() {
        assert_eq!(
            serde_json::to_string(&Encoder::Hardware).unwrap(),
            "\"hardware\""
        );
        assert_eq!(Encoder::from_hint("NVENC"), Encoder::Hardware);
        assert_eq!(Encoder::from_hint("cpu"), Encoder::Cpu);
        assert_eq!(Encoder::from_hint(""), Encoder::Cpu);
    }

    #[test]
    fn test_device_info_gpu_omitted_when_absent() {
        let info = DeviceInfo::unknown();
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("gpu").is_none());
        assert!(json.get("usedPercent").is_none());
        assert_eq!(json["memory"]["usedPercent"], 0.0);
    }
}
