//! # Compute Device Selection
//!
//! Maps the configured device preference (`auto`, `cpu`, `cuda`, `metal`) onto a
//! candle [`Device`]. Requests for an accelerator that is not available fall back
//! to the CPU with a warning instead of failing startup.

use candle_core::Device;
use tracing::{debug, info, warn};

/// Device preferences for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Use CUDA or Metal when present, otherwise the CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" | "mps" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

/// Resolve a preference into a usable device.
pub fn resolve(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => cuda().unwrap_or_else(|| {
            warn!("CUDA requested but unavailable, falling back to CPU");
            Device::Cpu
        }),
        DevicePreference::Metal => metal().unwrap_or_else(|| {
            warn!("Metal requested but unavailable, falling back to CPU");
            Device::Cpu
        }),
        DevicePreference::Auto => {
            let device = cuda().or_else(metal).unwrap_or(Device::Cpu);
            info!(device = describe(&device), "Selected compute device");
            device
        }
    }
}

/// Short label for logs and the status endpoint.
pub fn describe(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

fn cuda() -> Option<Device> {
    if !candle_core::utils::cuda_is_available() {
        return None;
    }
    Device::new_cuda(0)
        .map_err(|e| debug!("CUDA not available: {}", e))
        .ok()
}

fn metal() -> Option<Device> {
    if !candle_core::utils::metal_is_available() {
        return None;
    }
    Device::new_metal(0)
        .map_err(|e| debug!("Metal not available: {}", e))
        .ok()
}
