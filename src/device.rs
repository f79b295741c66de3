//! # Compute Device Selection
//!
//! Resolves the configured device preference string to a Candle device,
//! falling back to CPU whenever the requested accelerator is unavailable.

use candle_core::Device;
use tracing::{debug, info, warn};

/// Device preferences for model inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Pick the best available device
    #[default]
    Auto,
    /// Force CPU
    Cpu,
    /// CUDA GPU, CPU fallback
    Cuda,
    /// Metal GPU, CPU fallback
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

/// Resolve a preference string from configuration to a concrete device.
/// Unknown strings behave like "auto" so a typo degrades gracefully instead
/// of preventing startup.
pub fn resolve_device(preference: &str) -> Device {
    let preference = preference.parse::<DevicePreference>().unwrap_or_else(|err| {
        warn!("{}, using auto", err);
        DevicePreference::Auto
    });

    match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => cuda_device().unwrap_or(Device::Cpu),
        DevicePreference::Metal => metal_device().unwrap_or(Device::Cpu),
        DevicePreference::Auto => {
            if let Some(device) = cuda_device() {
                info!("Selected CUDA GPU for inference");
                device
            } else if let Some(device) = metal_device() {
                info!("Selected Metal GPU for inference");
                device
            } else {
                info!("Using CPU for inference (no GPU acceleration available)");
                Device::Cpu
            }
        }
    }
}

fn cuda_device() -> Option<Device> {
    match Device::new_cuda(0) {
        Ok(device) => Some(device),
        Err(err) => {
            debug!("CUDA not available: {}", err);
            None
        }
    }
}

fn metal_device() -> Option<Device> {
    match Device::new_metal(0) {
        Ok(device) => Some(device),
        Err(err) => {
            debug!("Metal not available: {}", err);
            None
        }
    }
}
