//! # Device Selection
//!
//! Resolves the recognition section's `device`, `gpu_device_index` and `compute_type`
//! into a candle `Device` and `DType`. The result is an immutable value captured once
//! when a session's engine is constructed; nothing here is cached globally.

use candle_core::{DType, Device};
use tracing::{debug, info, warn};

/// Device preferences for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Use the first available accelerator, falling back to CPU
    #[default]
    Auto,
    Cpu,
    /// CUDA GPU (falls back to CPU if not available)
    Cuda,
    /// Metal GPU (falls back to CPU if not available)
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

/// Numeric precision for model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputePrecision {
    /// F32 everywhere; Whisper's reference precision
    #[default]
    Default,
    Float32,
    Float16,
    BFloat16,
    /// int8 / int16 families; candle Whisper runs these at the default precision
    Quantized,
}

impl std::str::FromStr for ComputePrecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" | "auto" => Ok(ComputePrecision::Default),
            "float32" | "f32" => Ok(ComputePrecision::Float32),
            "float16" | "f16" => Ok(ComputePrecision::Float16),
            "bfloat16" | "bf16" => Ok(ComputePrecision::BFloat16),
            "int8" | "int8_float16" | "int8_float32" | "int8_bfloat16" | "int16" => {
                Ok(ComputePrecision::Quantized)
            }
            _ => Err(format!("Unknown compute type: {}", s)),
        }
    }
}

/// A resolved device/precision pair for one engine instance.
#[derive(Debug, Clone)]
pub struct ComputeTarget {
    pub device: Device,
    pub dtype: DType,
}

impl ComputeTarget {
    /// Resolve preferences into a usable target.
    ///
    /// ## Fallbacks:
    /// - An unavailable accelerator falls back to CPU (logged at warn)
    /// - Half precision on CPU falls back to F32, since most CPU kernels lack it
    pub fn resolve(preference: DevicePreference, gpu_index: usize, precision: ComputePrecision) -> Self {
        let device = match preference {
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => cuda_device(gpu_index).unwrap_or_else(|| {
                warn!("CUDA device {} requested but unavailable, using CPU", gpu_index);
                Device::Cpu
            }),
            DevicePreference::Metal => metal_device(gpu_index).unwrap_or_else(|| {
                warn!("Metal device {} requested but unavailable, using CPU", gpu_index);
                Device::Cpu
            }),
            DevicePreference::Auto => cuda_device(gpu_index)
                .or_else(|| metal_device(gpu_index))
                .unwrap_or(Device::Cpu),
        };

        let dtype = match (precision, device.is_cpu()) {
            (ComputePrecision::Default | ComputePrecision::Float32, _) => DType::F32,
            (ComputePrecision::Quantized, _) => {
                warn!("Quantized compute types are not supported, using default precision");
                DType::F32
            }
            (ComputePrecision::Float16 | ComputePrecision::BFloat16, true) => {
                warn!("{:?} is not supported on CPU, using F32", precision);
                DType::F32
            }
            (ComputePrecision::Float16, false) => DType::F16,
            (ComputePrecision::BFloat16, false) => DType::BF16,
        };

        info!("Compute target: {} ({:?})", describe(&device), dtype);
        Self { device, dtype }
    }

    /// Resolve from the raw strings of the recognition config.
    pub fn from_names(device: &str, gpu_index: usize, compute_type: &str) -> Self {
        let preference = device.parse().unwrap_or_else(|e| {
            warn!("{}, using auto", e);
            DevicePreference::Auto
        });
        let precision = compute_type.parse().unwrap_or_else(|e| {
            warn!("{}, using default", e);
            ComputePrecision::Default
        });
        Self::resolve(preference, gpu_index, precision)
    }
}

fn cuda_device(index: usize) -> Option<Device> {
    match Device::new_cuda(index) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("CUDA device {} not available: {}", index, e);
            None
        }
    }
}

fn metal_device(index: usize) -> Option<Device> {
    match Device::new_metal(index) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("Metal device {} not available: {}", index, e);
            None
        }
    }
}

/// Human-readable device name for logs and the health endpoint.
pub fn describe(device: &Device) -> &'static str {
    if device.is_cuda() {
        "CUDA GPU"
    } else if device.is_metal() {
        "Metal GPU"
    } else {
        "CPU"
    }
}
