use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device,
};

use crate::error::Result;

/// Environment variable that forces CPU execution when set to anything but
/// `0`/`false`/empty.
pub const FORCE_CPU_ENV: &str = "BARK_FORCE_CPU";

pub fn force_cpu_from_env() -> bool {
    std::env::var(FORCE_CPU_ENV)
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "" | "0" | "false"))
        .unwrap_or(false)
}

/// cuda → metal → cpu.
pub fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// Half precision on cuda, f32 elsewhere.
pub fn default_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}
