//! Hardware detection and precision recommendation.

use std::path::Path;
use std::process::Command;

use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::{DeviceMap, Precision};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const VENDOR_NVIDIA: &str = "0x10de";
const VENDOR_AMD: &str = "0x1002";

/// Compute device kind. Downstream code branches on this, never on vendor SDKs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
    Mps,
    Rocm,
}

serde_plain::derive_display_from_serialize!(Device);

/// Immutable snapshot of the machine, taken once per process.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HardwareProfile {
    pub device: Device,
    /// Total system memory; `0.0` when the platform does not report it.
    pub total_ram_gb: f64,
    /// Dedicated accelerator memory, when it can be queried.
    pub vram_gb: Option<f64>,
    pub recommended_precision: Precision,
}

impl HardwareProfile {
    pub fn from_parts(device: Device, total_ram_gb: f64, vram_gb: Option<f64>) -> Self {
        let ram = (total_ram_gb > 0.0).then_some(total_ram_gb);
        Self {
            device,
            total_ram_gb,
            vram_gb,
            recommended_precision: recommend_precision(device, ram, vram_gb),
        }
    }

    /// Total RAM, `None` when unknown.
    pub fn ram_gb(&self) -> Option<f64> {
        (self.total_ram_gb > 0.0).then_some(self.total_ram_gb)
    }

    /// Whether the pipeline should run in its memory-saving mode.
    ///
    /// CPU and unified-memory devices always slice; discrete GPUs slice below
    /// 12 GB of VRAM or when VRAM is unknown.
    pub fn should_slice_attention(&self) -> bool {
        match self.device {
            Device::Cpu | Device::Mps => true,
            Device::Cuda | Device::Rocm => self.vram_gb.map_or(true, |v| v < 12.0),
        }
    }

    /// Picks the candle device matching this profile.
    pub fn candle_device(&self, device_map: DeviceMap) -> Result<candle_core::Device> {
        match (device_map, self.device) {
            (DeviceMap::ForceCpu, _) => Ok(candle_core::Device::Cpu),
            (DeviceMap::Ordinal(ordinal), Device::Cuda) => {
                Ok(candle_core::Device::new_cuda(ordinal)?)
            }
            (DeviceMap::Ordinal(ordinal), Device::Mps) => {
                Ok(candle_core::Device::new_metal(ordinal)?)
            }
            (DeviceMap::Ordinal(_), Device::Rocm) => {
                warn!("ROCm has no candle backend, running on CPU");
                Ok(candle_core::Device::Cpu)
            }
            (DeviceMap::Ordinal(_), Device::Cpu) => Ok(candle_core::Device::Cpu),
        }
    }
}

/// Thresholds memory (VRAM, falling back to RAM) into a precision tier.
pub fn recommend_precision(device: Device, ram_gb: Option<f64>, vram_gb: Option<f64>) -> Precision {
    match device {
        Device::Cuda | Device::Rocm => match vram_gb.or(ram_gb) {
            Some(m) if m < 8.0 => Precision::Q4,
            Some(m) if m < 16.0 => Precision::Q8,
            Some(_) => Precision::Full,
            None => Precision::Q8,
        },
        Device::Mps => match ram_gb {
            Some(m) if m <= 24.0 => Precision::Q4,
            Some(m) if m <= 48.0 => Precision::Q8,
            Some(_) => Precision::Full,
            None => Precision::Q4,
        },
        Device::Cpu => match ram_gb {
            Some(m) if m < 8.0 => Precision::Q4,
            _ => Precision::Q8,
        },
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuVendor {
    Nvidia,
    Amd,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DiscreteGpu {
    pub vendor: GpuVendor,
    pub vram_gb: Option<f64>,
}

/// Source of raw hardware facts. None of these may fail; unknown is `None`.
pub trait HardwareProbe {
    fn cuda_available(&self) -> bool;
    fn metal_available(&self) -> bool;
    fn discrete_gpu(&self) -> Option<DiscreteGpu>;
    fn total_ram_gb(&self) -> Option<f64>;
}

/// Probes the running machine through candle, sysinfo, sysfs and `nvidia-smi`.
pub struct SystemProbe;

impl HardwareProbe for SystemProbe {
    fn cuda_available(&self) -> bool {
        cuda_is_available()
    }

    fn metal_available(&self) -> bool {
        metal_is_available()
    }

    fn discrete_gpu(&self) -> Option<DiscreteGpu> {
        if let Some(vram_gb) = nvidia_smi_vram_gb() {
            return Some(DiscreteGpu {
                vendor: GpuVendor::Nvidia,
                vram_gb: Some(vram_gb),
            });
        }
        sysfs_gpu(Path::new("/sys/class/drm"))
    }

    fn total_ram_gb(&self) -> Option<f64> {
        let mut sys = System::new();
        sys.refresh_memory();
        let bytes = sys.total_memory();
        (bytes > 0).then(|| bytes as f64 / GIB)
    }
}

/// Detects the current machine.
pub fn detect() -> HardwareProfile {
    detect_with(&SystemProbe)
}

/// Accelerator checks run CUDA first, then vendor discrete GPUs, then unified
/// memory, before settling on CPU.
pub fn detect_with(probe: &dyn HardwareProbe) -> HardwareProfile {
    let ram = probe.total_ram_gb();
    let gpu = probe.discrete_gpu();

    let (device, vram_gb) = if probe.cuda_available() {
        let vram = gpu
            .filter(|g| g.vendor == GpuVendor::Nvidia)
            .and_then(|g| g.vram_gb);
        if vram.is_none() {
            warn!("CUDA device found but its memory could not be queried");
        }
        (Device::Cuda, vram)
    } else if let Some(DiscreteGpu {
        vendor: GpuVendor::Amd,
        vram_gb,
    }) = gpu
    {
        warn!("AMD GPU detected; no accelerated backend is available for it, inference will run on CPU");
        (Device::Rocm, vram_gb)
    } else {
        if matches!(gpu, Some(g) if g.vendor == GpuVendor::Nvidia) {
            warn!("NVIDIA GPU present but this build has no CUDA support, rebuild with `--features cuda`");
        }
        if probe.metal_available() {
            (Device::Mps, None)
        } else {
            (Device::Cpu, None)
        }
    };

    let profile = HardwareProfile::from_parts(device, ram.unwrap_or(0.0), vram_gb);
    info!(
        "Hardware detected: device={}, ram={}, vram={}, recommended precision={}",
        profile.device,
        fmt_gb(profile.ram_gb()),
        fmt_gb(profile.vram_gb),
        profile.recommended_precision
    );
    profile
}

fn fmt_gb(value: Option<f64>) -> String {
    value.map_or_else(|| "unknown".to_string(), |v| format!("{v:.1}GB"))
}

fn nvidia_smi_vram_gb() -> Option<f64> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_nvidia_smi_mib(&stdout).map(|mib| mib / 1024.0)
}

/// First GPU's total memory from `nvidia-smi` CSV output, in MiB.
fn parse_nvidia_smi_mib(stdout: &str) -> Option<f64> {
    stdout.lines().next()?.trim().parse::<f64>().ok()
}

fn sysfs_gpu(drm: &Path) -> Option<DiscreteGpu> {
    let entries = std::fs::read_dir(drm).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("card") || name.contains('-') {
            continue;
        }
        let device_dir = entry.path().join("device");
        let vendor = match std::fs::read_to_string(device_dir.join("vendor")) {
            Ok(v) => v.trim().to_ascii_lowercase(),
            Err(_) => continue,
        };
        let vendor = match vendor.as_str() {
            VENDOR_AMD => GpuVendor::Amd,
            VENDOR_NVIDIA => GpuVendor::Nvidia,
            _ => continue,
        };
        let vram_gb = std::fs::read_to_string(device_dir.join("mem_info_vram_total"))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|bytes| bytes as f64 / GIB);
        debug!("sysfs GPU {}: {:?}, vram={:?}", name, vendor, vram_gb);
        // APUs report a small carve-out; only treat >= 2 GB as discrete.
        if vendor == GpuVendor::Amd && vram_gb.map_or(false, |v| v < 2.0) {
            continue;
        }
        return Some(DiscreteGpu { vendor, vram_gb });
    }
    None
}
