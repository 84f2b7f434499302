//! Device selection.
//!
//! A [`DeviceSelection`] is what the operator asks for; a [`DeviceResolver`]
//! turns it into a concrete device of the compiled backend.

use std::fmt;
use std::str::FromStr;

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Requested compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSelection {
    /// Best device the backend offers.
    #[default]
    Auto,
    /// Force CPU execution.
    Cpu,
    /// Accelerator by ordinal.
    Gpu(usize),
}

impl DeviceSelection {
    /// Whether an accelerator was explicitly requested.
    pub fn wants_gpu(&self) -> bool {
        matches!(self, DeviceSelection::Gpu(_))
    }
}

impl fmt::Display for DeviceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelection::Auto => write!(f, "auto"),
            DeviceSelection::Cpu => write!(f, "cpu"),
            DeviceSelection::Gpu(index) => write!(f, "gpu:{}", index),
        }
    }
}

impl FromStr for DeviceSelection {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match normalized.split_once(':') {
            Some((kind, ordinal)) => (kind, Some(ordinal)),
            None => (normalized.as_str(), None),
        };

        match (kind, ordinal) {
            ("auto", None) => Ok(DeviceSelection::Auto),
            ("cpu", None) => Ok(DeviceSelection::Cpu),
            ("gpu" | "cuda" | "wgpu", None) => Ok(DeviceSelection::Gpu(0)),
            ("gpu" | "cuda" | "wgpu", Some(ordinal)) => ordinal
                .parse::<usize>()
                .map(DeviceSelection::Gpu)
                .map_err(|_| CoreError::InvalidDevice(s.to_string())),
            _ => Err(CoreError::InvalidDevice(s.to_string())),
        }
    }
}

impl TryFrom<String> for DeviceSelection {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceSelection> for String {
    fn from(value: DeviceSelection) -> Self {
        value.to_string()
    }
}

/// Backends that can map a [`DeviceSelection`] onto one of their devices.
pub trait DeviceResolver: Backend {
    /// Resolve the selection to a device of this backend.
    fn resolve_device(selection: DeviceSelection) -> Self::Device;

    /// Short human-readable label for a device (`cpu`, `gpu:0`, ...).
    fn device_label(device: &Self::Device) -> String;
}

#[cfg(feature = "backend-ndarray")]
impl DeviceResolver for burn_ndarray::NdArray {
    fn resolve_device(selection: DeviceSelection) -> Self::Device {
        if selection.wants_gpu() {
            tracing::warn!(
                requested = %selection,
                "ndarray backend has no accelerator support, falling back to cpu"
            );
        }
        burn_ndarray::NdArrayDevice::Cpu
    }

    fn device_label(_device: &Self::Device) -> String {
        "cpu".to_string()
    }
}

#[cfg(feature = "backend-wgpu")]
impl DeviceResolver for burn_wgpu::Wgpu {
    fn resolve_device(selection: DeviceSelection) -> Self::Device {
        use burn_wgpu::WgpuDevice;

        match selection {
            DeviceSelection::Auto => WgpuDevice::DefaultDevice,
            DeviceSelection::Cpu => WgpuDevice::Cpu,
            DeviceSelection::Gpu(index) => WgpuDevice::DiscreteGpu(index),
        }
    }

    fn device_label(device: &Self::Device) -> String {
        use burn_wgpu::WgpuDevice;

        match device {
            WgpuDevice::Cpu => "cpu".to_string(),
            WgpuDevice::DiscreteGpu(index) => format!("gpu:{}", index),
            WgpuDevice::IntegratedGpu(index) => format!("igpu:{}", index),
            WgpuDevice::VirtualGpu(index) => format!("vgpu:{}", index),
            other => format!("{:?}", other).to_ascii_lowercase(),
        }
    }
}

impl<B: DeviceResolver> DeviceResolver for burn_autodiff::Autodiff<B> {
    fn resolve_device(selection: DeviceSelection) -> Self::Device {
        B::resolve_device(selection)
    }

    fn device_label(device: &Self::Device) -> String {
        B::device_label(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selection() {
        assert_eq!("auto".parse::<DeviceSelection>().unwrap(), DeviceSelection::Auto);
        assert_eq!(" CPU ".parse::<DeviceSelection>().unwrap(), DeviceSelection::Cpu);
        assert_eq!("cuda".parse::<DeviceSelection>().unwrap(), DeviceSelection::Gpu(0));
        assert_eq!("gpu:2".parse::<DeviceSelection>().unwrap(), DeviceSelection::Gpu(2));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("tpu".parse::<DeviceSelection>().is_err());
        assert!("gpu:x".parse::<DeviceSelection>().is_err());
        assert!("cpu:1".parse::<DeviceSelection>().is_err());
    }

    #[test]
    fn test_display_roundtrips_through_serde() {
        let json = serde_json::to_string(&DeviceSelection::Gpu(1)).unwrap();
        assert_eq!(json, "\"gpu:1\"");
        let decoded: DeviceSelection = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, DeviceSelection::Gpu(1));
    }

    #[cfg(feature = "backend-ndarray")]
    #[test]
    fn test_ndarray_always_cpu() {
        use crate::backend::NdArray;

        let device = NdArray::resolve_device(DeviceSelection::Gpu(0));
        assert_eq!(NdArray::device_label(&device), "cpu");
    }
}
