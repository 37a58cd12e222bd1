// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device targets for tower replicas
//!
//! A configuration names devices abstractly ([`DeviceTarget`]); each backend
//! device type knows how to turn such a target into a concrete device via
//! [`ResolveDevice`]. Resolution happens once, while the configuration is
//! validated, so replica construction never re-derives device strings.

use std::fmt;

use burn::backend::ndarray::NdArrayDevice;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, Result};

/// Where one tower replica runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTarget {
    /// Accelerator with the given ordinal
    Accelerator(usize),
    /// The default host device
    Host,
}

impl DeviceTarget {
    /// Build a target from an optional accelerator index; `None` is the host
    pub fn from_index(index: Option<usize>) -> Self {
        match index {
            Some(ordinal) => Self::Accelerator(ordinal),
            None => Self::Host,
        }
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accelerator(ordinal) => write!(f, "gpu:{ordinal}"),
            Self::Host => write!(f, "cpu:0"),
        }
    }
}

/// Backend device types that can be created from a [`DeviceTarget`]
pub trait ResolveDevice: Sized {
    /// Resolve `target`, failing if the backend cannot provide it
    fn resolve(target: DeviceTarget) -> Result<Self>;
}

impl ResolveDevice for NdArrayDevice {
    fn resolve(target: DeviceTarget) -> Result<Self> {
        match target {
            DeviceTarget::Host => Ok(NdArrayDevice::Cpu),
            DeviceTarget::Accelerator(_) => Err(NetworkError::DeviceUnavailable { target }),
        }
    }
}

#[cfg(feature = "wgpu")]
impl ResolveDevice for burn::backend::wgpu::WgpuDevice {
    /// Fails unless an adapter of the requested kind is present
    fn resolve(target: DeviceTarget) -> Result<Self> {
        use burn::backend::wgpu::WgpuDevice;

        let (device, kind, ordinal) = match target {
            DeviceTarget::Accelerator(ordinal) => (
                WgpuDevice::DiscreteGpu(ordinal),
                wgpu::DeviceType::DiscreteGpu,
                ordinal,
            ),
            DeviceTarget::Host => (WgpuDevice::Cpu, wgpu::DeviceType::Cpu, 0),
        };
        if ordinal < selectable_adapters(kind) {
            Ok(device)
        } else {
            Err(NetworkError::DeviceUnavailable { target })
        }
    }
}

/// Adapters burn can select for `kind`; untyped adapters serve as fallback
#[cfg(feature = "wgpu")]
fn selectable_adapters(kind: wgpu::DeviceType) -> usize {
    let adapters = wgpu::Instance::default().enumerate_adapters(wgpu::Backends::all());
    let count = |wanted: wgpu::DeviceType| {
        adapters
            .iter()
            .filter(|adapter| adapter.get_info().device_type == wanted)
            .count()
    };
    count(kind).max(count(wgpu::DeviceType::Other))
}

/// Resolve every target in order, failing on the first unavailable device
pub fn resolve_all<D: ResolveDevice>(targets: &[DeviceTarget]) -> Result<Vec<D>> {
    targets.iter().map(|target| D::resolve(*target)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_resolves_to_cpu() {
        let device = NdArrayDevice::resolve(DeviceTarget::Host).unwrap();
        assert_eq!(device, NdArrayDevice::Cpu);
    }

    #[test]
    fn accelerator_is_unavailable_on_ndarray() {
        let err = resolve_all::<NdArrayDevice>(&[DeviceTarget::Host, DeviceTarget::Accelerator(1)])
            .unwrap_err();
        assert!(matches!(
            err,
            NetworkError::DeviceUnavailable {
                target: DeviceTarget::Accelerator(1)
            }
        ));
    }

    #[test]
    fn optional_index_maps_to_target() {
        assert_eq!(DeviceTarget::from_index(None), DeviceTarget::Host);
        assert_eq!(DeviceTarget::from_index(Some(2)), DeviceTarget::Accelerator(2));
        assert_eq!(DeviceTarget::Accelerator(2).to_string(), "gpu:2");
    }

    #[cfg(feature = "wgpu")]
    #[test]
    fn missing_wgpu_adapter_is_unavailable() {
        use burn::backend::wgpu::WgpuDevice;

        let target = DeviceTarget::Accelerator(4096);
        assert!(matches!(
            WgpuDevice::resolve(target),
            Err(NetworkError::DeviceUnavailable { target: t }) if t == target
        ));
    }
}
