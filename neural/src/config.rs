// SPDX-License-Identifier: MIT OR Apache-2.0

//! Network construction configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::DeviceTarget;
use crate::error::{NetworkError, Result};

/// Kernel size of the stem convolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StemMode {
    /// 3x3 stem
    #[default]
    Normal,
    /// 5x5 stem
    Wide,
}

impl StemMode {
    /// Side length of the stem kernel
    pub fn kernel_size(&self) -> usize {
        match self {
            StemMode::Normal => 3,
            StemMode::Wide => 5,
        }
    }
}

impl From<&str> for StemMode {
    /// `"Normal"` selects the 3x3 stem, any other mode string the 5x5 one
    fn from(mode: &str) -> Self {
        if mode == "Normal" {
            StemMode::Normal
        } else {
            StemMode::Wide
        }
    }
}

/// How much of the training apparatus is handed back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Disclosure {
    /// Forward pass only
    Minimal,
    /// Forward pass plus trainer
    Extra,
    /// Trainer plus merged summaries
    ExtraV2,
}

/// Batch normalisation settings for one family of layers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormSettings {
    pub epsilon: f64,
    /// Weight given to the current batch when updating running statistics
    pub momentum: f64,
}

/// Configuration for building a [`crate::NetworkSession`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Checkpoint to restore; `None` initialises every parameter fresh
    pub checkpoint: Option<PathBuf>,

    /// Size of the move label space
    pub num_labels: usize,

    /// One tower replica per entry, in shard order
    pub devices: Vec<DeviceTarget>,

    /// Global batch size, split evenly across `devices`
    pub batch_size: usize,

    /// Number of residual blocks after the stem
    pub res_layers: usize,

    /// Filters in the stem and every residual block
    pub filters: usize,

    /// Expose the trainer
    pub extra: bool,

    /// Expose the trainer and merged summaries
    pub extrav2: bool,

    /// Stem kernel selection
    pub mode: StemMode,

    /// L2 regularisation coefficient
    pub l2_scale: f32,

    /// Momentum of the three SGD optimisers
    pub momentum: f64,

    /// Normalisation used in the stem and residual blocks
    pub tower_norm: NormSettings,

    /// Normalisation used in the policy and value heads
    pub head_norm: NormSettings,
}

/// First accelerator when built for wgpu, the host otherwise
fn default_device() -> DeviceTarget {
    if cfg!(feature = "wgpu") {
        DeviceTarget::Accelerator(0)
    } else {
        DeviceTarget::Host
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            checkpoint: None,
            num_labels: 2086,
            devices: vec![default_device()],
            batch_size: 512,
            res_layers: 4,
            filters: 256,
            extra: false,
            extrav2: false,
            mode: StemMode::Normal,
            l2_scale: 1e-5,
            momentum: 0.9,
            tower_norm: NormSettings {
                epsilon: 1e-3,
                momentum: 0.01,
            },
            head_norm: NormSettings {
                epsilon: 1e-5,
                momentum: 0.001,
            },
        }
    }
}

impl NetworkConfig {
    /// Create a configuration with the given label space and devices
    pub fn new(num_labels: usize, devices: Vec<DeviceTarget>) -> Self {
        Self {
            num_labels,
            devices,
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    pub fn with_checkpoint(mut self, checkpoint: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(checkpoint.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_res_layers(mut self, res_layers: usize) -> Self {
        self.res_layers = res_layers;
        self
    }

    pub fn with_filters(mut self, filters: usize) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_mode(mut self, mode: impl Into<StemMode>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn with_disclosure(mut self, disclosure: Disclosure) -> Self {
        self.extra = disclosure >= Disclosure::Extra;
        self.extrav2 = disclosure == Disclosure::ExtraV2;
        self
    }

    /// Disclosure level selected by the two flags; `extrav2` wins over `extra`
    pub fn disclosure(&self) -> Disclosure {
        if self.extrav2 {
            Disclosure::ExtraV2
        } else if self.extra {
            Disclosure::Extra
        } else {
            Disclosure::Minimal
        }
    }

    /// Rows of the global batch handled by each replica
    pub fn shard_size(&self) -> usize {
        self.batch_size / self.devices.len().max(1)
    }

    /// Check the sizes and the batch/device split before anything is built
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(NetworkError::NoDevices);
        }
        for (what, value) in [
            ("batch_size", self.batch_size),
            ("num_labels", self.num_labels),
            ("filters", self.filters),
        ] {
            if value == 0 {
                return Err(NetworkError::ZeroSized { what });
            }
        }
        if self.batch_size % self.devices.len() != 0 {
            return Err(NetworkError::UnevenShards {
                batch_size: self.batch_size,
                devices: self.devices.len(),
            });
        }
        Ok(())
    }
}
