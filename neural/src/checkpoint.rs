// SPDX-License-Identifier: MIT OR Apache-2.0

//! Saving and restoring the parameter set
//!
//! Parameters go through burn's named MessagePack recorder; a JSON sidecar
//! next to it records the global step and the architecture it was trained
//! with, so an incompatible checkpoint is rejected before any tensor is read.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{NetworkConfig, StemMode};
use crate::error::{NetworkError, Result};
use crate::heads::DualNet;

/// Sidecar stored next to every checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub global_step: u64,
    pub num_labels: usize,
    pub filters: usize,
    pub res_layers: usize,
    pub mode: StemMode,
}

impl CheckpointMeta {
    pub fn new(config: &NetworkConfig, global_step: u64) -> Self {
        Self {
            global_step,
            num_labels: config.num_labels,
            filters: config.filters,
            res_layers: config.res_layers,
            mode: config.mode,
        }
    }

    /// Describe the first architecture difference from `config`, if any
    pub fn mismatch(&self, config: &NetworkConfig) -> Option<String> {
        let expected = Self::new(config, self.global_step);
        if self.num_labels != expected.num_labels {
            Some(format!("{} labels, configured {}", self.num_labels, expected.num_labels))
        } else if self.filters != expected.filters {
            Some(format!("{} filters, configured {}", self.filters, expected.filters))
        } else if self.res_layers != expected.res_layers {
            Some(format!("{} residual layers, configured {}", self.res_layers, expected.res_layers))
        } else if self.mode != expected.mode {
            Some(format!("stem mode {:?}, configured {:?}", self.mode, expected.mode))
        } else {
            None
        }
    }
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Path of the JSON sidecar for the checkpoint at `path`
pub fn meta_path(path: &Path) -> PathBuf {
    let mut file: OsString = path.as_os_str().to_owned();
    file.push(".meta.json");
    PathBuf::from(file)
}

/// Write the parameters and sidecar for `net`
pub fn save<B: Backend>(path: &Path, net: &DualNet<B>, meta: &CheckpointMeta) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    net.clone()
        .save_file(path.to_path_buf(), &recorder())
        .map_err(|e| NetworkError::CheckpointSave {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    std::fs::write(meta_path(path), serde_json::to_vec_pretty(meta)?)?;

    info!("Saved checkpoint {} at step {}", path.display(), meta.global_step);
    Ok(())
}

/// Load parameters into `net`; never falls back to `net`'s fresh values
pub fn restore<B: Backend>(
    path: &Path,
    net: DualNet<B>,
    config: &NetworkConfig,
    device: &B::Device,
) -> Result<(DualNet<B>, CheckpointMeta)> {
    let fail = |reason: String| NetworkError::CheckpointRestore {
        path: path.to_path_buf(),
        reason,
    };

    let raw = std::fs::read(meta_path(path)).map_err(|e| fail(format!("reading metadata: {e}")))?;
    let meta: CheckpointMeta =
        serde_json::from_slice(&raw).map_err(|e| fail(format!("parsing metadata: {e}")))?;
    if let Some(mismatch) = meta.mismatch(config) {
        return Err(fail(format!("incompatible architecture: {mismatch}")));
    }

    let net = net
        .load_file(path.to_path_buf(), &recorder(), device)
        .map_err(|e| fail(e.to_string()))?;

    info!("Restored checkpoint {} at step {}", path.display(), meta.global_step);
    Ok((net, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceTarget;

    fn config() -> NetworkConfig {
        NetworkConfig::new(20, vec![DeviceTarget::Host])
            .with_filters(4)
            .with_res_layers(1)
    }

    #[test]
    fn sidecar_sits_next_to_checkpoint() {
        assert_eq!(
            meta_path(Path::new("runs/model-00042")),
            PathBuf::from("runs/model-00042.meta.json")
        );
    }

    #[test]
    fn mismatched_architecture_is_described() {
        let meta = CheckpointMeta::new(&config(), 3);
        assert_eq!(meta.mismatch(&config()), None);
        assert!(meta.mismatch(&config().with_filters(8)).unwrap().contains("filters"));
        assert!(meta.mismatch(&config().with_mode("wide")).unwrap().contains("stem mode"));
    }
}
