// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors raised while building, restoring or training the network

use std::path::PathBuf;

use thiserror::Error;

use crate::device::DeviceTarget;

/// Errors that can occur while constructing or driving the network
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The device list was empty
    #[error("at least one device target is required")]
    NoDevices,

    /// The global batch cannot be split into equal shards
    #[error("batch size {batch_size} is not divisible by {devices} device(s)")]
    UnevenShards { batch_size: usize, devices: usize },

    /// A size parameter that must be positive was zero
    #[error("{what} must be greater than zero")]
    ZeroSized { what: &'static str },

    /// A requested device is not available on this backend
    #[error("device {target} is not available on this backend")]
    DeviceUnavailable { target: DeviceTarget },

    /// The skip connection of a residual block cannot be added
    #[error("residual block {block}: {filters} filters cannot be added to a {channels}-channel input")]
    ResidualShape {
        block: String,
        channels: usize,
        filters: usize,
    },

    /// A caller-supplied tensor has the wrong shape
    #[error("{tensor} has shape {actual:?}, expected {expected:?}")]
    InputShape {
        tensor: &'static str,
        actual: Vec<usize>,
        expected: Vec<usize>,
    },

    /// The same parameter was registered under two names
    #[error("parameter registered twice: {first} and {second}")]
    DuplicateParameter { first: String, second: String },

    /// A checkpoint could not be restored
    #[error("failed to restore checkpoint {path}: {reason}")]
    CheckpointRestore { path: PathBuf, reason: String },

    /// A checkpoint could not be written
    #[error("failed to save checkpoint {path}: {reason}")]
    CheckpointSave { path: PathBuf, reason: String },

    /// A replica thread panicked before producing its gradients
    #[error("replica {index} failed before reaching the gradient barrier")]
    ReplicaFailed { index: usize },

    /// Reading or writing a file failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A configuration or checkpoint sidecar was not valid JSON
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, NetworkError>;
