// SPDX-License-Identifier: MIT OR Apache-2.0

//! Construction entry point and the caller-owned network session
//!
//! [`construct`] is the only way to build a network. Each call resolves its
//! own devices and creates its own parameter set, so two sessions never share
//! state; there is no ambient default graph to reset.

use std::ops::Range;
use std::path::Path;

use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use tracing::info;

use crate::checkpoint::{self, CheckpointMeta};
use crate::config::{Disclosure, NetworkConfig};
use crate::device::{resolve_all, ResolveDevice};
use crate::error::{NetworkError, Result};
use crate::heads::DualNet;
use crate::params::ParameterRegistry;
use crate::trainer::{fan_out, Trainer};
use crate::{BOARD_CHANNELS, BOARD_HEIGHT, BOARD_WIDTH};

/// Normalisation mode of a forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Batch statistics; running statistics are left untouched
    Train,
    /// Running statistics; nothing is updated
    Infer,
}

/// Full-batch outputs of a forward pass
#[derive(Debug, Clone)]
pub struct Prediction<B: Backend> {
    /// `[batch, num_labels]`, rows sum to one
    pub probabilities: Tensor<B, 2>,
    /// `[batch, 1]`, in `[-1, 1]`
    pub values: Tensor<B, 2>,
}

/// One global training batch as supplied by the data pipeline
#[derive(Debug, Clone)]
pub struct TrainingBatch<B: Backend> {
    /// NHWC `[batch, 10, 9, 14]`
    pub boards: Tensor<B, 4>,
    /// `[batch, num_labels]` one-hot or soft move labels
    pub moves: Tensor<B, 2>,
    /// `[batch, 1]` outcome scores
    pub scores: Tensor<B, 2>,
}

impl<B: Backend> TrainingBatch<B> {
    pub fn new(boards: Tensor<B, 4>, moves: Tensor<B, 2>, scores: Tensor<B, 2>) -> Self {
        Self {
            boards,
            moves,
            scores,
        }
    }

    /// Build a batch from flat row-major buffers; the row count comes from `scores`
    pub fn from_vecs(
        boards: Vec<f32>,
        moves: Vec<f32>,
        scores: Vec<f32>,
        num_labels: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let rows = scores.len();
        let cells = BOARD_HEIGHT * BOARD_WIDTH * BOARD_CHANNELS;
        if boards.len() != rows * cells {
            return Err(NetworkError::InputShape {
                tensor: "boards",
                actual: vec![boards.len()],
                expected: vec![rows * cells],
            });
        }
        if moves.len() != rows * num_labels {
            return Err(NetworkError::InputShape {
                tensor: "moves",
                actual: vec![moves.len()],
                expected: vec![rows * num_labels],
            });
        }

        Ok(Self {
            boards: Tensor::from_data(
                TensorData::new(boards, [rows, BOARD_HEIGHT, BOARD_WIDTH, BOARD_CHANNELS]),
                device,
            ),
            moves: Tensor::from_data(TensorData::new(moves, [rows, num_labels]), device),
            scores: Tensor::from_data(TensorData::new(scores, [rows, 1]), device),
        })
    }

    pub fn rows(&self) -> usize {
        self.boards.dims()[0]
    }

    /// The batch must be exactly `batch_size` rows with `num_labels` labels
    pub fn validate(&self, batch_size: usize, num_labels: usize) -> Result<()> {
        check_dims(
            "boards",
            self.boards.dims(),
            [batch_size, BOARD_HEIGHT, BOARD_WIDTH, BOARD_CHANNELS],
        )?;
        check_dims("moves", self.moves.dims(), [batch_size, num_labels])?;
        check_dims("scores", self.scores.dims(), [batch_size, 1])
    }

    /// Contiguous slice of rows moved to `device`
    pub(crate) fn shard(&self, rows: Range<usize>, device: &B::Device) -> Self {
        let len = rows.end - rows.start;
        Self {
            boards: self.boards.clone().narrow(0, rows.start, len).to_device(device),
            moves: self.moves.clone().narrow(0, rows.start, len).to_device(device),
            scores: self.scores.clone().narrow(0, rows.start, len).to_device(device),
        }
    }
}

pub(crate) fn check_dims<const D: usize>(
    tensor: &'static str,
    actual: [usize; D],
    expected: [usize; D],
) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(NetworkError::InputShape {
            tensor,
            actual: actual.to_vec(),
            expected: expected.to_vec(),
        })
    }
}

/// What [`construct`] exposes beyond the forward pass
pub enum Exposed<B: AutodiffBackend> {
    /// Inference only
    Minimal,
    /// Trainer with the three optimisation targets
    Extra(Trainer<B>),
    /// Trainer that also records merged summaries
    ExtraV2(Trainer<B>),
}

impl<B: AutodiffBackend> Exposed<B> {
    pub fn disclosure(&self) -> Disclosure {
        match self {
            Exposed::Minimal => Disclosure::Minimal,
            Exposed::Extra(_) => Disclosure::Extra,
            Exposed::ExtraV2(_) => Disclosure::ExtraV2,
        }
    }

    pub fn into_trainer(self) -> Option<Trainer<B>> {
        match self {
            Exposed::Minimal => None,
            Exposed::Extra(trainer) | Exposed::ExtraV2(trainer) => Some(trainer),
        }
    }
}

/// Caller-owned network: resolved devices, parameter set and registry
pub struct NetworkSession<B: AutodiffBackend> {
    config: NetworkConfig,
    devices: Vec<B::Device>,
    pub(crate) net: DualNet<B>,
    registry: ParameterRegistry,
}

/// Build a network session from `config`
///
/// With a checkpoint the parameters are restored from it and a failure is
/// fatal; without one every parameter is freshly initialised.
pub fn construct<B>(config: NetworkConfig) -> Result<(NetworkSession<B>, Exposed<B>)>
where
    B: AutodiffBackend,
    B::Device: ResolveDevice,
{
    config.validate()?;
    let devices = resolve_all::<B::Device>(&config.devices)?;
    let primary = &devices[0];

    let net = DualNet::new(&config, primary)?;
    let (net, global_step) = match &config.checkpoint {
        Some(path) => {
            let (net, meta) = checkpoint::restore(path, net, &config, primary)?;
            (net, meta.global_step)
        }
        None => (net, 0),
    };
    let registry = ParameterRegistry::scan(&net)?;

    info!(
        "Built network: {} replica(s) of {} rows, {} residual layers x {} filters, {} labels, {} trainable scalars, {:?}, {}",
        devices.len(),
        config.shard_size(),
        config.res_layers,
        config.filters,
        config.num_labels,
        registry.num_scalars(),
        config.disclosure(),
        if config.checkpoint.is_some() { "restored" } else { "initialised" },
    );

    let exposed = match config.disclosure() {
        Disclosure::Minimal => Exposed::Minimal,
        Disclosure::Extra => Exposed::Extra(Trainer::new(&config, global_step, false)),
        Disclosure::ExtraV2 => Exposed::ExtraV2(Trainer::new(&config, global_step, true)),
    };
    let session = NetworkSession {
        config,
        devices,
        net,
        registry,
    };

    Ok((session, exposed))
}

impl<B: AutodiffBackend> NetworkSession<B> {
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn devices(&self) -> &[B::Device] {
        &self.devices
    }

    /// Device holding the parameter set and the averaged gradients
    pub fn primary_device(&self) -> &B::Device {
        &self.devices[0]
    }

    pub fn net(&self) -> &DualNet<B> {
        &self.net
    }

    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    /// Row ranges of each replica for a batch of `rows`
    pub(crate) fn shard_ranges(&self, rows: usize) -> Result<Vec<Range<usize>>> {
        let replicas = self.devices.len();
        if rows == 0 || rows % replicas != 0 {
            return Err(NetworkError::UnevenShards {
                batch_size: rows,
                devices: replicas,
            });
        }
        let shard = rows / replicas;
        Ok((0..replicas).map(|i| i * shard..(i + 1) * shard).collect())
    }

    /// Forward pass over `boards` (NHWC), split across every replica
    ///
    /// The row count must be divisible by the number of devices.
    pub fn predict(&self, boards: Tensor<B, 4>, mode: Mode) -> Result<Prediction<B::InnerBackend>> {
        let [rows, height, width, channels] = boards.dims();
        check_dims(
            "boards",
            [height, width, channels],
            [BOARD_HEIGHT, BOARD_WIDTH, BOARD_CHANNELS],
        )?;

        let shards = self
            .shard_ranges(rows)?
            .into_iter()
            .zip(&self.devices)
            .map(|(range, device)| {
                let len = range.end - range.start;
                boards.clone().narrow(0, range.start, len).to_device(device)
            })
            .collect();

        let outputs = fan_out(&self.net, &self.devices, shards, |_, replica, _, shard| match mode {
            Mode::Train => {
                let outputs = replica.forward(shard);
                (outputs.probabilities().inner(), outputs.value.inner())
            }
            Mode::Infer => {
                let outputs = replica.valid().forward(shard.inner());
                (outputs.probabilities(), outputs.value)
            }
        })?;

        let primary = self.primary_device();
        let (probabilities, values): (Vec<_>, Vec<_>) = outputs
            .into_iter()
            .map(|(p, v)| (p.to_device(primary), v.to_device(primary)))
            .unzip();

        Ok(Prediction {
            probabilities: Tensor::cat(probabilities, 0),
            values: Tensor::cat(values, 0),
        })
    }

    /// Save the parameter set with `global_step` recorded in the sidecar
    pub fn save(&self, path: impl AsRef<Path>, global_step: u64) -> Result<()> {
        checkpoint::save(
            path.as_ref(),
            &self.net,
            &CheckpointMeta::new(&self.config, global_step),
        )
    }
}
