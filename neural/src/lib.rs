// SPDX-License-Identifier: MIT OR Apache-2.0

//! Xiangqi move-selection network
//!
//! A residual convolutional tower over `10 x 9 x 14` board encodings feeds
//! two heads: a policy head producing a distribution over move labels and a
//! value head producing a scalar in `[-1, 1]`. Training is data-parallel:
//! the global batch is split into equal shards, each replica computes its
//! gradients independently and the averaged gradients update the single
//! shared parameter set.
//!
//! - [`construct`] builds a session from a [`NetworkConfig`]
//! - [`NetworkSession::predict`] runs the forward pass
//! - [`Trainer::step`] applies one update for an [`Objective`]

#![deny(unsafe_code)]

pub mod blocks;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod error;
pub mod gradients;
pub mod heads;
pub mod loss;
pub mod norm;
pub mod params;
pub mod session;
pub mod summary;
pub mod tower;
pub mod trainer;

pub use config::{Disclosure, NetworkConfig, NormSettings, StemMode};
pub use device::DeviceTarget;
pub use error::{NetworkError, Result};
pub use heads::{DualNet, HeadOutputs};
pub use loss::LossMetrics;
pub use norm::{Norm, NormStats};
pub use params::{Objective, ParamGroup, ParameterRegistry};
pub use session::{construct, Exposed, Mode, NetworkSession, Prediction, TrainingBatch};
pub use summary::{MergedSummary, ScalarSummary};
pub use trainer::{StepReport, Trainer};

/// Board rows
pub const BOARD_HEIGHT: usize = 10;
/// Board columns
pub const BOARD_WIDTH: usize = 9;
/// Feature planes per square
pub const BOARD_CHANNELS: usize = 14;
/// Squares on the board
pub const BOARD_CELLS: usize = BOARD_HEIGHT * BOARD_WIDTH;
/// Width of the value head's hidden layer
pub const VALUE_HIDDEN: usize = 256;

#[cfg(test)]
pub(crate) mod test_utils {
    use burn::tensor::{Tensor, TensorData};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::config::NormSettings;
    use crate::{BOARD_CHANNELS, BOARD_HEIGHT, BOARD_WIDTH};

    pub type TestBackend = burn::backend::Autodiff<burn::backend::NdArray>;

    pub fn tower_norm() -> NormSettings {
        NormSettings {
            epsilon: 1e-3,
            momentum: 0.01,
        }
    }

    /// Random NHWC board batch, reproducible per `seed`
    pub fn board_batch(rows: usize, seed: u64) -> Tensor<TestBackend, 4> {
        let mut rng = StdRng::seed_from_u64(seed);
        let values: Vec<f32> = (0..rows * BOARD_HEIGHT * BOARD_WIDTH * BOARD_CHANNELS)
            .map(|_| rng.gen_range(0.0..1.0))
            .collect();

        Tensor::from_data(
            TensorData::new(values, [rows, BOARD_HEIGHT, BOARD_WIDTH, BOARD_CHANNELS]),
            &Default::default(),
        )
    }
}
