// SPDX-License-Identifier: MIT OR Apache-2.0

//! Residual tower: the feature extractor shared by both heads

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::blocks::{elu, ConvNorm, ResidualBlock, ResidualBlockConfig};
use crate::config::{NetworkConfig, NormSettings, StemMode};
use crate::error::Result;
use crate::norm::{Norm, NormStats};
use crate::BOARD_CHANNELS;

/// Configuration for a [`ResidualTower`]
#[derive(Debug, Clone)]
pub struct ResidualTowerConfig {
    pub input_channels: usize,
    pub filters: usize,
    pub res_layers: usize,
    pub mode: StemMode,
    pub norm: NormSettings,
}

impl ResidualTowerConfig {
    pub fn from_network(config: &NetworkConfig) -> Self {
        Self {
            input_channels: BOARD_CHANNELS,
            filters: config.filters,
            res_layers: config.res_layers,
            mode: config.mode,
            norm: config.tower_norm,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ResidualTower<B>> {
        let stem = ConvNorm::new(
            self.input_channels,
            self.filters,
            self.mode.kernel_size(),
            self.norm,
            device,
        );
        let blocks = (0..self.res_layers)
            .map(|i| {
                ResidualBlockConfig::new(
                    format!("selectnet_layer_{}", i + 1),
                    self.filters,
                    self.filters,
                    self.norm,
                )
                .init(device)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ResidualTower { stem, blocks })
    }
}

/// Stem convolution followed by a chain of residual blocks
#[derive(Module, Debug)]
pub struct ResidualTower<B: Backend> {
    pub stem: ConvNorm<B>,
    pub blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> ResidualTower<B> {
    /// `input` is NCHW; the output keeps the spatial size with `filters` channels
    pub fn forward(&self, input: Tensor<B, 4>, stats: &mut NormStats<B>) -> Tensor<B, 4> {
        let stem = elu(self.stem.forward(input, stats));
        self.blocks
            .iter()
            .fold(stem, |net, block| block.forward(net, stats))
    }

    /// Every normalisation layer, in forward order
    pub fn norms_mut(&mut self) -> impl Iterator<Item = &mut Norm<B>> {
        std::iter::once(&mut self.stem.norm).chain(
            self.blocks
                .iter_mut()
                .flat_map(|block| block.stages.iter_mut().map(|stage| &mut stage.norm)),
        )
    }

    /// Side length of the stem kernel
    pub fn stem_kernel_size(&self) -> usize {
        self.stem.conv.weight.val().dims()[3]
    }
}
