// SPDX-License-Identifier: MIT OR Apache-2.0

//! Convolutional building blocks shared by the tower and the heads

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Initializer, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::config::NormSettings;
use crate::error::{NetworkError, Result};
use crate::norm::{Norm, NormStats};
use crate::BOARD_CELLS;

/// Exponential linear unit: `x` for positive inputs, `exp(x) - 1` otherwise
pub fn elu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let negative = x.clone().clamp_max(0.0).exp().sub_scalar(1.0);
    x.clamp_min(0.0).add(negative)
}

pub(crate) fn glorot() -> Initializer {
    Initializer::XavierUniform { gain: 1.0 }
}

/// Same-padded convolution without a baked-in activation
pub(crate) fn same_conv<B: Backend>(
    channels: usize,
    filters: usize,
    kernel_size: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([channels, filters], [kernel_size, kernel_size])
        .with_padding(PaddingConfig2d::Same)
        .with_initializer(glorot())
        .init(device)
}

pub(crate) fn dense<B: Backend>(inputs: usize, outputs: usize, device: &B::Device) -> Linear<B> {
    LinearConfig::new(inputs, outputs)
        .with_initializer(glorot())
        .init(device)
}

/// Convolution followed by batch normalisation
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: Norm<B>,
}

impl<B: Backend> ConvNorm<B> {
    pub fn new(
        channels: usize,
        filters: usize,
        kernel_size: usize,
        settings: NormSettings,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: same_conv(channels, filters, kernel_size, device),
            norm: Norm::new(filters, settings, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>, stats: &mut NormStats<B>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(input), stats)
    }
}

/// Configuration for a [`ResidualBlock`]
#[derive(Debug, Clone)]
pub struct ResidualBlockConfig {
    /// Used in shape diagnostics
    pub name: String,
    /// Channels of the block input
    pub channels: usize,
    /// Filters of every inner convolution
    pub filters: usize,
    /// Number of conv/norm stages
    pub block_num: usize,
    pub kernel_size: usize,
    pub norm: NormSettings,
}

impl ResidualBlockConfig {
    pub fn new(name: impl Into<String>, channels: usize, filters: usize, norm: NormSettings) -> Self {
        Self {
            name: name.into(),
            channels,
            filters,
            block_num: 2,
            kernel_size: 3,
            norm,
        }
    }

    pub fn with_block_num(mut self, block_num: usize) -> Self {
        self.block_num = block_num;
        self
    }

    pub fn with_kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    /// Build the block; the skip connection requires `filters == channels`
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ResidualBlock<B>> {
        if self.block_num > 0 && self.filters != self.channels {
            return Err(NetworkError::ResidualShape {
                block: self.name.clone(),
                channels: self.channels,
                filters: self.filters,
            });
        }

        let stages = (0..self.block_num)
            .map(|i| {
                let channels = if i == 0 { self.channels } else { self.filters };
                ConvNorm::new(channels, self.filters, self.kernel_size, self.norm, device)
            })
            .collect();

        Ok(ResidualBlock { stages })
    }
}

/// Stacked conv/norm/ELU stages with the input added back before the last ELU
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub stages: Vec<ConvNorm<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>, stats: &mut NormStats<B>) -> Tensor<B, 4> {
        let last = self.stages.len().saturating_sub(1);
        let mut net = input.clone();

        for (i, stage) in self.stages.iter().enumerate() {
            net = stage.forward(net, stats);
            if i == last {
                net = net.add(input.clone());
            }
            net = elu(net);
        }

        net
    }
}

/// Configuration for a [`ReadoutBlock`]
#[derive(Debug, Clone)]
pub struct ReadoutBlockConfig {
    pub channels: usize,
    pub filters: usize,
    pub block_num: usize,
    pub kernel_size: usize,
    /// Width of the dense projection
    pub outputs: usize,
    pub norm: NormSettings,
}

impl ReadoutBlockConfig {
    pub fn new(channels: usize, norm: NormSettings) -> Self {
        Self {
            channels,
            filters: 2,
            block_num: 1,
            kernel_size: 1,
            outputs: BOARD_CELLS,
            norm,
        }
    }

    pub fn with_filters(mut self, filters: usize) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_block_num(mut self, block_num: usize) -> Self {
        self.block_num = block_num;
        self
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ReadoutBlock<B> {
        let stages: Vec<ConvNorm<B>> = (0..self.block_num)
            .map(|i| {
                let channels = if i == 0 { self.channels } else { self.filters };
                ConvNorm::new(channels, self.filters, self.kernel_size, self.norm, device)
            })
            .collect();
        let flat_channels = if stages.is_empty() {
            self.channels
        } else {
            self.filters
        };

        ReadoutBlock {
            stages,
            dense: dense(flat_channels * BOARD_CELLS, self.outputs, device),
        }
    }
}

/// Conv/norm/ELU stages flattened into a dense ELU projection over the board
#[derive(Module, Debug)]
pub struct ReadoutBlock<B: Backend> {
    pub stages: Vec<ConvNorm<B>>,
    pub dense: Linear<B>,
}

impl<B: Backend> ReadoutBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>, stats: &mut NormStats<B>) -> Tensor<B, 2> {
        let mut net = input;
        for stage in &self.stages {
            net = elu(stage.forward(net, stats));
        }
        let flat: Tensor<B, 2> = net.flatten(1, 3);
        elu(self.dense.forward(flat))
    }
}
