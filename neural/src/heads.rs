// SPDX-License-Identifier: MIT OR Apache-2.0

//! Policy and value heads, and the dual-headed network that owns every parameter

use burn::module::Module;
use burn::nn::conv::Conv2d;
use burn::nn::Linear;
use burn::tensor::activation::{relu, softmax, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::blocks::{dense, same_conv};
use crate::config::{NetworkConfig, NormSettings};
use crate::error::Result;
use crate::norm::{Norm, NormStats};
use crate::tower::{ResidualTower, ResidualTowerConfig};
use crate::{BOARD_CELLS, VALUE_HIDDEN};

const POLICY_CHANNELS: usize = 2;
const VALUE_CHANNELS: usize = 1;

/// 1x1 convolution to two planes, normalised, flattened into raw move logits
#[derive(Module, Debug)]
pub struct PolicyHead<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: Norm<B>,
    pub dense: Linear<B>,
}

impl<B: Backend> PolicyHead<B> {
    pub fn new(filters: usize, num_labels: usize, norm: NormSettings, device: &B::Device) -> Self {
        Self {
            conv: same_conv(filters, POLICY_CHANNELS, 1, device),
            norm: Norm::frozen(POLICY_CHANNELS, norm, device),
            dense: dense(POLICY_CHANNELS * BOARD_CELLS, num_labels, device),
        }
    }

    /// Unnormalised logits over the label space
    pub fn forward(&self, features: Tensor<B, 4>, stats: &mut NormStats<B>) -> Tensor<B, 2> {
        let net = relu(self.norm.forward(self.conv.forward(features), stats));
        self.dense.forward(net.flatten(1, 3))
    }
}

/// 1x1 convolution to one plane, then a 256-wide hidden layer and a tanh scalar
#[derive(Module, Debug)]
pub struct ValueHead<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: Norm<B>,
    pub hidden: Linear<B>,
    pub output: Linear<B>,
}

impl<B: Backend> ValueHead<B> {
    pub fn new(filters: usize, norm: NormSettings, device: &B::Device) -> Self {
        Self {
            conv: same_conv(filters, VALUE_CHANNELS, 1, device),
            norm: Norm::frozen(VALUE_CHANNELS, norm, device),
            hidden: dense(VALUE_CHANNELS * BOARD_CELLS, VALUE_HIDDEN, device),
            output: dense(VALUE_HIDDEN, 1, device),
        }
    }

    /// One evaluation per example, shape `[batch, 1]`, in `[-1, 1]`
    pub fn forward(&self, features: Tensor<B, 4>, stats: &mut NormStats<B>) -> Tensor<B, 2> {
        let net = relu(self.norm.forward(self.conv.forward(features), stats));
        let net = relu(self.hidden.forward(net.flatten(1, 3)));
        tanh(self.output.forward(net))
    }
}

/// Raw outputs of one forward pass
#[derive(Debug, Clone)]
pub struct HeadOutputs<B: Backend> {
    pub logits: Tensor<B, 2>,
    pub value: Tensor<B, 2>,
    /// Batch statistics of every normalisation layer; empty without autodiff
    pub norm_stats: NormStats<B>,
}

impl<B: Backend> HeadOutputs<B> {
    /// Move probabilities; every row sums to one
    pub fn probabilities(&self) -> Tensor<B, 2> {
        softmax(self.logits.clone(), 1)
    }
}

/// The full parameter set: tower plus both heads
///
/// Replicas are forks of one `DualNet`, so every replica reads the same
/// parameters; only the optimiser writes them.
#[derive(Module, Debug)]
pub struct DualNet<B: Backend> {
    pub tower: ResidualTower<B>,
    pub policy_head: PolicyHead<B>,
    pub value_head: ValueHead<B>,
}

impl<B: Backend> DualNet<B> {
    pub fn new(config: &NetworkConfig, device: &B::Device) -> Result<Self> {
        Ok(Self {
            tower: ResidualTowerConfig::from_network(config).init(device)?,
            policy_head: PolicyHead::new(config.filters, config.num_labels, config.head_norm, device),
            value_head: ValueHead::new(config.filters, config.head_norm, device),
        })
    }

    /// `boards` is NHWC `[batch, 10, 9, 14]`
    pub fn forward(&self, boards: Tensor<B, 4>) -> HeadOutputs<B> {
        let mut stats = NormStats::new();
        let features = self.tower.forward(boards.permute([0, 3, 1, 2]), &mut stats);
        let logits = self.policy_head.forward(features.clone(), &mut stats);
        let value = self.value_head.forward(features, &mut stats);

        HeadOutputs {
            logits,
            value,
            norm_stats: stats,
        }
    }

    /// Fold the statistics of one forward pass into the running averages
    pub fn commit_norm_stats(&mut self, stats: NormStats<B>) {
        let norms = self
            .tower
            .norms_mut()
            .chain([&mut self.policy_head.norm, &mut self.value_head.norm]);
        stats.commit_to(norms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceTarget;
    use crate::test_utils::{board_batch, TestBackend};
    use burn::module::AutodiffModule;

    fn net(num_labels: usize) -> DualNet<TestBackend> {
        let config = NetworkConfig::new(num_labels, vec![DeviceTarget::Host])
            .with_filters(4)
            .with_res_layers(1);
        DualNet::new(&config, &Default::default()).unwrap()
    }

    #[test]
    fn output_shapes_follow_label_space() {
        let outputs = net(37).forward(board_batch(5, 1));
        assert_eq!(outputs.logits.dims(), [5, 37]);
        assert_eq!(outputs.value.dims(), [5, 1]);
    }

    fn assert_rows_sum_to_one<B: Backend>(probabilities: Tensor<B, 2>) {
        let sums: Vec<f32> = probabilities.sum_dim(1).into_data().to_vec().unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-4, "row sums to {sum}");
        }
    }

    #[test]
    fn probabilities_sum_to_one() {
        let net = net(100);
        assert_rows_sum_to_one(net.forward(board_batch(6, 2)).probabilities());
        assert_rows_sum_to_one(net.valid().forward(board_batch(6, 2).inner()).probabilities());
    }

    #[test]
    fn value_is_bounded() {
        let boards = board_batch(8, 3).mul_scalar(50.0);
        let values: Vec<f32> = net(10).forward(boards).value.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn forward_traces_every_norm_and_commit_updates_them() {
        let mut net = net(10);
        let before: Vec<f32> = net.tower.stem.norm.running_mean.val().into_data().to_vec().unwrap();

        let outputs = net.forward(board_batch(4, 4));
        // stem, one block of two stages, both heads
        assert_eq!(outputs.norm_stats.len(), 1 + 2 + 2);
        assert!(net.valid().forward(board_batch(4, 4).inner()).norm_stats.is_empty());

        let untouched: Vec<f32> = net.tower.stem.norm.running_mean.val().into_data().to_vec().unwrap();
        assert_eq!(untouched, before);

        net.commit_norm_stats(outputs.norm_stats);
        let after: Vec<f32> = net.tower.stem.norm.running_mean.val().into_data().to_vec().unwrap();
        assert_ne!(after, before);
    }
}
