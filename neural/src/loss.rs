// SPDX-License-Identifier: MIT OR Apache-2.0

//! Losses and the move-accuracy metric

use burn::nn::loss::{MseLoss, Reduction};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};

use crate::heads::{DualNet, HeadOutputs};
use crate::params::{l2_penalty, Objective};

/// Mean softmax cross-entropy between (soft) move labels and raw logits
pub fn policy_loss<B: Backend>(logits: Tensor<B, 2>, moves: Tensor<B, 2>) -> Tensor<B, 1> {
    log_softmax(logits, 1).mul(moves).sum_dim(1).neg().mean()
}

/// Mean squared error between outcome scores and value predictions
pub fn value_loss<B: Backend>(value: Tensor<B, 2>, scores: Tensor<B, 2>) -> Tensor<B, 1> {
    MseLoss::new().forward(value, scores, Reduction::Mean)
}

/// Fraction of rows whose most likely move is the labelled move
pub fn accuracy<B: Backend>(probabilities: Tensor<B, 2>, moves: Tensor<B, 2>) -> Tensor<B, 1> {
    probabilities
        .argmax(1)
        .equal(moves.argmax(1))
        .float()
        .mean()
}

/// Loss tensors of one replica, still attached to the autodiff graph
#[derive(Debug, Clone)]
pub struct ReplicaLosses<B: Backend> {
    pub policy: Tensor<B, 1>,
    pub value: Tensor<B, 1>,
    pub combined: Tensor<B, 1>,
    pub accuracy: Tensor<B, 1>,
}

impl<B: Backend> ReplicaLosses<B> {
    /// Assemble every loss of a replica from its forward outputs
    pub fn assemble(
        net: &DualNet<B>,
        outputs: &HeadOutputs<B>,
        moves: Tensor<B, 2>,
        scores: Tensor<B, 2>,
        l2_scale: f32,
        device: &B::Device,
    ) -> Self {
        let policy = policy_loss(outputs.logits.clone(), moves.clone());
        let value = value_loss(outputs.value.clone(), scores);
        let combined = value
            .clone()
            .add(policy.clone())
            .add(l2_penalty(net, l2_scale, device));
        let accuracy = accuracy(outputs.probabilities(), moves);

        Self {
            policy,
            value,
            combined,
            accuracy,
        }
    }

    /// Loss minimised by `objective`
    pub fn target(&self, objective: Objective) -> Tensor<B, 1> {
        match objective {
            Objective::Policy => self.policy.clone(),
            Objective::Value => self.value.clone(),
            Objective::Combined => self.combined.clone(),
        }
    }

    pub fn metrics(&self) -> LossMetrics {
        LossMetrics {
            policy_loss: self.policy.clone().into_scalar().elem(),
            value_loss: self.value.clone().into_scalar().elem(),
            combined_loss: self.combined.clone().into_scalar().elem(),
            accuracy: self.accuracy.clone().into_scalar().elem(),
        }
    }
}

/// Scalar metrics reported for a step
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossMetrics {
    pub policy_loss: f32,
    pub value_loss: f32,
    pub combined_loss: f32,
    pub accuracy: f32,
}

impl LossMetrics {
    /// Unweighted mean across replicas; shards are equal-sized by construction
    pub fn mean(replicas: &[LossMetrics]) -> LossMetrics {
        if replicas.is_empty() {
            return LossMetrics::default();
        }
        let n = replicas.len() as f32;
        let sum = replicas.iter().fold(LossMetrics::default(), |acc, m| LossMetrics {
            policy_loss: acc.policy_loss + m.policy_loss,
            value_loss: acc.value_loss + m.value_loss,
            combined_loss: acc.combined_loss + m.combined_loss,
            accuracy: acc.accuracy + m.accuracy,
        });

        LossMetrics {
            policy_loss: sum.policy_loss / n,
            value_loss: sum.value_loss / n,
            combined_loss: sum.combined_loss / n,
            accuracy: sum.accuracy / n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestBackend;

    type B = TestBackend;

    fn scalar(tensor: Tensor<B, 1>) -> f32 {
        tensor.into_scalar().elem()
    }

    #[test]
    fn cross_entropy_matches_hand_computation() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_floats([[0.0, 0.0], [2.0, 0.0]], &device);
        let moves = Tensor::<B, 2>::from_floats([[1.0, 0.0], [0.0, 1.0]], &device);

        let first = 2.0f32.ln();
        let second = (1.0 + 2.0f32.exp()).ln();
        let expected = (first + second) / 2.0;

        assert!((scalar(policy_loss(logits, moves)) - expected).abs() < 1e-5);
    }

    #[test]
    fn mse_is_mean_of_squares() {
        let device = Default::default();
        let value = Tensor::<B, 2>::from_floats([[0.5], [-1.0]], &device);
        let scores = Tensor::<B, 2>::from_floats([[1.0], [1.0]], &device);

        assert!((scalar(value_loss(value, scores)) - (0.25 + 4.0) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn accuracy_compares_argmax() {
        let device = Default::default();
        let probabilities =
            Tensor::<B, 2>::from_floats([[0.7, 0.2, 0.1], [0.1, 0.1, 0.8], [0.3, 0.4, 0.3]], &device);
        let moves = Tensor::<B, 2>::from_floats([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 1.0, 0.0]], &device);

        assert!((scalar(accuracy(probabilities, moves)) - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn metrics_mean_is_unweighted() {
        let a = LossMetrics {
            policy_loss: 1.0,
            value_loss: 0.5,
            combined_loss: 1.5,
            accuracy: 0.0,
        };
        let b = LossMetrics {
            policy_loss: 3.0,
            value_loss: 1.5,
            combined_loss: 4.5,
            accuracy: 1.0,
        };

        let mean = LossMetrics::mean(&[a, b]);
        assert_eq!(mean.policy_loss, 2.0);
        assert_eq!(mean.value_loss, 1.0);
        assert_eq!(mean.combined_loss, 3.0);
        assert_eq!(mean.accuracy, 0.5);
    }
}
