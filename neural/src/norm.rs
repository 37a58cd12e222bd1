// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batch normalisation with explicitly committed running statistics
//!
//! A forward pass on an autodiff backend normalises with the statistics of
//! the batch and appends them to a [`NormStats`] trace; it never writes the
//! layer. Running statistics change only through [`Norm::commit`], which the
//! trainer calls once per replica after the gradient barrier. Without
//! autodiff the running statistics are used as-is.

use burn::module::{Module, Param, ParamId};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

use crate::config::NormSettings;

/// Per-channel normalisation over `[batch, channels, height, width]`
#[derive(Module, Debug)]
pub struct Norm<B: Backend> {
    /// Learned scale
    pub gamma: Param<Tensor<B, 1>>,
    /// Learned center
    pub beta: Param<Tensor<B, 1>>,
    /// Never trained; updated by [`Norm::commit`]
    pub running_mean: Param<Tensor<B, 1>>,
    /// Never trained; updated by [`Norm::commit`]
    pub running_var: Param<Tensor<B, 1>>,
    /// Weight of the new batch in the running average
    pub momentum: f64,
    pub epsilon: f64,
}

fn statistic<B: Backend>(value: Tensor<B, 1>) -> Param<Tensor<B, 1>> {
    Param::initialized(ParamId::new(), value)
}

impl<B: Backend> Norm<B> {
    pub fn new(features: usize, settings: NormSettings, device: &B::Device) -> Self {
        Self {
            gamma: Param::from_tensor(Tensor::ones([features], device)),
            beta: Param::from_tensor(Tensor::zeros([features], device)),
            running_mean: statistic(Tensor::zeros([features], device)),
            running_var: statistic(Tensor::ones([features], device)),
            momentum: settings.momentum,
            epsilon: settings.epsilon,
        }
    }

    /// Normalisation without learned scale or center
    pub fn frozen(features: usize, settings: NormSettings, device: &B::Device) -> Self {
        let mut norm = Self::new(features, settings, device);
        norm.gamma = norm.gamma.set_require_grad(false);
        norm.beta = norm.beta.set_require_grad(false);
        norm
    }

    pub fn forward(&self, input: Tensor<B, 4>, stats: &mut NormStats<B>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = input.dims();
        let shape = [1, channels, 1, 1];

        let (mean, var) = if B::ad_enabled() {
            let (var, mean) = input
                .clone()
                .swap_dims(0, 1)
                .reshape([channels, batch * height * width])
                .var_mean_bias(1);
            let (mean, var) = (mean.reshape([channels]), var.reshape([channels]));
            stats.push(mean.clone().detach(), var.clone().detach());
            (mean, var)
        } else {
            let device = input.device();
            (
                self.running_mean.val().to_device(&device),
                self.running_var.val().to_device(&device),
            )
        };

        let std = var.add_scalar(self.epsilon).sqrt().reshape(shape);
        input
            .sub(mean.reshape(shape))
            .div(std)
            .mul(self.gamma.val().reshape(shape))
            .add(self.beta.val().reshape(shape))
    }

    /// Fold one batch's statistics into the running averages
    pub fn commit(&mut self, mean: Tensor<B, 1>, var: Tensor<B, 1>) {
        self.running_mean = blend(&self.running_mean, mean, self.momentum);
        self.running_var = blend(&self.running_var, var, self.momentum);
    }
}

fn blend<B: Backend>(
    running: &Param<Tensor<B, 1>>,
    batch: Tensor<B, 1>,
    momentum: f64,
) -> Param<Tensor<B, 1>> {
    let value = running.val();
    let batch = batch.to_device(&value.device());
    let value = value
        .mul_scalar(1.0 - momentum)
        .add(batch.mul_scalar(momentum))
        .detach();
    Param::initialized(running.id, value)
}

/// Batch statistics of every [`Norm`] a forward pass went through, in order
#[derive(Debug, Clone)]
pub struct NormStats<B: Backend> {
    batches: Vec<(Tensor<B, 1>, Tensor<B, 1>)>,
}

impl<B: Backend> Default for NormStats<B> {
    fn default() -> Self {
        Self {
            batches: Vec::new(),
        }
    }
}

impl<B: Backend> NormStats<B> {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, mean: Tensor<B, 1>, var: Tensor<B, 1>) {
        self.batches.push((mean, var));
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            batches: self
                .batches
                .into_iter()
                .map(|(mean, var)| (mean.to_device(device), var.to_device(device)))
                .collect(),
        }
    }

    /// Commit each batch to the matching layer; `norms` must be in forward order
    pub fn commit_to<'a>(self, norms: impl IntoIterator<Item = &'a mut Norm<B>>)
    where
        B: 'a,
    {
        for (norm, (mean, var)) in norms.into_iter().zip(self.batches) {
            norm.commit(mean, var);
        }
    }
}

impl<B: AutodiffBackend> NormStats<B> {
    pub fn inner(self) -> NormStats<B::InnerBackend> {
        NormStats {
            batches: self
                .batches
                .into_iter()
                .map(|(mean, var)| (mean.inner(), var.inner()))
                .collect(),
        }
    }

    pub fn from_inner(stats: NormStats<B::InnerBackend>) -> Self {
        Self {
            batches: stats
                .batches
                .into_iter()
                .map(|(mean, var)| (Tensor::from_inner(mean), Tensor::from_inner(var)))
                .collect(),
        }
    }
}
