// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gradient bundles and their synchronisation across replicas

use burn::module::{Module, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use tracing::warn;

use crate::heads::DualNet;
use crate::params::Objective;

/// Gradients one replica computed for one objective
#[derive(Debug)]
pub struct GradientBundle {
    pub replica: usize,
    pub objective: Objective,
    pub grads: GradientsParams,
}

/// Element-wise mean of each parameter's gradient across all bundles
///
/// Gradients are moved to `device` before being summed. Every replica shares
/// the parameter ids of `net`, so one walk over `net` finds each gradient in
/// every bundle. Bundles are consumed: this is the synchronisation point and
/// requires every replica to have finished its backward pass.
pub fn average_gradients<B: AutodiffBackend>(
    net: &DualNet<B>,
    bundles: Vec<GradientBundle>,
    device: &B::Device,
) -> GradientsParams {
    let mut averager = Averager::<B> {
        towers: bundles,
        device,
        averaged: GradientsParams::new(),
    };
    net.visit(&mut averager);
    averager.averaged
}

struct Averager<'a, B: AutodiffBackend> {
    towers: Vec<GradientBundle>,
    device: &'a B::Device,
    averaged: GradientsParams,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Averager<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let mut present = 0;
        let mut total: Option<Tensor<B::InnerBackend, D>> = None;

        for bundle in self.towers.iter_mut() {
            if let Some(grad) = bundle.grads.remove::<B::InnerBackend, D>(id) {
                let grad = grad.to_device(self.device);
                present += 1;
                total = Some(match total {
                    Some(total) => total.add(grad),
                    None => grad,
                });
            }
        }

        let Some(total) = total else {
            return;
        };
        if present != self.towers.len() {
            warn!(
                "gradient for {:?} present on {}/{} replicas; missing ones count as zero",
                id,
                present,
                self.towers.len()
            );
        }
        self.averaged
            .register::<B::InnerBackend, D>(id, total.div_scalar(self.towers.len() as f32));
    }
}
