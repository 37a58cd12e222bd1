// SPDX-License-Identifier: MIT OR Apache-2.0

//! Data-parallel training across tower replicas
//!
//! A step fans the global batch out into one contiguous shard per device,
//! runs forward, loss and backward on a fork of the shared parameter set for
//! each shard, waits for every replica, averages the gradient bundles and
//! applies them with the optimiser of the chosen objective.

use std::path::Path;

use burn::module::Module;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, Sgd, SgdConfig};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use tracing::debug;

use crate::checkpoint::{self, CheckpointMeta};
use crate::config::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::gradients::{average_gradients, GradientBundle};
use crate::heads::DualNet;
use crate::loss::{LossMetrics, ReplicaLosses};
use crate::norm::NormStats;
use crate::params::Objective;
use crate::session::{NetworkSession, TrainingBatch};
use crate::summary::MergedSummary;

type MomentumSgd<B> = OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, DualNet<B>, B>;

/// Run `work` once per device on a fork of `net`, one thread per replica
///
/// Returns only after every replica has finished, in device order.
pub(crate) fn fan_out<B, I, T, F>(
    net: &DualNet<B>,
    devices: &[B::Device],
    inputs: Vec<I>,
    work: F,
) -> Result<Vec<T>>
where
    B: Backend,
    I: Send,
    T: Send,
    F: Fn(usize, DualNet<B>, B::Device, I) -> T + Sync,
{
    std::thread::scope(|scope| {
        let work = &work;
        let handles: Vec<_> = devices
            .iter()
            .zip(inputs)
            .enumerate()
            .map(|(index, (device, input))| {
                let replica = net.clone().fork(device);
                let device = device.clone();
                scope.spawn(move || work(index, replica, device, input))
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| handle.join().map_err(|_| NetworkError::ReplicaFailed { index }))
            .collect()
    })
}

/// What one replica hands back to the barrier
struct ReplicaStep<B: AutodiffBackend> {
    metrics: LossMetrics,
    bundle: GradientBundle,
    probabilities: Tensor<B::InnerBackend, 2>,
    values: Tensor<B::InnerBackend, 2>,
    norm_stats: NormStats<B::InnerBackend>,
}

/// Outcome of one training step
#[derive(Debug, Clone)]
pub struct StepReport<B: Backend> {
    /// Global step after the update
    pub global_step: u64,
    pub objective: Objective,
    /// Metrics averaged over replicas
    pub metrics: LossMetrics,
    /// Full-batch move probabilities from this step's forward pass
    pub probabilities: Tensor<B, 2>,
    /// Full-batch value estimates from this step's forward pass
    pub values: Tensor<B, 2>,
}

/// Optimisers, global step and summaries of a trainable session
pub struct Trainer<B: AutodiffBackend> {
    global_step: u64,
    l2_scale: f32,
    policy: MomentumSgd<B>,
    value: MomentumSgd<B>,
    combined: MomentumSgd<B>,
    summary: Option<MergedSummary>,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub(crate) fn new(config: &NetworkConfig, global_step: u64, summaries: bool) -> Self {
        let sgd = SgdConfig::new().with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(config.momentum)
                .with_dampening(0.0),
        ));

        Self {
            global_step,
            l2_scale: config.l2_scale,
            policy: sgd.init(),
            value: sgd.init(),
            combined: sgd.init(),
            summary: summaries.then(MergedSummary::new),
        }
    }

    /// Number of updates applied so far, by any objective
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Merged summaries; only present at [`crate::Disclosure::ExtraV2`]
    pub fn summary(&mut self) -> Option<&mut MergedSummary> {
        self.summary.as_mut()
    }

    fn optimizer(&mut self, objective: Objective) -> &mut MomentumSgd<B> {
        match objective {
            Objective::Policy => &mut self.policy,
            Objective::Value => &mut self.value,
            Objective::Combined => &mut self.combined,
        }
    }

    /// Apply one update for `objective` using every replica
    ///
    /// Blocks until all replicas have computed their gradients. The batch
    /// statistics of every replica are then committed to the running averages,
    /// in replica order, before the update is applied.
    pub fn step(
        &mut self,
        session: &mut NetworkSession<B>,
        batch: &TrainingBatch<B>,
        objective: Objective,
        learning_rate: f64,
    ) -> Result<StepReport<B::InnerBackend>> {
        let config = session.config();
        batch.validate(config.batch_size, config.num_labels)?;

        let shards: Vec<TrainingBatch<B>> = session
            .shard_ranges(batch.rows())?
            .into_iter()
            .zip(session.devices())
            .map(|(rows, device)| batch.shard(rows, device))
            .collect();

        let l2_scale = self.l2_scale;
        let registry = session.registry();
        let replicas = fan_out(
            session.net(),
            session.devices(),
            shards,
            |index, replica, device, shard| {
                let outputs = replica.forward(shard.boards);
                let losses = ReplicaLosses::assemble(
                    &replica,
                    &outputs,
                    shard.moves,
                    shard.scores,
                    l2_scale,
                    &device,
                );
                let metrics = losses.metrics();

                let mut grads = GradientsParams::from_grads(losses.target(objective).backward(), &replica);
                registry.restrict(objective, &replica, &mut grads);

                ReplicaStep::<B> {
                    metrics,
                    bundle: GradientBundle {
                        replica: index,
                        objective,
                        grads,
                    },
                    probabilities: outputs.probabilities().inner(),
                    values: outputs.value.inner(),
                    norm_stats: outputs.norm_stats.inner(),
                }
            },
        )?;

        let primary = session.primary_device().clone();
        let mut metrics = Vec::with_capacity(replicas.len());
        let mut bundles = Vec::with_capacity(replicas.len());
        let mut probabilities = Vec::with_capacity(replicas.len());
        let mut values = Vec::with_capacity(replicas.len());
        let mut norm_stats = Vec::with_capacity(replicas.len());
        for replica in replicas {
            metrics.push(replica.metrics);
            norm_stats.push(replica.norm_stats.to_device(&primary));
            bundles.push(replica.bundle);
            probabilities.push(replica.probabilities.to_device(&primary));
            values.push(replica.values.to_device(&primary));
        }

        let grads = average_gradients(session.net(), bundles, &primary);
        for stats in norm_stats {
            session.net.commit_norm_stats(NormStats::from_inner(stats));
        }
        let net = session.net.clone();
        session.net = self.optimizer(objective).step(learning_rate, net, grads);
        self.global_step += 1;

        let metrics = LossMetrics::mean(&metrics);
        debug!(
            "step {} ({}): policy {:.4} value {:.4} total {:.4} acc {:.3}",
            self.global_step,
            objective,
            metrics.policy_loss,
            metrics.value_loss,
            metrics.combined_loss,
            metrics.accuracy
        );
        if let Some(summary) = self.summary.as_mut() {
            summary.record(self.global_step, &metrics);
        }

        Ok(StepReport {
            global_step: self.global_step,
            objective,
            metrics,
            probabilities: Tensor::cat(probabilities, 0),
            values: Tensor::cat(values, 0),
        })
    }

    /// Save the session's parameters together with the current global step
    pub fn save_checkpoint(&self, session: &NetworkSession<B>, path: impl AsRef<Path>) -> Result<()> {
        checkpoint::save(
            path.as_ref(),
            session.net(),
            &CheckpointMeta::new(session.config(), self.global_step),
        )
    }
}
