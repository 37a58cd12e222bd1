// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parameter registry, per-objective trainable subsets and L2 regularisation

use std::collections::{HashMap, HashSet};
use std::fmt;

use burn::module::{Module, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, Result};
use crate::heads::DualNet;

/// Which part of the network owns a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamGroup {
    /// Tower parameters, trained by every objective
    Shared,
    /// Policy-head-only parameters
    Policy,
    /// Value-head-only parameters
    Value,
}

/// Optimisation target of a training step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Objective {
    /// Policy loss over everything except the value head
    Policy,
    /// Value loss over everything except the policy head
    Value,
    /// Combined loss over every trainable parameter
    Combined,
}

impl Objective {
    pub const ALL: [Objective; 3] = [Objective::Policy, Objective::Value, Objective::Combined];

    /// Whether parameters of `group` are updated by this objective
    pub fn trains(&self, group: ParamGroup) -> bool {
        !matches!(
            (self, group),
            (Objective::Policy, ParamGroup::Value) | (Objective::Value, ParamGroup::Policy)
        )
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Objective::Policy => write!(f, "policy"),
            Objective::Value => write!(f, "value"),
            Objective::Combined => write!(f, "combined"),
        }
    }
}

/// One trainable parameter
#[derive(Debug, Clone)]
pub struct ParamEntry {
    pub name: String,
    pub id: ParamId,
    pub group: ParamGroup,
    pub shape: Vec<usize>,
}

/// Every trainable parameter of a [`DualNet`], keyed by name
///
/// Built once per construction call and shared by reference with every
/// replica. Forked replicas keep their parameter ids, so the registry is valid
/// on every device.
#[derive(Debug, Clone)]
pub struct ParameterRegistry {
    entries: Vec<ParamEntry>,
    by_id: HashMap<ParamId, usize>,
}

impl ParameterRegistry {
    /// Walk the module tree and record each trainable parameter exactly once
    pub fn scan<B: AutodiffBackend>(net: &DualNet<B>) -> Result<Self> {
        let mut collector = Collector {
            prefix: "tower",
            group: ParamGroup::Shared,
            entries: Vec::new(),
        };
        net.tower.visit(&mut collector);

        collector.prefix = "policy_head";
        collector.group = ParamGroup::Policy;
        net.policy_head.visit(&mut collector);

        collector.prefix = "value_head";
        collector.group = ParamGroup::Value;
        net.value_head.visit(&mut collector);

        let mut by_id = HashMap::with_capacity(collector.entries.len());
        for (index, entry) in collector.entries.iter().enumerate() {
            if let Some(previous) = by_id.insert(entry.id, index) {
                return Err(NetworkError::DuplicateParameter {
                    first: collector.entries[previous].name.clone(),
                    second: entry.name.clone(),
                });
            }
        }

        Ok(Self {
            entries: collector.entries,
            by_id,
        })
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ParamEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn group_of(&self, id: ParamId) -> Option<ParamGroup> {
        self.by_id.get(&id).map(|&index| self.entries[index].group)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of trainable scalars
    pub fn num_scalars(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.shape.iter().product::<usize>())
            .sum()
    }

    /// Parameter ids updated by `objective`
    pub fn trainable(&self, objective: Objective) -> HashSet<ParamId> {
        self.entries
            .iter()
            .filter(|entry| objective.trains(entry.group))
            .map(|entry| entry.id)
            .collect()
    }

    /// Drop from `grads` every gradient outside the objective's subset
    pub fn restrict<B: AutodiffBackend>(
        &self,
        objective: Objective,
        net: &DualNet<B>,
        grads: &mut GradientsParams,
    ) {
        let mut pruner = Pruner::<B> {
            keep: self.trainable(objective),
            grads,
            backend: std::marker::PhantomData,
        };
        net.visit(&mut pruner);
    }
}

struct Collector {
    prefix: &'static str,
    group: ParamGroup,
    entries: Vec<ParamEntry>,
}

impl<B: Backend> ModuleVisitor<B> for Collector {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if !tensor.is_require_grad() {
            return;
        }
        let ordinal = self
            .entries
            .iter()
            .filter(|entry| entry.group == self.group)
            .count();
        self.entries.push(ParamEntry {
            name: format!("{}/{}", self.prefix, ordinal),
            id,
            group: self.group,
            shape: tensor.dims().to_vec(),
        });
    }
}

struct Pruner<'a, B: AutodiffBackend> {
    keep: HashSet<ParamId>,
    grads: &'a mut GradientsParams,
    backend: std::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Pruner<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if !self.keep.contains(&id) {
            self.grads.remove::<B::InnerBackend, D>(id);
        }
    }
}

/// `scale * sum(w^2) / 2` over every trainable parameter of `net`
///
/// Parameters are deduplicated by id, so a parameter reachable through
/// several paths, or shared by several replicas, is counted once.
pub fn l2_penalty<B: Backend>(net: &DualNet<B>, scale: f32, device: &B::Device) -> Tensor<B, 1> {
    let mut norm = SquaredNorm {
        seen: HashSet::new(),
        total: Tensor::zeros([1], device),
    };
    net.visit(&mut norm);
    norm.total.mul_scalar(scale / 2.0)
}

struct SquaredNorm<B: Backend> {
    seen: HashSet<ParamId>,
    total: Tensor<B, 1>,
}

impl<B: Backend> ModuleVisitor<B> for SquaredNorm<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if !tensor.is_require_grad() || !self.seen.insert(id) {
            return;
        }
        let squares = tensor.clone().mul(tensor.clone()).sum();
        self.total = self.total.clone().add(squares);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::device::DeviceTarget;
    use crate::test_utils::TestBackend;
    use burn::tensor::ElementConversion;

    fn net() -> DualNet<TestBackend> {
        let config = NetworkConfig::new(12, vec![DeviceTarget::Host])
            .with_filters(4)
            .with_res_layers(2);
        DualNet::new(&config, &Default::default()).unwrap()
    }

    #[test]
    fn registry_partitions_parameters() {
        let registry = ParameterRegistry::scan(&net()).unwrap();

        // stem conv(2) + bn(2), 2 blocks x 2 stages x (conv(2) + bn(2))
        let shared = registry
            .entries()
            .iter()
            .filter(|e| e.group == ParamGroup::Shared)
            .count();
        assert_eq!(shared, 4 + 2 * 2 * 4);

        // head norms carry no trainable scale or center
        let policy = registry.trainable(Objective::Policy);
        let value = registry.trainable(Objective::Value);
        let combined = registry.trainable(Objective::Combined);
        assert_eq!(combined.len(), registry.len());
        assert_eq!(registry.len(), shared + 4 + 6);
        assert_eq!(policy.len(), shared + 4);
        assert_eq!(value.len(), shared + 6);
        assert_eq!(policy.intersection(&value).count(), shared);
        assert_eq!(policy.union(&value).count(), combined.len());
    }

    #[test]
    fn names_are_stable_and_unique() {
        let registry = ParameterRegistry::scan(&net()).unwrap();
        let names: HashSet<_> = registry.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names.len(), registry.len());

        let dense = registry.get("policy_head/2").unwrap();
        assert_eq!(dense.shape, vec![2 * crate::BOARD_CELLS, 12]);
        assert_eq!(registry.group_of(dense.id), Some(ParamGroup::Policy));
    }

    #[test]
    fn l2_penalty_counts_each_parameter_once() {
        let net = net();
        let device = Default::default();
        let registry = ParameterRegistry::scan(&net).unwrap();

        let mut expected = 0.0f32;
        let mut sum_squares = SquaresBySet {
            ids: registry.trainable(Objective::Combined),
            total: &mut expected,
        };
        net.visit(&mut sum_squares);
        let expected = expected * 1e-5 / 2.0;

        let single: f32 = l2_penalty(&net, 1e-5, &device).into_scalar().elem();
        let forked: f32 = l2_penalty(&net.clone().fork(&device), 1e-5, &device)
            .into_scalar()
            .elem();

        assert!((single - expected).abs() <= expected * 1e-4);
        assert!((forked - single).abs() <= single * 1e-6);
    }

    struct SquaresBySet<'a> {
        ids: HashSet<ParamId>,
        total: &'a mut f32,
    }

    impl<B: Backend> ModuleVisitor<B> for SquaresBySet<'_> {
        fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
            if self.ids.remove(&id) {
                let values: Vec<f32> = tensor.to_data().to_vec().unwrap();
                *self.total += values.iter().map(|v| v * v).sum::<f32>();
            }
        }
    }

    #[test]
    fn objectives_exclude_the_other_head() {
        assert!(Objective::Policy.trains(ParamGroup::Shared));
        assert!(!Objective::Policy.trains(ParamGroup::Value));
        assert!(!Objective::Value.trains(ParamGroup::Policy));
        assert!(Objective::Combined.trains(ParamGroup::Policy));
        assert_eq!(Objective::Combined.to_string(), "combined");
    }
}
