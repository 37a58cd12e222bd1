// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scalar summaries for external metric logging

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::loss::LossMetrics;

pub const VALUE_LOSS_TAG: &str = "step_value_loss";
pub const POLICY_LOSS_TAG: &str = "step_policy_loss";
pub const TOTAL_LOSS_TAG: &str = "step_total_loss";
pub const ACCURACY_TAG: &str = "step_acc_move";

/// One tagged scalar at one global step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarSummary {
    pub tag: String,
    pub step: u64,
    pub value: f32,
}

/// Summaries of every training step since the last drain
#[derive(Debug, Default)]
pub struct MergedSummary {
    pending: Vec<ScalarSummary>,
}

impl MergedSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the four step scalars
    pub fn record(&mut self, step: u64, metrics: &LossMetrics) {
        for (tag, value) in [
            (VALUE_LOSS_TAG, metrics.value_loss),
            (POLICY_LOSS_TAG, metrics.policy_loss),
            (TOTAL_LOSS_TAG, metrics.combined_loss),
            (ACCURACY_TAG, metrics.accuracy),
        ] {
            debug!(target: "summary", tag, step, value);
            self.pending.push(ScalarSummary {
                tag: tag.to_string(),
                step,
                value,
            });
        }
    }

    pub fn pending(&self) -> &[ScalarSummary] {
        &self.pending
    }

    /// Hand every pending summary to the caller
    pub fn drain(&mut self) -> Vec<ScalarSummary> {
        std::mem::take(&mut self.pending)
    }

    /// Drain as newline-delimited JSON
    pub fn drain_json_lines(&mut self) -> serde_json::Result<String> {
        let mut out = String::new();
        for summary in self.drain() {
            out.push_str(&serde_json::to_string(&summary)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_four_tags_per_step() {
        let mut merged = MergedSummary::new();
        let metrics = LossMetrics {
            policy_loss: 4.5,
            value_loss: 0.25,
            combined_loss: 4.75,
            accuracy: 0.125,
        };
        merged.record(7, &metrics);

        let tags: Vec<_> = merged.pending().iter().map(|s| s.tag.as_str()).collect();
        assert_eq!(tags, [VALUE_LOSS_TAG, POLICY_LOSS_TAG, TOTAL_LOSS_TAG, ACCURACY_TAG]);
        assert!(merged.pending().iter().all(|s| s.step == 7));

        let lines = merged.drain_json_lines().unwrap();
        assert_eq!(lines.lines().count(), 4);
        assert!(merged.pending().is_empty());

        let first: ScalarSummary = serde_json::from_str(lines.lines().next().unwrap()).unwrap();
        assert_eq!(first.value, 0.25);
    }
}
