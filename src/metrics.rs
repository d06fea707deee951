//! Evaluation metrics, tracked independently of the training loss.
//!
//! A metric computes one score per mini-batch from a (predictions,
//! ground-truth) view pair and accumulates per-mode statistics. Scores may
//! come out non-finite (e.g. correlation against a constant signal); that is
//! a reportable value, not an error.

use std::collections::HashMap;

use anyhow::Result;

use crate::matrix::DistView;
use crate::{EvalType, ExecutionMode};

/// Accumulated statistics for one execution mode.
#[derive(Debug, Default, Clone)]
pub struct Statistics {
    pub error_per_epoch: EvalType,
    pub iterations_per_epoch: u64,
    pub total_error: EvalType,
    pub total_num_samples: u64,
}

impl Statistics {
    pub fn reset_epoch(&mut self) {
        self.error_per_epoch = 0.0;
        self.iterations_per_epoch = 0;
    }

    pub fn record(&mut self, score: EvalType, num_samples: u64) {
        self.error_per_epoch += score;
        self.iterations_per_epoch += 1;
        self.total_error += score;
        self.total_num_samples += num_samples;
    }
}

/// The per-mini-batch score computation.
pub trait Metric: Send {
    fn name(&self) -> &str;

    /// Unit suffix for reports, e.g. "%".
    fn display_unit(&self) -> &str {
        ""
    }

    /// Called once by the target layer when data is set up.
    fn setup(&mut self, _num_neurons: usize, _max_mini_batch_size: usize) {}

    /// Re-view any internal buffers for the current mini-batch width. Called
    /// by the target layer every step before the forward pass.
    fn fp_set_std_matrix_view(&mut self, _cur_mini_batch_size: usize) {}

    fn compute_metric(
        &mut self,
        predictions: &DistView<'_>,
        ground_truth: &DistView<'_>,
    ) -> Result<EvalType>;
}

/// A metric plus its per-mode statistics, as owned by the model.
pub struct MetricEntry {
    pub metric: Box<dyn Metric>,
    stats: HashMap<ExecutionMode, Statistics>,
}

impl MetricEntry {
    pub fn new(metric: Box<dyn Metric>) -> MetricEntry {
        MetricEntry {
            metric,
            stats: HashMap::new(),
        }
    }

    pub fn record(&mut self, mode: ExecutionMode, score: EvalType, num_samples: u64) {
        self.stats.entry(mode).or_default().record(score, num_samples);
    }

    pub fn reset_epoch(&mut self, mode: ExecutionMode) {
        self.stats.entry(mode).or_default().reset_epoch();
    }

    pub fn statistics(&self, mode: ExecutionMode) -> Statistics {
        self.stats.get(&mode).cloned().unwrap_or_default()
    }

    /// Mean score over the current epoch for `mode`.
    pub fn report_metric(&self, mode: ExecutionMode) -> EvalType {
        let s = self.statistics(mode);
        s.error_per_epoch / s.iterations_per_epoch as EvalType
    }

    /// All-time mean for `mode`.
    pub fn report_lifetime_metric(&self, mode: ExecutionMode) -> EvalType {
        let s = self.statistics(mode);
        s.total_error / s.total_num_samples as EvalType
    }
}

/// corr(P, T) = covariance(P, T) / (stdev(P) * stdev(T))
///
/// Zero stdev on either side divides to a non-finite value; callers report
/// it rather than failing.
pub struct PearsonCorrelation;

impl Metric for PearsonCorrelation {
    fn name(&self) -> &str {
        "pearson correlation metric"
    }

    fn compute_metric(
        &mut self,
        predictions: &DistView<'_>,
        ground_truth: &DistView<'_>,
    ) -> Result<EvalType> {
        let (pred_mean, pred_std) = predictions.entrywise_mean_and_stdev()?;
        let (true_mean, true_std) = ground_truth.entrywise_mean_and_stdev()?;
        // mean of the entrywise product of the mean-centered sides
        let covariance = predictions.mean_with(ground_truth, |p, t| {
            (p as f64 - pred_mean) * (t as f64 - true_mean)
        })?;
        Ok(covariance / (pred_std * true_std))
    }
}

/// Mean absolute difference between predictions and ground truth.
pub struct MeanAbsoluteError;

impl Metric for MeanAbsoluteError {
    fn name(&self) -> &str {
        "mean absolute error metric"
    }

    fn compute_metric(
        &mut self,
        predictions: &DistView<'_>,
        ground_truth: &DistView<'_>,
    ) -> Result<EvalType> {
        predictions.mean_with(ground_truth, |p, t| (p as f64 - t as f64).abs())
    }
}
