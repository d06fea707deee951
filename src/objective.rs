//! Objective function: the scalar loss and its gradient seed.
//!
//! Terms contribute independently; each applies its own scale factor in both
//! `compute_value` and `compute_gradient`. The function sums term values
//! into one scalar per mini-batch and keeps a running history for reporting;
//! the history aggregate is also what the shared checkpoint persists.

use anyhow::Result;

use crate::graph::{LayerGraph, LayerId};
use crate::layers::{split_layer_mut, Layer};
use crate::weights::WeightsId;
use crate::{grid_bail, EvalType};

/// One weighted contribution to the total objective. Layer and weights
/// references are fixed id lists resolved at setup.
pub trait ObjectiveTerm: Send {
    fn name(&self) -> &str;

    fn scale_factor(&self) -> EvalType;

    /// Resolve and validate the term's layer/weights references.
    fn setup(&mut self, graph: &LayerGraph, layers: &[Layer]) -> Result<()>;

    fn layer_pointers(&self) -> &[LayerId];

    fn weights_pointers(&self) -> &[WeightsId] {
        &[]
    }

    /// Layers whose error signal this term accumulates into.
    fn gradient_layers(&self) -> Vec<LayerId>;

    /// Scalar value, scale factor applied.
    fn compute_value(&mut self, layers: &[Layer]) -> Result<EvalType>;

    /// Accumulate the gradient seed into the layer error signals, scale
    /// factor applied. Buffers are zeroed by the owning objective function
    /// before any term runs.
    fn compute_gradient(&mut self, layers: &mut [Layer]) -> Result<()>;
}

/// Mean squared difference between a target layer's prediction and ground
/// truth views.
pub struct MeanSquaredErrorTerm {
    scale_factor: EvalType,
    target: LayerId,
    // [parent (prediction side), target] once resolved
    layers: Vec<LayerId>,
}

impl MeanSquaredErrorTerm {
    pub fn new(target: LayerId, scale_factor: EvalType) -> MeanSquaredErrorTerm {
        MeanSquaredErrorTerm {
            scale_factor,
            target,
            layers: Vec::new(),
        }
    }

    fn resolved(&self) -> Result<(LayerId, LayerId)> {
        match self.layers.as_slice() {
            [parent, target] => Ok((*parent, *target)),
            _ => grid_bail!("objective term \"{}\" used before setup", self.name()),
        }
    }
}

impl ObjectiveTerm for MeanSquaredErrorTerm {
    fn name(&self) -> &str {
        "mean squared error"
    }

    fn scale_factor(&self) -> EvalType {
        self.scale_factor
    }

    fn setup(&mut self, graph: &LayerGraph, layers: &[Layer]) -> Result<()> {
        let Some(layer) = layers.get(self.target.0) else {
            grid_bail!("objective term references unknown {}", self.target);
        };
        if !layer.is_target() {
            grid_bail!(
                "objective term expects a target layer, got \"{}\"",
                layer.name()
            );
        }
        let parents = graph.parents_of(self.target);
        let [parent] = parents else {
            grid_bail!(
                "target layer \"{}\" must have exactly one parent, has {}",
                layer.name(),
                parents.len()
            );
        };
        self.layers = vec![LayerId(*parent), self.target];
        Ok(())
    }

    fn layer_pointers(&self) -> &[LayerId] {
        &self.layers
    }

    fn gradient_layers(&self) -> Vec<LayerId> {
        vec![self.target]
    }

    fn compute_value(&mut self, layers: &[Layer]) -> Result<EvalType> {
        let (parent, target) = self.resolved()?;
        let predictions = layers[parent.0].activations_view()?;
        let ground_truth = layers[target.0].activations_view()?;
        let mse = predictions.mean_with(&ground_truth, |p, t| {
            let d = p as f64 - t as f64;
            d * d
        })?;
        Ok(self.scale_factor * mse)
    }

    fn compute_gradient(&mut self, layers: &mut [Layer]) -> Result<()> {
        let (parent, target) = self.resolved()?;
        let (target_layer, peers) = split_layer_mut(layers, target.0, &[parent.0]);
        let cols = target_layer.cur_mini_batch_cols();
        let predictions = peers[0].activations()?.view_cols(cols);
        let (truth_mat, error) = target_layer.activations_and_error_mut()?;
        let ground_truth = truth_mat.view_cols(cols);

        // d/dp mean((p - t)^2) over the global entry set
        let (h, _) = truth_mat.global_dims();
        let n = (h * cols) as f64;
        let scale = self.scale_factor;
        let mut es = error.view_cols_mut(cols);
        ndarray::Zip::from(&mut es)
            .and(&predictions)
            .and(&ground_truth)
            .for_each(|e, &p, &t| {
                *e += (scale * 2.0 * (p as f64 - t as f64) / n) as f32;
            });
        Ok(())
    }
}

/// Sum of terms with a running history mean for reporting.
#[derive(Default)]
pub struct ObjectiveFunction {
    terms: Vec<Box<dyn ObjectiveTerm>>,
    history_sum: EvalType,
    history_count: u64,
}

impl ObjectiveFunction {
    pub fn new() -> ObjectiveFunction {
        ObjectiveFunction::default()
    }

    pub fn add_term(&mut self, term: Box<dyn ObjectiveTerm>) {
        self.terms.push(term);
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn setup(&mut self, graph: &LayerGraph, layers: &[Layer]) -> Result<()> {
        if self.terms.is_empty() {
            grid_bail!("objective function has no terms");
        }
        for term in &mut self.terms {
            term.setup(graph, layers)?;
        }
        Ok(())
    }

    /// Total objective for the current mini-batch; recorded into the
    /// history.
    pub fn compute_value(&mut self, layers: &[Layer]) -> Result<EvalType> {
        let mut total = 0.0;
        for term in &mut self.terms {
            total += term.compute_value(layers)?;
        }
        self.history_sum += total;
        self.history_count += 1;
        Ok(total)
    }

    /// Seed the backward pass: zero the involved error signals once, then
    /// let every term accumulate its contribution.
    pub fn compute_gradient(&mut self, layers: &mut [Layer]) -> Result<()> {
        let mut seeded: Vec<usize> = Vec::new();
        for term in &self.terms {
            for id in term.gradient_layers() {
                if !seeded.contains(&id.0) {
                    seeded.push(id.0);
                }
            }
        }
        for &i in &seeded {
            layers[i].error_signal_mut()?.fill(0.0);
        }
        for term in &mut self.terms {
            term.compute_gradient(layers)?;
        }
        Ok(())
    }

    pub fn get_history_mean_value(&self) -> EvalType {
        self.history_sum / self.history_count as EvalType
    }

    pub fn clear_history(&mut self) {
        self.history_sum = 0.0;
        self.history_count = 0;
    }

    /// Aggregate scalars persisted by the shared checkpoint.
    pub fn history_aggregate(&self) -> (EvalType, u64) {
        (self.history_sum, self.history_count)
    }

    pub fn restore_history(&mut self, sum: EvalType, count: u64) {
        self.history_sum = sum;
        self.history_count = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Comm;
    use crate::data::{Dataset, SliceReader};
    use crate::layers::{IdentityKernel, InputLayer, TargetLayer};
    use crate::weights::WeightsTable;
    use crate::{DataLayout, ExecutionMode};
    use ndarray::prelude::*;
    use smallvec::smallvec;

    /// data -> identity -> target over 4 samples of 2 features; labels are
    /// 2-vectors so the shape check passes.
    fn tiny_arena(comm: &Comm) -> (Vec<Layer>, LayerGraph) {
        let data = Array2::from_shape_fn((2, 4), |(i, j)| (i * 4 + j) as f32);
        let labels = data.mapv(|v| v + 1.0);
        let reader = SliceReader::new(data, labels, smallvec![2]).unwrap();
        let mut il = InputLayer::new();
        il.add_dataset(
            ExecutionMode::Training,
            Dataset::new(Box::new(reader), 4).unwrap(),
        )
        .unwrap();

        let mut graph = LayerGraph::new();
        let input = graph.add_node();
        let ident = graph.add_node();
        let target = graph.add_node();
        graph.add_edge(input, ident).unwrap();
        graph.add_edge(ident, target).unwrap();
        graph.freeze().unwrap();

        let mut layers = vec![
            Layer::new_input("data", DataLayout::DataParallel, il),
            Layer::new_compute("ident", DataLayout::DataParallel, Box::new(IdentityKernel)),
            Layer::new_target(
                "target",
                DataLayout::DataParallel,
                TargetLayer::new(input, false),
            ),
        ];

        // setup in topo order
        layers[0].setup_dims(None, None).unwrap();
        let (l1, peers) = split_layer_mut(&mut layers, 1, &[0]);
        l1.setup_dims(Some(peers[0]), None).unwrap();
        let (l2, peers) = split_layer_mut(&mut layers, 2, &[1, 0]);
        l2.setup_dims(Some(peers[0]), Some(peers[1])).unwrap();
        for l in layers.iter_mut() {
            l.setup_data(comm, 4, &mut []).unwrap();
        }

        // one forward pass over the whole batch
        let weights = WeightsTable::new();
        for l in layers.iter_mut() {
            l.fp_set_std_matrix_view(4, &mut []);
        }
        layers[0]
            .fp_compute(ExecutionMode::Training, None, None, &weights)
            .unwrap();
        let (l1, peers) = split_layer_mut(&mut layers, 1, &[0]);
        l1.fp_compute(ExecutionMode::Training, Some(peers[0]), None, &weights)
            .unwrap();
        let (l2, peers) = split_layer_mut(&mut layers, 2, &[0]);
        l2.fp_compute(ExecutionMode::Training, None, Some(peers[0]), &weights)
            .unwrap();

        (layers, graph)
    }

    #[test]
    fn mse_value_applies_scale_factor() {
        let comm = Comm::self_comm();
        let (layers, graph) = tiny_arena(&comm);

        // predictions equal data, labels are data + 1: mse = 1
        let mut term = MeanSquaredErrorTerm::new(LayerId(2), 1.0);
        term.setup(&graph, &layers).unwrap();
        let v = term.compute_value(&layers).unwrap();
        assert!((v - 1.0).abs() < 1e-6, "v = {}", v);

        let mut scaled = MeanSquaredErrorTerm::new(LayerId(2), 0.5);
        scaled.setup(&graph, &layers).unwrap();
        let v = scaled.compute_value(&layers).unwrap();
        assert!((v - 0.5).abs() < 1e-6, "v = {}", v);
    }

    #[test]
    fn gradient_seeds_target_error_signal() {
        let comm = Comm::self_comm();
        let (mut layers, graph) = tiny_arena(&comm);

        let mut obj = ObjectiveFunction::new();
        obj.add_term(Box::new(MeanSquaredErrorTerm::new(LayerId(2), 1.0)));
        obj.setup(&graph, &layers).unwrap();

        let v = obj.compute_value(&layers).unwrap();
        assert!((obj.get_history_mean_value() - v).abs() < 1e-12);

        obj.compute_gradient(&mut layers).unwrap();
        // every prediction is exactly 1 below its label, n = 2 * 4 entries
        let es = layers[2].error_signal_view().unwrap();
        for &g in es.data.iter() {
            assert!((g as f64 + 2.0 / 8.0).abs() < 1e-6, "g = {}", g);
        }
    }

    #[test]
    fn term_setup_rejects_non_target_layers() {
        let comm = Comm::self_comm();
        let (layers, graph) = tiny_arena(&comm);
        let mut term = MeanSquaredErrorTerm::new(LayerId(1), 1.0);
        let err = term.setup(&graph, &layers).unwrap_err();
        assert!(err.to_string().contains("expects a target layer"));
    }

    #[test]
    fn history_clears() {
        let comm = Comm::self_comm();
        let (layers, graph) = tiny_arena(&comm);
        let mut obj = ObjectiveFunction::new();
        obj.add_term(Box::new(MeanSquaredErrorTerm::new(LayerId(2), 1.0)));
        obj.setup(&graph, &layers).unwrap();
        obj.compute_value(&layers).unwrap();
        obj.compute_value(&layers).unwrap();
        let (sum, count) = obj.history_aggregate();
        assert_eq!(count, 2);
        assert!(sum > 0.0);
        obj.clear_history();
        assert!(obj.get_history_mean_value().is_nan());
    }
}
