//! The model: layer graph, weights, objective, metrics and callbacks under
//! one driver.
//!
//! Per epoch the driver loops mini-batches until the input layer's dataset
//! wraps: re-slice every matrix view to the current batch width, forward
//! propagate in topological order, score the objective and metrics, then (in
//! training) backward propagate in reverse order and step each distinct
//! weights entry once. The final batch of an epoch may be smaller than the
//! configured size; sample accounting uses its global size and buffer views
//! its per-rank share.

use std::path::Path;

use anyhow::Result;

use crate::callbacks::Callback;
use crate::checkpoint::{bytes_to_f32s, f32s_to_bytes, LocalCheckpoint, Persist, PersistType};
use crate::comm::{Comm, RankLogger};
use crate::graph::{LayerGraph, LayerId};
use crate::layers::{split_layer_mut, Layer, LayerKind};
use crate::matrix::DistView;
use crate::metrics::{Metric, MetricEntry};
use crate::objective::{ObjectiveFunction, ObjectiveTerm};
use crate::weights::{Weights, WeightsId, WeightsTable};
use crate::{grid_bail, ExecutionMode};

pub struct Model {
    name: String,
    comm: Comm,
    logger: RankLogger,
    layers: Vec<Layer>,
    graph: LayerGraph,
    weights: WeightsTable,
    objective: ObjectiveFunction,
    metrics: Vec<MetricEntry>,
    callbacks: Vec<Box<dyn Callback>>,
    mode: ExecutionMode,
    cur_epoch: u64,
    cur_step: u64,
    num_backprop_steps: u64,
    max_mini_batch_size: usize,
    cur_global_mini_batch_size: usize,
    primary_input: Option<LayerId>,
    target_layers: Vec<LayerId>,
    is_setup: bool,
}

impl Model {
    pub fn new(comm: Comm, name: &str, max_mini_batch_size: usize) -> Model {
        let logger = RankLogger::for_comm(&comm);
        Model {
            name: name.to_string(),
            comm,
            logger,
            layers: Vec::new(),
            graph: LayerGraph::new(),
            weights: WeightsTable::new(),
            objective: ObjectiveFunction::new(),
            metrics: Vec::new(),
            callbacks: Vec::new(),
            mode: ExecutionMode::Invalid,
            cur_epoch: 0,
            cur_step: 0,
            num_backprop_steps: 0,
            max_mini_batch_size,
            cur_global_mini_batch_size: 0,
            primary_input: None,
            target_layers: Vec::new(),
            is_setup: false,
        }
    }

    /// Build an empty model from trainer settings.
    pub fn from_config(comm: Comm, name: &str, cfg: &crate::configs::TrainerConfig) -> Model {
        Model::new(comm, name, cfg.mini_batch_size)
    }

    // ---- composition ----

    pub fn add_layer(&mut self, layer: Layer) -> LayerId {
        let id = self.graph.add_node();
        debug_assert_eq!(id.0, self.layers.len());
        self.layers.push(layer);
        id
    }

    pub fn add_edge(&mut self, parent: LayerId, child: LayerId) -> Result<()> {
        self.graph.add_edge(parent, child)
    }

    pub fn add_weights(&mut self, weights: Weights) -> Result<WeightsId> {
        self.weights.insert(weights)
    }

    pub fn add_objective_term(&mut self, term: Box<dyn ObjectiveTerm>) {
        self.objective.add_term(term);
    }

    pub fn add_metric(&mut self, metric: Box<dyn Metric>) {
        self.metrics.push(MetricEntry::new(metric));
    }

    pub fn add_callback(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    // ---- accessors ----

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_comm(&self) -> &Comm {
        &self.comm
    }

    pub fn logger(&self) -> &RankLogger {
        &self.logger
    }

    pub fn get_execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn get_cur_epoch(&self) -> u64 {
        self.cur_epoch
    }

    pub fn get_cur_step(&self) -> u64 {
        self.cur_step
    }

    pub fn get_num_backprop_steps(&self) -> u64 {
        self.num_backprop_steps
    }

    pub fn get_max_mini_batch_size(&self) -> usize {
        self.max_mini_batch_size
    }

    /// Global size of the mini-batch currently in flight.
    pub fn get_current_mini_batch_size(&self) -> usize {
        self.cur_global_mini_batch_size
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, id: LayerId) -> &Layer {
        &self.layers[id.0]
    }

    pub fn layer_ids(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.graph.order()
    }

    pub fn get_metrics(&self) -> &[MetricEntry] {
        &self.metrics
    }

    pub fn get_objective_function(&self) -> &ObjectiveFunction {
        &self.objective
    }

    pub fn get_weights(&self) -> &WeightsTable {
        &self.weights
    }

    /// The input layer the driver tracks epochs against.
    pub fn input_layer(&self) -> Result<&Layer> {
        let id = self
            .primary_input
            .ok_or_else(|| crate::grid_error!("model \"{}\" has not been set up", self.name))?;
        Ok(&self.layers[id.0])
    }

    fn input_layer_id(&self) -> Result<LayerId> {
        self.primary_input
            .ok_or_else(|| crate::grid_error!("model \"{}\" has not been set up", self.name))
    }

    /// Prediction and ground-truth views of the first target layer.
    pub fn target_views(&self) -> Result<(DistView<'_>, DistView<'_>)> {
        let Some(&target) = self.target_layers.first() else {
            grid_bail!("model \"{}\" has no target layer", self.name);
        };
        let [parent] = self.graph.parents_of(target) else {
            grid_bail!("target layer must have exactly one parent");
        };
        let predictions = self.layers[*parent].activations_view()?;
        let ground_truth = self.layers[target.0].activations_view()?;
        Ok((predictions, ground_truth))
    }

    // ---- setup ----

    /// Freeze the graph, validate the topology, and run `setup_dims` then
    /// `setup_data` over every layer in topological order.
    pub fn setup(&mut self) -> Result<()> {
        if self.layers.is_empty() {
            grid_bail!("model \"{}\" has no layers", self.name);
        }
        self.graph.freeze()?;
        self.validate_structure()?;

        let order: Vec<LayerId> = self.graph.order().collect();
        for &id in &order {
            let parent = self.graph.parents_of(id).first().copied();
            let paired = self.layers[id.0].as_target().map(|t| t.paired_input().0);
            let mut peers = Vec::new();
            if let Some(p) = parent {
                peers.push(p);
            }
            if let Some(p) = paired {
                peers.push(p);
            }
            let (layer, refs) = split_layer_mut(&mut self.layers, id.0, &peers);
            let parent_ref = parent.map(|_| refs[0]);
            let paired_ref = paired.map(|_| *refs.last().unwrap());
            layer.setup_dims(parent_ref, paired_ref)?;
        }

        let Model {
            layers,
            metrics,
            comm,
            max_mini_batch_size,
            ..
        } = self;
        for &id in &order {
            layers[id.0].setup_data(comm, *max_mini_batch_size, metrics)?;
        }

        self.objective.setup(&self.graph, &self.layers)?;
        self.is_setup = true;
        self.run_callbacks(|cb, m| cb.setup(m))?;
        self.logger.debug(&format!(
            "model \"{}\" set up with {} layers",
            self.name,
            self.layers.len()
        ));
        Ok(())
    }

    /// Kind-level topology checks, and validation of every target layer's
    /// paired-input relation. Doing this here keeps a bad pairing from
    /// surfacing as a bad reference deep inside the run.
    fn validate_structure(&mut self) -> Result<()> {
        let mut inputs = Vec::new();
        let mut targets = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            let id = LayerId(i);
            let num_parents = self.graph.parents_of(id).len();
            let num_children = self.graph.children_of(id).len();
            match &layer.kind {
                LayerKind::Input(_) => {
                    if num_parents != 0 {
                        grid_bail!("input layer \"{}\" has {} parents", layer.name(), num_parents);
                    }
                    inputs.push(id);
                }
                LayerKind::Target(tl) => {
                    if num_parents != 1 || num_children != 0 {
                        grid_bail!(
                            "target layer \"{}\" must have one parent and no children \
                             (has {} and {})",
                            layer.name(),
                            num_parents,
                            num_children
                        );
                    }
                    let paired = tl.paired_input();
                    let ok = self.layers.get(paired.0).map_or(false, |l| l.is_input());
                    if !ok {
                        grid_bail!(
                            "target layer \"{}\" paired with {} which is not an input layer",
                            layer.name(),
                            paired
                        );
                    }
                    targets.push(id);
                }
                LayerKind::Compute(kernel) => {
                    if num_parents != 1 || num_children != 1 {
                        grid_bail!(
                            "compute layer \"{}\" must have one parent and one child \
                             (has {} and {})",
                            layer.name(),
                            num_parents,
                            num_children
                        );
                    }
                    for w in kernel.weights() {
                        if w.0 >= self.weights.len() {
                            grid_bail!(
                                "compute layer \"{}\" references unknown weights entry {}",
                                layer.name(),
                                w.0
                            );
                        }
                    }
                }
            }
        }
        if inputs.is_empty() {
            grid_bail!("model \"{}\" has no input layer", self.name);
        }
        self.primary_input = targets
            .first()
            .and_then(|t| self.layers[t.0].as_target().map(|tl| tl.paired_input()))
            .or_else(|| inputs.first().copied());
        self.target_layers = targets;
        Ok(())
    }

    // ---- training and evaluation ----

    pub fn train(&mut self, num_epochs: usize) -> Result<()> {
        if !self.is_setup {
            grid_bail!("model \"{}\" must be set up before training", self.name);
        }
        for _ in 0..num_epochs {
            self.mode = ExecutionMode::Training;
            self.reset_epoch_statistics(ExecutionMode::Training);
            self.run_callbacks(|cb, m| cb.on_epoch_begin(m))?;

            loop {
                self.step_mini_batch()?;
                if self
                    .primary_input_layer()?
                    .at_new_epoch(ExecutionMode::Training)?
                {
                    break;
                }
            }

            self.cur_epoch += 1;
            self.run_callbacks(|cb, m| cb.on_epoch_end(m))?;

            let has_validation = self
                .primary_input_layer()?
                .is_execution_mode_valid(ExecutionMode::Validation);
            if has_validation {
                self.evaluate(ExecutionMode::Validation)?;
            }
        }
        Ok(())
    }

    pub fn evaluate(&mut self, mode: ExecutionMode) -> Result<()> {
        if !self.is_setup {
            grid_bail!("model \"{}\" must be set up before evaluation", self.name);
        }
        match mode {
            ExecutionMode::Validation | ExecutionMode::Testing | ExecutionMode::Prediction => {}
            m => grid_bail!("cannot evaluate in execution mode \"{}\"", m),
        }
        if !self.primary_input_layer().map_or(false, |il| {
            il.is_execution_mode_valid(mode)
        }) {
            grid_bail!("no dataset attached for execution mode \"{}\"", mode);
        }

        self.mode = mode;
        self.reset_epoch_statistics(mode);
        loop {
            self.step_mini_batch()?;
            if self.primary_input_layer()?.at_new_epoch(mode)? {
                break;
            }
        }
        match mode {
            ExecutionMode::Validation => {
                self.run_callbacks(|cb, m| cb.on_validation_end(m))?;
            }
            ExecutionMode::Testing => {
                self.run_callbacks(|cb, m| cb.on_test_end(m))?;
            }
            _ => {}
        }
        Ok(())
    }

    fn primary_input_layer(&self) -> Result<&crate::layers::InputLayer> {
        let id = self.input_layer_id()?;
        self.layers[id.0]
            .as_input()
            .ok_or_else(|| crate::grid_error!("primary input id does not name an input layer"))
    }

    fn reset_epoch_statistics(&mut self, mode: ExecutionMode) {
        for m in &mut self.metrics {
            m.reset_epoch(mode);
        }
        self.objective.clear_history();
    }

    /// One mini-batch: views first, then forward, objective and metrics,
    /// then (training only) backward and the per-entry weights update.
    fn step_mini_batch(&mut self) -> Result<()> {
        let mode = self.mode;
        self.run_callbacks(|cb, m| cb.on_batch_begin(m))?;

        let input_id = self.input_layer_id()?;
        let global_mb = {
            let il = self.primary_input_layer()?;
            il.dataset(mode)?.current_global_mini_batch_size()
        };
        self.cur_global_mini_batch_size = global_mb;

        // Views are re-derived before any compute call; a view kept from a
        // previous (wider) batch would read garbage columns.
        {
            let Model {
                layers, metrics, graph, ..
            } = self;
            for id in graph.order() {
                layers[id.0].fp_set_std_matrix_view(global_mb, metrics);
            }
        }

        self.forward_prop(mode)?;

        let objective_value = self.objective.compute_value(&self.layers)?;
        if !objective_value.is_finite() {
            self.logger.warn(&format!(
                "non-finite objective value at step {}",
                self.cur_step
            ));
        }

        if !self.metrics.is_empty() && !self.target_layers.is_empty() {
            let Model {
                layers,
                graph,
                metrics,
                target_layers,
                ..
            } = self;
            let target = target_layers[0];
            let [parent] = graph.parents_of(target) else {
                grid_bail!("target layer must have exactly one parent");
            };
            let predictions = layers[*parent].activations_view()?;
            let ground_truth = layers[target.0].activations_view()?;
            for entry in metrics.iter_mut() {
                let score = entry.metric.compute_metric(&predictions, &ground_truth)?;
                entry.record(mode, score, global_mb as u64);
            }
        }

        if mode == ExecutionMode::Training {
            self.objective.compute_gradient(&mut self.layers)?;
            self.backward_prop()?;
            self.weights.update_all(self.num_backprop_steps)?;
            self.num_backprop_steps += 1;
            self.cur_step += 1;
        }

        {
            let il = self.layer_input_mut(input_id)?;
            il.update_num_samples_processed(mode, global_mb as u64)?;
            il.dataset_mut(mode)?.advance();
        }

        self.run_callbacks(|cb, m| cb.on_batch_end(m))?;
        Ok(())
    }

    fn layer_input_mut(&mut self, id: LayerId) -> Result<&mut crate::layers::InputLayer> {
        self.layers[id.0]
            .as_input_mut()
            .ok_or_else(|| crate::grid_error!("primary input id does not name an input layer"))
    }

    fn forward_prop(&mut self, mode: ExecutionMode) -> Result<()> {
        let order: Vec<LayerId> = self.graph.order().collect();
        for id in order {
            self.run_callbacks(|cb, m| cb.on_forward_prop_begin(m, id))?;
            {
                let parent = self.graph.parents_of(id).first().copied();
                let paired = self.layers[id.0].as_target().map(|t| t.paired_input().0);
                let mut peers = Vec::new();
                if let Some(p) = parent {
                    peers.push(p);
                }
                if let Some(p) = paired {
                    peers.push(p);
                }
                let Model {
                    layers, weights, ..
                } = self;
                let (layer, refs) = split_layer_mut(layers, id.0, &peers);
                let parent_ref = parent.map(|_| refs[0]);
                let paired_ref = paired.map(|_| *refs.last().unwrap());
                layer.fp_compute(mode, parent_ref, paired_ref, weights)?;
            }
            self.run_callbacks(|cb, m| cb.on_forward_prop_end(m, id))?;
        }
        Ok(())
    }

    fn backward_prop(&mut self) -> Result<()> {
        let order: Vec<LayerId> = self.graph.reverse_order().collect();
        for id in order {
            self.run_callbacks(|cb, m| cb.on_backward_prop_begin(m, id))?;
            {
                let parent = self.graph.parents_of(id).first().copied();
                let child = self.graph.children_of(id).first().copied();
                let mut peers = Vec::new();
                if let Some(p) = parent {
                    peers.push(p);
                }
                if let Some(c) = child {
                    peers.push(c);
                }
                let Model {
                    layers, weights, ..
                } = self;
                let (layer, refs) = split_layer_mut(layers, id.0, &peers);
                let parent_ref = parent.map(|_| refs[0]);
                let child_ref = child.map(|_| *refs.last().unwrap());
                layer.bp_compute(parent_ref, child_ref, weights)?;
            }
            self.run_callbacks(|cb, m| cb.on_backward_prop_end(m, id))?;
        }
        Ok(())
    }

    fn run_callbacks<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Box<dyn Callback>, &Model) -> Result<()>,
    {
        let mut callbacks = std::mem::take(&mut self.callbacks);
        let mut result = Ok(());
        for cb in callbacks.iter_mut() {
            result = f(cb, self);
            if result.is_err() {
                break;
            }
        }
        self.callbacks = callbacks;
        result
    }

    // ---- checkpointing ----

    /// Per-rank checkpoint: every rank writes its own scalar state and its
    /// local weights partitions.
    pub fn save_to_checkpoint(&self, dir: &Path) -> Result<bool> {
        let mut ck = LocalCheckpoint::new(dir, self.comm.world_rank());
        ck.write_u64("cur epoch", self.cur_epoch);
        ck.write_u64("cur step", self.cur_step);
        ck.write_u64("num backprop steps", self.num_backprop_steps);
        let (cost, count) = self.objective.history_aggregate();
        ck.write_f64("aggregate cost", cost);
        ck.write_u64("history samples", count);
        for w in self.weights.iter() {
            let flat: Vec<f32> = w.values().local().iter().copied().collect();
            ck.write_bytes(&format!("weights {}", w.name()), f32s_to_bytes(&flat));
        }
        for layer in &self.layers {
            if !layer.save_to_checkpoint(&mut ck)? {
                return Ok(false);
            }
        }
        Ok(ck.save())
    }

    pub fn load_from_checkpoint(&mut self, dir: &Path) -> Result<bool> {
        let Ok(mut ck) = LocalCheckpoint::open(dir, self.comm.world_rank()) else {
            return Ok(false);
        };
        let (Some(epoch), Some(step), Some(bp), Some(cost), Some(count)) = (
            ck.read_u64("cur epoch"),
            ck.read_u64("cur step"),
            ck.read_u64("num backprop steps"),
            ck.read_f64("aggregate cost"),
            ck.read_u64("history samples"),
        ) else {
            return Ok(false);
        };
        self.cur_epoch = epoch;
        self.cur_step = step;
        self.num_backprop_steps = bp;
        self.objective.restore_history(cost, count);
        for i in 0..self.weights.len() {
            let name = self.weights.get(WeightsId(i)).name().to_string();
            let Some(bytes) = ck.read_bytes(&format!("weights {}", name)) else {
                return Ok(false);
            };
            let flat = bytes_to_f32s(bytes)?;
            let w = self.weights.get_mut(WeightsId(i));
            let mut local = w.values_mut().local_mut();
            if flat.len() != local.len() {
                grid_bail!(
                    "weights \"{}\" checkpoint has {} values, expected {}",
                    name,
                    flat.len(),
                    local.len()
                );
            }
            for (dst, src) in local.iter_mut().zip(flat) {
                *dst = src;
            }
        }
        for i in 0..self.layers.len() {
            if !self.layers[i].load_from_checkpoint(&mut ck)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Shared checkpoint: the model's rank 0 writes the aggregate scalar
    /// state, everyone else contributes nothing.
    pub fn save_to_checkpoint_shared(&self, p: &mut Persist) -> Result<bool> {
        if self.comm.get_rank_in_model() == 0 {
            p.write_u64(PersistType::Train, "cur epoch", self.cur_epoch);
            p.write_u64(PersistType::Train, "cur step", self.cur_step);
            p.write_u64(
                PersistType::Train,
                "num backprop steps",
                self.num_backprop_steps,
            );
            let (cost, count) = self.objective.history_aggregate();
            p.write_f64(PersistType::Train, "aggregate cost", cost);
            p.write_u64(PersistType::Train, "history samples", count);
            if !p.save() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Shared restore: rank 0 reads, then broadcasts, so every rank observes
    /// the same scalars — including agreement on failure.
    pub fn load_from_checkpoint_shared(&mut self, p: &Persist) -> Result<bool> {
        let mut buf: Vec<f64> = if self.comm.get_rank_in_model() == 0 {
            let fields = (
                p.read_u64(PersistType::Train, "cur epoch"),
                p.read_u64(PersistType::Train, "cur step"),
                p.read_u64(PersistType::Train, "num backprop steps"),
                p.read_f64(PersistType::Train, "aggregate cost"),
                p.read_u64(PersistType::Train, "history samples"),
            );
            match fields {
                (Some(e), Some(s), Some(b), Some(c), Some(n)) => {
                    vec![1.0, e as f64, s as f64, b as f64, c, n as f64]
                }
                _ => vec![0.0; 6],
            }
        } else {
            vec![0.0; 6]
        };
        self.comm.model_broadcast_f64(&mut buf)?;
        if buf[0] != 1.0 {
            return Ok(false);
        }
        self.cur_epoch = buf[1] as u64;
        self.cur_step = buf[2] as u64;
        self.num_backprop_steps = buf[3] as u64;
        self.objective.restore_history(buf[4], buf[5] as u64);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::DumpActivationsCallback;
    use crate::data::{Dataset, SliceReader};
    use crate::layers::{InputLayer, ScaleKernel, TargetLayer};
    use crate::metrics::{MeanAbsoluteError, PearsonCorrelation};
    use crate::objective::MeanSquaredErrorTerm;
    use crate::weights::Sgd;
    use crate::DataLayout;
    use ndarray::prelude::*;
    use smallvec::smallvec;
    use std::sync::{Arc, Mutex};

    /// data -> scale(x2) -> target, labels = 2 * data so predictions are
    /// exact. 10 samples with mini-batches of 4 leave a short final batch.
    fn build_model(comm: &Comm, samples: usize, mb: usize, modes: &[ExecutionMode]) -> Model {
        let data = Array2::from_shape_fn((2, samples), |(i, j)| {
            (i * samples + j) as f32 / samples as f32
        });
        let labels = data.mapv(|v| v * 2.0);

        let mut il = InputLayer::new();
        for &mode in modes {
            let reader =
                SliceReader::new(data.clone(), labels.clone(), smallvec![2]).unwrap();
            il.add_dataset(mode, Dataset::new(Box::new(reader), mb).unwrap())
                .unwrap();
        }

        let mut m = Model::new(comm.clone(), "test", mb);
        let input = m.add_layer(Layer::new_input("data", DataLayout::DataParallel, il));
        let hidden = m.add_layer(Layer::new_compute(
            "scale",
            DataLayout::DataParallel,
            Box::new(ScaleKernel { factor: 2.0 }),
        ));
        let target = m.add_layer(Layer::new_target(
            "target",
            DataLayout::DataParallel,
            TargetLayer::new(input, false),
        ));
        m.add_edge(input, hidden).unwrap();
        m.add_edge(hidden, target).unwrap();
        m.add_objective_term(Box::new(MeanSquaredErrorTerm::new(target, 1.0)));
        m.add_metric(Box::new(PearsonCorrelation));
        m.add_metric(Box::new(MeanAbsoluteError));
        m
    }

    #[derive(Default, Clone)]
    struct Recorder {
        batch_sizes: Arc<Mutex<Vec<usize>>>,
        forward: Arc<Mutex<Vec<String>>>,
        backward: Arc<Mutex<Vec<String>>>,
        views_consistent: Arc<Mutex<bool>>,
    }

    impl Recorder {
        fn new() -> Recorder {
            let r = Recorder::default();
            *r.views_consistent.lock().unwrap() = true;
            r
        }
    }

    impl Callback for Recorder {
        fn on_batch_end(&mut self, m: &Model) -> Result<()> {
            let mb = m.get_current_mini_batch_size();
            self.batch_sizes.lock().unwrap().push(mb);
            let mut ok = self.views_consistent.lock().unwrap();
            for id in m.layer_ids() {
                let layer = m.layer(id);
                *ok &= layer.cur_mini_batch_cols() == mb;
                *ok &= layer.activations_view().unwrap().data.ncols()
                    == layer.local_mini_batch_cols(mb).unwrap();
            }
            Ok(())
        }

        fn on_forward_prop_end(&mut self, m: &Model, id: LayerId) -> Result<()> {
            self.forward.lock().unwrap().push(m.layer(id).name().to_string());
            Ok(())
        }

        fn on_backward_prop_end(&mut self, m: &Model, id: LayerId) -> Result<()> {
            self.backward.lock().unwrap().push(m.layer(id).name().to_string());
            Ok(())
        }
    }

    #[test]
    fn model_from_trainer_config() {
        use crate::configs::{Configure, TrainerConfig};
        let comm = Comm::self_comm();
        let mut cfg = TrainerConfig::default();
        cfg.load_config("(mini_batch_size: 4, num_epochs: 1)").unwrap();
        let m = Model::from_config(comm, "configured", &cfg);
        assert_eq!(m.get_max_mini_batch_size(), 4);
    }

    #[test]
    fn one_epoch_covers_every_sample() {
        let comm = Comm::self_comm();
        let mut m = build_model(&comm, 10, 4, &[ExecutionMode::Training]);
        m.setup().unwrap();
        m.train(1).unwrap();

        assert_eq!(m.get_cur_epoch(), 1);
        assert_eq!(m.get_cur_step(), 3);
        assert_eq!(m.get_num_backprop_steps(), 3);
        let il = m.input_layer().unwrap().as_input().unwrap();
        assert_eq!(il.num_samples_processed(ExecutionMode::Training), 10);
    }

    #[test]
    fn short_final_batch_and_view_sizes() {
        let comm = Comm::self_comm();
        let mut m = build_model(&comm, 10, 4, &[ExecutionMode::Training]);
        let rec = Recorder::new();
        m.add_callback(Box::new(rec.clone()));
        m.setup().unwrap();
        m.train(1).unwrap();

        assert_eq!(*rec.batch_sizes.lock().unwrap(), vec![4, 4, 2]);
        assert!(*rec.views_consistent.lock().unwrap());
        let il = m.input_layer().unwrap().as_input().unwrap();
        assert!(
            il.global_last_mini_batch_size(ExecutionMode::Training)
                <= il.global_mini_batch_size(ExecutionMode::Training)
        );
    }

    #[test]
    fn propagation_order_is_topological() {
        let comm = Comm::self_comm();
        let mut m = build_model(&comm, 4, 4, &[ExecutionMode::Training]);
        let rec = Recorder::new();
        m.add_callback(Box::new(rec.clone()));
        m.setup().unwrap();
        m.train(1).unwrap();

        assert_eq!(
            *rec.forward.lock().unwrap(),
            vec!["data", "scale", "target"]
        );
        assert_eq!(
            *rec.backward.lock().unwrap(),
            vec!["target", "scale", "data"]
        );
    }

    #[test]
    fn perfect_predictions_score_perfectly() {
        let comm = Comm::self_comm();
        let mut m = build_model(
            &comm,
            8,
            4,
            &[ExecutionMode::Training, ExecutionMode::Testing],
        );
        m.setup().unwrap();
        m.evaluate(ExecutionMode::Testing).unwrap();

        // predictions equal labels exactly
        let obj = m.get_objective_function().get_history_mean_value();
        assert!(obj.abs() < 1e-10, "objective = {}", obj);
        let pearson = m.get_metrics()[0].report_metric(ExecutionMode::Testing);
        assert!((pearson - 1.0).abs() < 1e-6, "pearson = {}", pearson);
        let mae = m.get_metrics()[1].report_metric(ExecutionMode::Testing);
        assert!(mae.abs() < 1e-6, "mae = {}", mae);

        let (predictions, ground_truth) = m.target_views().unwrap();
        assert_eq!(predictions.data, ground_truth.data);
    }

    #[test]
    fn evaluate_rejects_bad_modes() {
        let comm = Comm::self_comm();
        let mut m = build_model(&comm, 4, 4, &[ExecutionMode::Training]);
        m.setup().unwrap();
        assert!(m.evaluate(ExecutionMode::Training).is_err());
        assert!(m.evaluate(ExecutionMode::Invalid).is_err());
        // valid mode, but no dataset attached for it
        let err = m.evaluate(ExecutionMode::Testing).unwrap_err();
        assert!(err.to_string().contains("testing"), "{}", err);
    }

    #[test]
    fn setup_rejects_bad_pairing() {
        let comm = Comm::self_comm();
        let mut m = Model::new(comm.clone(), "broken", 4);
        let data = Array2::zeros((2, 4));
        let labels = Array2::zeros((2, 4));
        let reader = SliceReader::new(data, labels, smallvec![2]).unwrap();
        let mut il = InputLayer::new();
        il.add_dataset(
            ExecutionMode::Training,
            Dataset::new(Box::new(reader), 4).unwrap(),
        )
        .unwrap();
        let input = m.add_layer(Layer::new_input("data", DataLayout::DataParallel, il));
        let hidden = m.add_layer(Layer::new_compute(
            "scale",
            DataLayout::DataParallel,
            Box::new(ScaleKernel { factor: 1.0 }),
        ));
        // paired with the compute layer instead of the input layer
        let target = m.add_layer(Layer::new_target(
            "target",
            DataLayout::DataParallel,
            TargetLayer::new(hidden, false),
        ));
        m.add_edge(input, hidden).unwrap();
        m.add_edge(hidden, target).unwrap();
        m.add_objective_term(Box::new(MeanSquaredErrorTerm::new(target, 1.0)));

        let err = m.setup().unwrap_err();
        assert!(err.to_string().contains("not an input layer"), "{}", err);
    }

    #[test]
    fn local_checkpoint_round_trips_weights_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let comm = Comm::self_comm();

        let mut a = build_model(&comm, 8, 4, &[ExecutionMode::Training]);
        let mut wa = Weights::new(&comm, "extra", DataLayout::DataParallel, 3, 2, 11).unwrap();
        wa.set_optimizer(Box::new(Sgd::new(0.1)));
        a.add_weights(wa).unwrap();
        a.setup().unwrap();
        a.train(2).unwrap();
        assert!(a.save_to_checkpoint(dir.path()).unwrap());

        let mut b = build_model(&comm, 8, 4, &[ExecutionMode::Training]);
        // different seed so restoring is observable
        let wb = Weights::new(&comm, "extra", DataLayout::DataParallel, 3, 2, 99).unwrap();
        b.add_weights(wb).unwrap();
        b.setup().unwrap();
        assert!(b.load_from_checkpoint(dir.path()).unwrap());

        assert_eq!(b.get_cur_epoch(), a.get_cur_epoch());
        assert_eq!(b.get_cur_step(), a.get_cur_step());
        assert_eq!(b.get_num_backprop_steps(), a.get_num_backprop_steps());
        assert_eq!(
            b.get_weights().get(WeightsId(0)).values().local(),
            a.get_weights().get(WeightsId(0)).values().local()
        );

        // missing checkpoint reads as failure, not corruption
        let empty = tempfile::tempdir().unwrap();
        assert!(!b.load_from_checkpoint(empty.path()).unwrap());
    }

    #[test]
    fn shared_checkpoint_restores_identical_scalars_on_every_rank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let ports = crate::comm::new_grid(2);
        let handles: Vec<_> = ports
            .into_iter()
            .map(|port| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let comm = Comm::new(port); // one model, two ranks
                    let mut m = build_model(&comm, 10, 4, &[ExecutionMode::Training]);
                    m.setup().unwrap();
                    m.train(1).unwrap();

                    let mut p = Persist::new(&path);
                    assert!(m.save_to_checkpoint_shared(&mut p).unwrap());
                    comm.world_barrier().unwrap();

                    let mut fresh = build_model(&comm, 10, 4, &[ExecutionMode::Training]);
                    fresh.setup().unwrap();
                    let p = Persist::open(&path);
                    assert!(fresh.load_from_checkpoint_shared(&p).unwrap());
                    let (cost, count) = fresh.get_objective_function().history_aggregate();
                    (
                        fresh.get_cur_epoch(),
                        fresh.get_cur_step(),
                        fresh.get_num_backprop_steps(),
                        cost,
                        count,
                    )
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0].0, 1); // one epoch trained
        assert_eq!(results[0].1, 3); // three steps
    }

    #[test]
    fn activation_dumps_skip_target_layers() {
        let dir = tempfile::tempdir().unwrap();
        let base = format!("{}/", dir.path().display());
        let comm = Comm::self_comm();
        let mut m = build_model(&comm, 4, 4, &[ExecutionMode::Training]);
        m.add_callback(Box::new(DumpActivationsCallback::new(&base)));
        m.setup().unwrap();
        m.train(1).unwrap();

        assert!(dir
            .path()
            .join("model0-epoch0-step0-data-Activations")
            .exists());
        assert!(dir
            .path()
            .join("model0-epoch0-step0-scale-Activations")
            .exists());
        assert!(!dir
            .path()
            .join("model0-epoch0-step0-target-Activations")
            .exists());
    }

    #[test]
    fn training_converges_with_a_learnable_kernel() {
        // a weighted kernel: y = w * x with w starting away from 2
        struct DiagonalKernel {
            weights: [WeightsId; 1],
        }
        impl crate::layers::ComputeLayer for DiagonalKernel {
            fn kernel_name(&self) -> &str {
                "diagonal"
            }
            fn output_dims(&self, input_dims: &crate::data::Dims) -> Result<crate::data::Dims> {
                Ok(input_dims.clone())
            }
            fn weights(&self) -> &[WeightsId] {
                &self.weights
            }
            fn fp(
                &mut self,
                weights: &WeightsTable,
                input: ndarray::ArrayView2<'_, f32>,
                mut output: ndarray::ArrayViewMut2<'_, f32>,
            ) -> Result<()> {
                let w = weights.get(self.weights[0]).values().local()[[0, 0]];
                output.assign(&input);
                output.mapv_inplace(|v| v * w);
                Ok(())
            }
            fn bp(
                &mut self,
                weights: &mut WeightsTable,
                input: ndarray::ArrayView2<'_, f32>,
                grad_output: ndarray::ArrayView2<'_, f32>,
                mut grad_input: ndarray::ArrayViewMut2<'_, f32>,
            ) -> Result<()> {
                let entry = weights.get_mut(self.weights[0]);
                let w = entry.values().local()[[0, 0]];
                let dw: f32 = input
                    .iter()
                    .zip(grad_output.iter())
                    .map(|(&x, &g)| x * g)
                    .sum();
                entry.gradient_mut().local_mut()[[0, 0]] += dw;
                grad_input.assign(&grad_output);
                grad_input.mapv_inplace(|v| v * w);
                Ok(())
            }
        }

        let comm = Comm::self_comm();
        let samples = 8;
        let data = Array2::from_shape_fn((2, samples), |(i, j)| {
            (i * samples + j) as f32 / samples as f32
        });
        let labels = data.mapv(|v| v * 2.0);
        let reader = SliceReader::new(data, labels, smallvec![2]).unwrap();
        let mut il = InputLayer::new();
        il.add_dataset(
            ExecutionMode::Training,
            Dataset::new(Box::new(reader), 4).unwrap(),
        )
        .unwrap();

        let mut m = Model::new(comm.clone(), "learn", 4);
        let mut w = Weights::new(&comm, "diag", DataLayout::DataParallel, 1, 1, 5).unwrap();
        w.values_mut().fill(0.5);
        w.set_optimizer(Box::new(Sgd::new(0.5)));
        let wid = m.add_weights(w).unwrap();

        let input = m.add_layer(Layer::new_input("data", DataLayout::DataParallel, il));
        let hidden = m.add_layer(Layer::new_compute(
            "diag",
            DataLayout::DataParallel,
            Box::new(DiagonalKernel { weights: [wid] }),
        ));
        let target = m.add_layer(Layer::new_target(
            "target",
            DataLayout::DataParallel,
            TargetLayer::new(input, false),
        ));
        m.add_edge(input, hidden).unwrap();
        m.add_edge(hidden, target).unwrap();
        m.add_objective_term(Box::new(MeanSquaredErrorTerm::new(target, 1.0)));
        m.setup().unwrap();

        m.train(50).unwrap();
        let w = m.get_weights().get(wid).values().local()[[0, 0]];
        assert!((w - 2.0).abs() < 0.2, "w = {}", w);
    }
}

