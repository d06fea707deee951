//! Layers: nodes of the computation graph.
//!
//! The original design space here is a deep virtual hierarchy; this crate
//! keeps a closed set of kinds instead — input, target, and generic compute
//! layers — carried by one [`Layer`] struct and dispatched through a single
//! contract: `setup_dims`, `setup_data`, `fp_compute`, `bp_compute`,
//! `fp_set_std_matrix_view`. Concrete math kernels implement
//! [`ComputeLayer`] outside this crate; the shipped kernels are trivial
//! stand-ins used by tests and demos.

pub mod input;
pub mod target;

pub use input::InputLayer;
pub use target::TargetLayer;

use anyhow::Result;
use ndarray::prelude::*;

use crate::comm::Comm;
use crate::data::Dims;
use crate::matrix::{DistMat, DistView};
use crate::metrics::MetricEntry;
use crate::weights::{WeightsId, WeightsTable};
use crate::{data_layout_to_matrix_format, grid_bail, DataLayout, ExecutionMode, MatrixFormat};

/// Distribution of a layer's sample-data buffers. Derived from the weights
/// mapping: replicated weights pair with data partitioned along the
/// mini-batch dimension.
pub fn activations_format(layout: DataLayout) -> Result<MatrixFormat> {
    match data_layout_to_matrix_format(layout)? {
        MatrixFormat::StarStar => Ok(MatrixFormat::StarVc),
        f => Ok(f),
    }
}

/// Local computation contract for generic layers. Implementations own any
/// kernel state and reference model weights by id.
pub trait ComputeLayer: Send {
    fn kernel_name(&self) -> &str;

    /// Output shape given the parent's output shape.
    fn output_dims(&self, input_dims: &Dims) -> Result<Dims>;

    /// Weights entries this kernel reads and accumulates gradients into.
    fn weights(&self) -> &[WeightsId] {
        &[]
    }

    fn fp(
        &mut self,
        weights: &WeightsTable,
        input: ArrayView2<'_, f32>,
        output: ArrayViewMut2<'_, f32>,
    ) -> Result<()>;

    fn bp(
        &mut self,
        weights: &mut WeightsTable,
        input: ArrayView2<'_, f32>,
        grad_output: ArrayView2<'_, f32>,
        grad_input: ArrayViewMut2<'_, f32>,
    ) -> Result<()>;
}

pub enum LayerKind {
    Input(InputLayer),
    Target(TargetLayer),
    Compute(Box<dyn ComputeLayer>),
}

pub struct Layer {
    name: String,
    layout: DataLayout,
    pub(crate) kind: LayerKind,
    neuron_dims: Dims,
    num_neurons: usize,
    num_prev_neurons: usize,
    activations: Option<DistMat>,
    error_signal: Option<DistMat>,
    /// Global width of the current mini-batch views; re-set every step by
    /// `fp_set_std_matrix_view`, never carried across steps.
    cur_mini_batch_cols: usize,
}

impl Layer {
    fn new(name: &str, layout: DataLayout, kind: LayerKind) -> Layer {
        Layer {
            name: name.to_string(),
            layout,
            kind,
            neuron_dims: Dims::new(),
            num_neurons: 0,
            num_prev_neurons: 0,
            activations: None,
            error_signal: None,
            cur_mini_batch_cols: 0,
        }
    }

    pub fn new_input(name: &str, layout: DataLayout, input: InputLayer) -> Layer {
        Layer::new(name, layout, LayerKind::Input(input))
    }

    pub fn new_target(name: &str, layout: DataLayout, target: TargetLayer) -> Layer {
        Layer::new(name, layout, LayerKind::Target(target))
    }

    pub fn new_compute(name: &str, layout: DataLayout, kernel: Box<dyn ComputeLayer>) -> Layer {
        Layer::new(name, layout, LayerKind::Compute(kernel))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_layout(&self) -> DataLayout {
        self.layout
    }

    pub fn num_neurons(&self) -> usize {
        self.num_neurons
    }

    pub fn num_prev_neurons(&self) -> usize {
        self.num_prev_neurons
    }

    pub fn neuron_dims(&self) -> &Dims {
        &self.neuron_dims
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, LayerKind::Input(_))
    }

    pub fn is_target(&self) -> bool {
        matches!(self.kind, LayerKind::Target(_))
    }

    pub fn as_input(&self) -> Option<&InputLayer> {
        match &self.kind {
            LayerKind::Input(il) => Some(il),
            _ => None,
        }
    }

    pub fn as_input_mut(&mut self) -> Option<&mut InputLayer> {
        match &mut self.kind {
            LayerKind::Input(il) => Some(il),
            _ => None,
        }
    }

    pub fn as_target(&self) -> Option<&TargetLayer> {
        match &self.kind {
            LayerKind::Target(tl) => Some(tl),
            _ => None,
        }
    }

    pub fn as_target_mut(&mut self) -> Option<&mut TargetLayer> {
        match &mut self.kind {
            LayerKind::Target(tl) => Some(tl),
            _ => None,
        }
    }

    /// Compute this layer's output shape from its parent's. `paired` is the
    /// target layer's paired input layer, where applicable.
    pub fn setup_dims(&mut self, parent: Option<&Layer>, paired: Option<&Layer>) -> Result<()> {
        self.num_prev_neurons = parent.map_or(0, |p| p.num_neurons);
        if let Some(p) = parent {
            if p.layout != self.layout {
                grid_bail!(
                    "layer \"{}\" ({:?}) is incompatible with parent \"{}\" ({:?})",
                    self.name,
                    self.layout,
                    p.name,
                    p.layout
                );
            }
        }
        match &mut self.kind {
            LayerKind::Input(il) => {
                self.neuron_dims = il.data_dims()?;
                self.num_neurons = self.neuron_dims.iter().product();
            }
            LayerKind::Compute(kernel) => {
                let Some(p) = parent else {
                    grid_bail!("compute layer \"{}\" has no parent", self.name);
                };
                self.neuron_dims = kernel.output_dims(&p.neuron_dims)?;
                self.num_neurons = self.neuron_dims.iter().product();
            }
            LayerKind::Target(tl) => {
                let Some(paired) = paired else {
                    grid_bail!("target layer \"{}\" has no paired input layer", self.name);
                };
                let il = paired.as_input().ok_or_else(|| {
                    crate::grid_error!(
                        "target layer \"{}\" paired with non-input layer \"{}\"",
                        self.name,
                        paired.name
                    )
                })?;
                if tl.is_for_regression() {
                    self.neuron_dims = il.data_dims()?;
                    self.num_neurons = self.neuron_dims.iter().product();
                } else {
                    self.num_neurons = il.linearized_label_size()?;
                    self.neuron_dims = smallvec::smallvec![self.num_neurons];
                }
            }
        }
        Ok(())
    }

    /// Allocate buffers and validate shapes. Target layers register their
    /// neuron count with every model metric here.
    pub fn setup_data(
        &mut self,
        comm: &Comm,
        max_mini_batch_size: usize,
        metrics: &mut [MetricEntry],
    ) -> Result<()> {
        if let LayerKind::Target(_) = self.kind {
            if self.num_prev_neurons != self.num_neurons {
                grid_bail!(
                    "target layer \"{}\": num_prev_neurons != num_neurons; \
                     num_prev_neurons= {} num_neurons= {}",
                    self.name,
                    self.num_prev_neurons,
                    self.num_neurons
                );
            }
            for m in metrics.iter_mut() {
                m.metric.setup(self.num_neurons, max_mini_batch_size);
            }
        }
        let format = activations_format(self.layout)?;
        self.activations = Some(DistMat::zeros(
            comm,
            format,
            self.num_neurons,
            max_mini_batch_size,
        )?);
        if !self.is_input() {
            self.error_signal = Some(DistMat::zeros(
                comm,
                format,
                self.num_prev_neurons,
                max_mini_batch_size,
            )?);
        }
        Ok(())
    }

    /// Re-slice every view to the current global mini-batch width. Must run
    /// before any compute call of the same step. Target layers also re-view
    /// the model metrics.
    pub fn fp_set_std_matrix_view(
        &mut self,
        cur_mini_batch_size: usize,
        metrics: &mut [MetricEntry],
    ) {
        self.cur_mini_batch_cols = cur_mini_batch_size;
        if let LayerKind::Target(_) = self.kind {
            for m in metrics.iter_mut() {
                m.metric.fp_set_std_matrix_view(cur_mini_batch_size);
            }
        }
    }

    pub fn cur_mini_batch_cols(&self) -> usize {
        self.cur_mini_batch_cols
    }

    fn activations_mat(&self) -> Result<&DistMat> {
        self.activations
            .as_ref()
            .ok_or_else(|| crate::grid_error!("layer \"{}\" used before setup_data", self.name))
    }

    /// Current-mini-batch view of this layer's activations.
    pub fn activations_view(&self) -> Result<DistView<'_>> {
        Ok(self.activations_mat()?.dist_view(self.cur_mini_batch_cols))
    }

    pub fn activations(&self) -> Result<&DistMat> {
        self.activations_mat()
    }

    /// Current-mini-batch view of the gradient w.r.t. this layer's input.
    pub fn error_signal_view(&self) -> Result<DistView<'_>> {
        let es = self
            .error_signal
            .as_ref()
            .ok_or_else(|| crate::grid_error!("layer \"{}\" has no error signal", self.name))?;
        Ok(es.dist_view(self.cur_mini_batch_cols))
    }

    pub(crate) fn error_signal_mut(&mut self) -> Result<&mut DistMat> {
        self.error_signal
            .as_mut()
            .ok_or_else(|| crate::grid_error!("layer \"{}\" has no error signal", self.name))
    }

    /// Own activations (read) alongside the error signal (write); the
    /// objective function needs both ends of a target layer at once.
    pub(crate) fn activations_and_error_mut(&mut self) -> Result<(&DistMat, &mut DistMat)> {
        match (&self.activations, &mut self.error_signal) {
            (Some(a), Some(e)) => Ok((a, e)),
            _ => Err(crate::grid_error!(
                "layer \"{}\" used before setup_data",
                self.name
            )),
        }
    }

    /// This rank's share of a `global_cols`-wide mini-batch.
    pub fn local_mini_batch_cols(&self, global_cols: usize) -> Result<usize> {
        Ok(self.activations_mat()?.local_cols_of(global_cols))
    }

    /// Forward step. Input layers fetch samples, target layers fetch labels
    /// through their paired input layer, compute layers run their kernel.
    pub fn fp_compute(
        &mut self,
        mode: ExecutionMode,
        parent: Option<&Layer>,
        paired: Option<&Layer>,
        weights: &WeightsTable,
    ) -> Result<()> {
        let cols = self.cur_mini_batch_cols;
        match &mut self.kind {
            LayerKind::Input(il) => {
                let act = self
                    .activations
                    .as_mut()
                    .ok_or_else(|| crate::grid_error!("input layer used before setup_data"))?;
                il.fetch_samples(mode, act, cols)
            }
            LayerKind::Target(tl) => {
                let paired = paired
                    .ok_or_else(|| crate::grid_error!("target layer lost its paired input"))?;
                let act = self
                    .activations
                    .as_mut()
                    .ok_or_else(|| crate::grid_error!("target layer used before setup_data"))?;
                tl.fetch_labels(mode, paired, act, cols)
            }
            LayerKind::Compute(kernel) => {
                let parent = parent
                    .ok_or_else(|| crate::grid_error!("compute layer has no parent"))?;
                let input = parent.activations_mat()?.view_cols(cols);
                let act = self
                    .activations
                    .as_mut()
                    .ok_or_else(|| crate::grid_error!("compute layer used before setup_data"))?;
                kernel.fp(weights, input, act.view_cols_mut(cols))
            }
        }
    }

    /// Backward step. The child's error signal is the gradient w.r.t. this
    /// layer's output; the kernel turns it into the gradient w.r.t. this
    /// layer's input and accumulates weight gradients. Input layers have
    /// nothing to do; target layers receive their error signal from the
    /// objective function.
    pub fn bp_compute(
        &mut self,
        parent: Option<&Layer>,
        child: Option<&Layer>,
        weights: &mut WeightsTable,
    ) -> Result<()> {
        let cols = self.cur_mini_batch_cols;
        match &mut self.kind {
            LayerKind::Input(_) | LayerKind::Target(_) => Ok(()),
            LayerKind::Compute(kernel) => {
                let parent = parent
                    .ok_or_else(|| crate::grid_error!("compute layer has no parent"))?;
                let child = child
                    .ok_or_else(|| crate::grid_error!("compute layer has no child"))?;
                let input = parent.activations_mat()?.view_cols(cols);
                let grad_output = child
                    .error_signal
                    .as_ref()
                    .ok_or_else(|| {
                        crate::grid_error!("child \"{}\" has no error signal", child.name)
                    })?
                    .view_cols(cols);
                let es = self
                    .error_signal
                    .as_mut()
                    .ok_or_else(|| crate::grid_error!("layer has no error signal"))?;
                kernel.bp(weights, input, grad_output, es.view_cols_mut(cols))
            }
        }
    }

    /// Per-rank checkpoint hook. Layers carry no persistent scalar state of
    /// their own; kinds that need more override by matching here.
    pub fn save_to_checkpoint(&self, _ck: &mut crate::checkpoint::LocalCheckpoint) -> Result<bool> {
        Ok(true)
    }

    pub fn load_from_checkpoint(&mut self, _ck: &mut crate::checkpoint::LocalCheckpoint) -> Result<bool> {
        Ok(true)
    }
}

/// Split one mutable layer out of the arena alongside shared peers. The
/// peers must be distinct from `idx`; parents and children always are in a
/// frozen acyclic graph.
pub(crate) fn split_layer_mut<'a>(
    layers: &'a mut [Layer],
    idx: usize,
    peers: &[usize],
) -> (&'a mut Layer, Vec<&'a Layer>) {
    assert!(idx < layers.len());
    assert!(peers.iter().all(|&p| p < layers.len() && p != idx));
    let ptr = layers.as_mut_ptr();
    unsafe {
        let main = &mut *ptr.add(idx);
        let refs = peers.iter().map(|&p| &*(ptr.add(p) as *const Layer)).collect();
        (main, refs)
    }
}

/// Passes its input through unchanged.
pub struct IdentityKernel;

impl ComputeLayer for IdentityKernel {
    fn kernel_name(&self) -> &str {
        "identity"
    }

    fn output_dims(&self, input_dims: &Dims) -> Result<Dims> {
        Ok(input_dims.clone())
    }

    fn fp(
        &mut self,
        _weights: &WeightsTable,
        input: ArrayView2<'_, f32>,
        mut output: ArrayViewMut2<'_, f32>,
    ) -> Result<()> {
        output.assign(&input);
        Ok(())
    }

    fn bp(
        &mut self,
        _weights: &mut WeightsTable,
        _input: ArrayView2<'_, f32>,
        grad_output: ArrayView2<'_, f32>,
        mut grad_input: ArrayViewMut2<'_, f32>,
    ) -> Result<()> {
        grad_input.assign(&grad_output);
        Ok(())
    }
}

/// Multiplies its input by a fixed factor.
pub struct ScaleKernel {
    pub factor: f32,
}

impl ComputeLayer for ScaleKernel {
    fn kernel_name(&self) -> &str {
        "scale"
    }

    fn output_dims(&self, input_dims: &Dims) -> Result<Dims> {
        Ok(input_dims.clone())
    }

    fn fp(
        &mut self,
        _weights: &WeightsTable,
        input: ArrayView2<'_, f32>,
        mut output: ArrayViewMut2<'_, f32>,
    ) -> Result<()> {
        output.assign(&input);
        output.mapv_inplace(|v| v * self.factor);
        Ok(())
    }

    fn bp(
        &mut self,
        _weights: &mut WeightsTable,
        _input: ArrayView2<'_, f32>,
        grad_output: ArrayView2<'_, f32>,
        mut grad_input: ArrayViewMut2<'_, f32>,
    ) -> Result<()> {
        grad_input.assign(&grad_output);
        grad_input.mapv_inplace(|v| v * self.factor);
        Ok(())
    }
}
