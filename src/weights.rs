//! Model parameters and the optimizer contract.
//!
//! Weights are owned by the model in a [`WeightsTable`] arena and referenced
//! by id from layers and objective terms; several layers may share one entry.
//! The update step is deduplicated by the weights object itself: each entry
//! remembers the last training step it applied, so a shared entry steps its
//! optimizer exactly once per step no matter how many layers reference it.

use anyhow::Result;

use crate::comm::Comm;
use crate::matrix::DistMat;
use crate::{data_layout_to_matrix_format, grid_bail, DataLayout};

/// Index of a weights entry in the model's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeightsId(pub usize);

/// Optimizer update rule. Concrete math beyond plain SGD lives outside this
/// crate.
pub trait Optimizer: Send {
    fn name(&self) -> &str;

    /// Apply one update given the accumulated gradient.
    fn step(&mut self, values: &mut DistMat, gradient: &DistMat) -> Result<()>;
}

pub struct Sgd {
    learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Sgd {
        Sgd { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn step(&mut self, values: &mut DistMat, gradient: &DistMat) -> Result<()> {
        values.scaled_add(-self.learning_rate, gradient)
    }
}

/// A named parameter tensor with its gradient buffer and optional optimizer.
pub struct Weights {
    name: String,
    values: DistMat,
    gradient: DistMat,
    optimizer: Option<Box<dyn Optimizer>>,
    last_update_step: Option<u64>,
}

impl Weights {
    /// Allocate weights for a layer with the given layout. The distribution
    /// comes from the one layout -> format mapping.
    pub fn new(
        comm: &Comm,
        name: &str,
        layout: DataLayout,
        height: usize,
        width: usize,
        seed: u64,
    ) -> Result<Weights> {
        let format = data_layout_to_matrix_format(layout)?;
        let stdev = 1.0 / (height.max(1) as f32).sqrt();
        Ok(Weights {
            name: name.to_string(),
            values: DistMat::gaussian(comm, format, height, width, 0.0, stdev, seed)?,
            gradient: DistMat::zeros(comm, format, height, width)?,
            optimizer: None,
            last_update_step: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &DistMat {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut DistMat {
        &mut self.values
    }

    pub fn gradient(&self) -> &DistMat {
        &self.gradient
    }

    pub fn gradient_mut(&mut self) -> &mut DistMat {
        &mut self.gradient
    }

    pub fn set_optimizer(&mut self, opt: Box<dyn Optimizer>) {
        self.optimizer = Some(opt);
    }

    pub fn clear_gradient(&mut self) {
        self.gradient.fill(0.0);
    }

    /// Apply the optimizer once for training step `step`. A second call with
    /// the same step (another layer sharing these weights) is a no-op.
    pub fn update(&mut self, step: u64) -> Result<()> {
        if self.last_update_step == Some(step) {
            return Ok(());
        }
        if let Some(opt) = self.optimizer.as_mut() {
            opt.step(&mut self.values, &self.gradient)?;
        }
        self.last_update_step = Some(step);
        self.clear_gradient();
        Ok(())
    }
}

/// Arena of weights entries; names are unique within a model.
#[derive(Default)]
pub struct WeightsTable {
    entries: Vec<Weights>,
}

impl WeightsTable {
    pub fn new() -> WeightsTable {
        WeightsTable::default()
    }

    pub fn insert(&mut self, weights: Weights) -> Result<WeightsId> {
        if self.entries.iter().any(|w| w.name == weights.name) {
            grid_bail!("duplicate weights name \"{}\"", weights.name);
        }
        self.entries.push(weights);
        Ok(WeightsId(self.entries.len() - 1))
    }

    pub fn get(&self, id: WeightsId) -> &Weights {
        &self.entries[id.0]
    }

    pub fn get_mut(&mut self, id: WeightsId) -> &mut Weights {
        &mut self.entries[id.0]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Weights> {
        self.entries.iter()
    }

    /// Step every entry's optimizer for this training step. Iterating the
    /// table (not the layers) is what keeps shared weights from double
    /// updating; the per-entry step guard makes that explicit.
    pub fn update_all(&mut self, step: u64) -> Result<()> {
        for w in &mut self.entries {
            w.update(step)?;
        }
        Ok(())
    }
}
