//! Input layer: the boundary between data readers and the layer graph.

use std::collections::HashMap;

use anyhow::Result;

use crate::data::{Dataset, Dims};
use crate::matrix::DistMat;
use crate::{grid_bail, ExecutionMode};

/// Owns one dataset per execution mode and fills its activation buffer with
/// the local share of each mini-batch.
#[derive(Default)]
pub struct InputLayer {
    datasets: HashMap<ExecutionMode, Dataset>,
}

impl InputLayer {
    pub fn new() -> InputLayer {
        InputLayer::default()
    }

    pub fn add_dataset(&mut self, mode: ExecutionMode, dataset: Dataset) -> Result<()> {
        if mode == ExecutionMode::Invalid {
            grid_bail!("cannot attach a dataset to the invalid execution mode");
        }
        if self.datasets.contains_key(&mode) {
            grid_bail!("input layer already has a {} dataset", mode);
        }
        self.datasets.insert(mode, dataset);
        Ok(())
    }

    pub fn is_execution_mode_valid(&self, mode: ExecutionMode) -> bool {
        self.datasets.contains_key(&mode)
    }

    pub fn dataset(&self, mode: ExecutionMode) -> Result<&Dataset> {
        self.datasets
            .get(&mode)
            .ok_or_else(|| crate::grid_error!("no dataset for execution mode \"{}\"", mode))
    }

    pub fn dataset_mut(&mut self, mode: ExecutionMode) -> Result<&mut Dataset> {
        self.datasets
            .get_mut(&mode)
            .ok_or_else(|| crate::grid_error!("no dataset for execution mode \"{}\"", mode))
    }

    /// First dataset with a reader, training preferred. Dimension queries go
    /// through here so a model without a training split still sets up.
    fn first_valid_dataset(&self) -> Result<&Dataset> {
        const ORDER: [ExecutionMode; 4] = [
            ExecutionMode::Training,
            ExecutionMode::Validation,
            ExecutionMode::Testing,
            ExecutionMode::Prediction,
        ];
        ORDER
            .iter()
            .find_map(|m| self.datasets.get(m))
            .ok_or_else(|| crate::grid_error!("input layer has no datasets"))
    }

    pub fn data_dims(&self) -> Result<Dims> {
        Ok(self.first_valid_dataset()?.reader().data_dims())
    }

    pub fn linearized_data_size(&self) -> Result<usize> {
        Ok(self.first_valid_dataset()?.reader().linearized_data_size())
    }

    pub fn linearized_label_size(&self) -> Result<usize> {
        Ok(self.first_valid_dataset()?.reader().linearized_label_size())
    }

    pub fn at_new_epoch(&self, mode: ExecutionMode) -> Result<bool> {
        Ok(self.dataset(mode)?.at_new_epoch())
    }

    /// Iterations per epoch for reporting; zero when the mode has no data.
    pub fn num_iterations_per_epoch(&self, mode: ExecutionMode) -> usize {
        self.datasets
            .get(&mode)
            .map_or(0, |d| d.num_iterations_per_epoch())
    }

    pub fn global_mini_batch_size(&self, mode: ExecutionMode) -> usize {
        self.datasets
            .get(&mode)
            .map_or(0, |d| d.global_mini_batch_size())
    }

    pub fn global_last_mini_batch_size(&self, mode: ExecutionMode) -> usize {
        self.datasets
            .get(&mode)
            .map_or(0, |d| d.global_last_mini_batch_size())
    }

    pub fn num_samples_processed(&self, mode: ExecutionMode) -> u64 {
        self.datasets.get(&mode).map_or(0, |d| d.num_samples_processed())
    }

    pub fn update_num_samples_processed(&mut self, mode: ExecutionMode, num: u64) -> Result<u64> {
        Ok(self.dataset_mut(mode)?.update_num_samples_processed(num))
    }

    /// Copy this rank's columns of the current mini-batch into the
    /// activation buffer. `global_cols` is the batch's global width; which
    /// local columns exist follows from the matrix distribution.
    pub fn fetch_samples(
        &self,
        mode: ExecutionMode,
        activations: &mut DistMat,
        global_cols: usize,
    ) -> Result<()> {
        let ds = self.dataset(mode)?;
        let offset = ds.current_batch_offset();
        let n_local = activations.local_cols_of(global_cols);
        let cols: Vec<usize> = (0..n_local).map(|k| activations.global_col_of(k)).collect();
        let mut view = activations.view_cols_mut(global_cols);
        for (k, gc) in cols.into_iter().enumerate() {
            ds.reader().fetch_sample(offset + gc, view.column_mut(k))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Comm;
    use crate::data::SliceReader;
    use crate::MatrixFormat;
    use ndarray::prelude::*;
    use smallvec::smallvec;

    fn layer_with(samples: usize, mb: usize) -> InputLayer {
        let data = Array2::from_shape_fn((2, samples), |(i, j)| (10 * i + j) as f32);
        let labels = Array2::zeros((1, samples));
        let reader = SliceReader::new(data, labels, smallvec![2]).unwrap();
        let mut il = InputLayer::new();
        il.add_dataset(
            ExecutionMode::Training,
            Dataset::new(Box::new(reader), mb).unwrap(),
        )
        .unwrap();
        il
    }

    #[test]
    fn missing_mode_is_an_error() {
        let il = layer_with(4, 2);
        assert!(il.is_execution_mode_valid(ExecutionMode::Training));
        assert!(!il.is_execution_mode_valid(ExecutionMode::Testing));
        let err = il.dataset(ExecutionMode::Testing).unwrap_err();
        assert!(err.to_string().contains("testing"));
    }

    #[test]
    fn fetch_fills_batch_columns() {
        let comm = Comm::self_comm();
        let il = layer_with(5, 2);
        let mut act = DistMat::zeros(&comm, MatrixFormat::StarVc, 2, 2).unwrap();
        il.fetch_samples(ExecutionMode::Training, &mut act, 2).unwrap();
        // batch offset 0: columns 0 and 1
        assert_eq!(act.local()[[0, 0]], 0.0);
        assert_eq!(act.local()[[0, 1]], 1.0);
        assert_eq!(act.local()[[1, 1]], 11.0);
    }

    #[test]
    fn duplicate_dataset_rejected() {
        let mut il = layer_with(4, 2);
        let data = Array2::zeros((2, 4));
        let labels = Array2::zeros((1, 4));
        let reader = SliceReader::new(data, labels, smallvec![2]).unwrap();
        let err = il
            .add_dataset(
                ExecutionMode::Training,
                Dataset::new(Box::new(reader), 2).unwrap(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("already has"));
    }
}
