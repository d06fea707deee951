//! Data readers and per-mode datasets.
//!
//! A [`DataReader`] produces one sample (and its label) per column; the
//! input layer decides which global columns its rank owns. Concrete parsers
//! for on-disk formats live outside this crate; [`SliceReader`] serves
//! in-memory buffers and is what the tests use.

use anyhow::Result;
use ndarray::prelude::*;
use smallvec::SmallVec;

use crate::grid_bail;

pub type Dims = SmallVec<[usize; 4]>;

pub trait DataReader: Send {
    fn num_samples(&self) -> usize;

    /// Shape of one raw sample, e.g. [channels, height, width].
    fn data_dims(&self) -> Dims;

    fn linearized_data_size(&self) -> usize {
        self.data_dims().iter().product()
    }

    /// Length of one linearized label vector.
    fn linearized_label_size(&self) -> usize;

    /// Copy sample `index` into `out` (length = linearized data size).
    fn fetch_sample(&self, index: usize, out: ArrayViewMut1<'_, f32>) -> Result<()>;

    /// Copy the label of sample `index` into `out`.
    fn fetch_label(&self, index: usize, out: ArrayViewMut1<'_, f32>) -> Result<()>;
}

/// Reader over pre-linearized in-memory buffers, one sample per column.
pub struct SliceReader {
    samples: Array2<f32>,
    labels: Array2<f32>,
    data_dims: Dims,
}

impl SliceReader {
    pub fn new(samples: Array2<f32>, labels: Array2<f32>, data_dims: Dims) -> Result<SliceReader> {
        if samples.ncols() != labels.ncols() {
            grid_bail!(
                "sample count {} != label count {}",
                samples.ncols(),
                labels.ncols()
            );
        }
        let linearized: usize = data_dims.iter().product();
        if linearized != samples.nrows() {
            grid_bail!(
                "data dims {:?} linearize to {} but samples have {} rows",
                data_dims,
                linearized,
                samples.nrows()
            );
        }
        Ok(SliceReader {
            samples,
            labels,
            data_dims,
        })
    }
}

impl DataReader for SliceReader {
    fn num_samples(&self) -> usize {
        self.samples.ncols()
    }

    fn data_dims(&self) -> Dims {
        self.data_dims.clone()
    }

    fn linearized_label_size(&self) -> usize {
        self.labels.nrows()
    }

    fn fetch_sample(&self, index: usize, mut out: ArrayViewMut1<'_, f32>) -> Result<()> {
        if index >= self.num_samples() {
            grid_bail!("sample index {} out of range {}", index, self.num_samples());
        }
        out.assign(&self.samples.column(index));
        Ok(())
    }

    fn fetch_label(&self, index: usize, mut out: ArrayViewMut1<'_, f32>) -> Result<()> {
        if index >= self.num_samples() {
            grid_bail!("label index {} out of range {}", index, self.num_samples());
        }
        out.assign(&self.labels.column(index));
        Ok(())
    }
}

/// One dataset per execution mode: a reader plus epoch position and
/// samples-processed counters.
pub struct Dataset {
    reader: Box<dyn DataReader>,
    global_mini_batch_size: usize,
    cur_iteration: usize,
    num_samples_processed: u64,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("global_mini_batch_size", &self.global_mini_batch_size)
            .field("cur_iteration", &self.cur_iteration)
            .field("num_samples_processed", &self.num_samples_processed)
            .finish_non_exhaustive()
    }
}

impl Dataset {
    pub fn new(reader: Box<dyn DataReader>, global_mini_batch_size: usize) -> Result<Dataset> {
        if global_mini_batch_size == 0 {
            grid_bail!("mini-batch size must be positive");
        }
        if reader.num_samples() == 0 {
            grid_bail!("dataset has no samples");
        }
        Ok(Dataset {
            reader,
            global_mini_batch_size,
            cur_iteration: 0,
            num_samples_processed: 0,
        })
    }

    pub fn reader(&self) -> &dyn DataReader {
        &*self.reader
    }

    pub fn total_samples(&self) -> usize {
        self.reader.num_samples()
    }

    pub fn num_iterations_per_epoch(&self) -> usize {
        (self.total_samples() + self.global_mini_batch_size - 1) / self.global_mini_batch_size
    }

    pub fn global_mini_batch_size(&self) -> usize {
        self.global_mini_batch_size
    }

    /// Size of the epoch's final mini-batch; equals the configured size when
    /// it divides the sample count. Never larger than the configured size.
    pub fn global_last_mini_batch_size(&self) -> usize {
        let rem = self.total_samples() % self.global_mini_batch_size;
        if rem == 0 {
            self.global_mini_batch_size
        } else {
            rem
        }
    }

    /// Global size of the mini-batch at the current epoch position.
    pub fn current_global_mini_batch_size(&self) -> usize {
        if self.cur_iteration + 1 == self.num_iterations_per_epoch() {
            self.global_last_mini_batch_size()
        } else {
            self.global_mini_batch_size
        }
    }

    /// First global sample index of the current mini-batch.
    pub fn current_batch_offset(&self) -> usize {
        self.cur_iteration * self.global_mini_batch_size
    }

    /// Step to the next mini-batch, wrapping at the end of the epoch.
    pub fn advance(&mut self) {
        self.cur_iteration = (self.cur_iteration + 1) % self.num_iterations_per_epoch();
    }

    /// True at the start of an epoch, i.e. right after the position wrapped.
    pub fn at_new_epoch(&self) -> bool {
        self.cur_iteration == 0
    }

    pub fn update_num_samples_processed(&mut self, num: u64) -> u64 {
        self.num_samples_processed += num;
        self.num_samples_processed
    }

    pub fn num_samples_processed(&self) -> u64 {
        self.num_samples_processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn reader(samples: usize) -> Box<dyn DataReader> {
        let data = Array2::from_shape_fn((3, samples), |(i, j)| (i * samples + j) as f32);
        let labels = Array2::zeros((2, samples));
        Box::new(SliceReader::new(data, labels, smallvec![3]).unwrap())
    }

    #[test]
    fn mini_batch_geometry_with_short_final_batch() {
        let ds = Dataset::new(reader(10), 4).unwrap();
        assert_eq!(ds.num_iterations_per_epoch(), 3);
        assert_eq!(ds.global_mini_batch_size(), 4);
        assert_eq!(ds.global_last_mini_batch_size(), 2);
        assert!(ds.global_last_mini_batch_size() <= ds.global_mini_batch_size());
    }

    #[test]
    fn exact_division_keeps_full_last_batch() {
        let ds = Dataset::new(reader(8), 4).unwrap();
        assert_eq!(ds.num_iterations_per_epoch(), 2);
        assert_eq!(ds.global_last_mini_batch_size(), 4);
    }

    #[test]
    fn epoch_position_wraps() {
        let mut ds = Dataset::new(reader(10), 4).unwrap();
        assert!(ds.at_new_epoch());
        assert_eq!(ds.current_global_mini_batch_size(), 4);
        ds.advance();
        assert!(!ds.at_new_epoch());
        ds.advance();
        assert_eq!(ds.current_global_mini_batch_size(), 2);
        assert_eq!(ds.current_batch_offset(), 8);
        ds.advance();
        assert!(ds.at_new_epoch());
    }

    #[test]
    fn slice_reader_serves_columns() {
        let r = reader(4);
        let mut out = Array1::zeros(3);
        r.fetch_sample(2, out.view_mut()).unwrap();
        assert_eq!(out, ndarray::arr1(&[2.0, 6.0, 10.0]));
        assert!(r.fetch_sample(4, out.view_mut()).is_err());
    }
}
