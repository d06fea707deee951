//! Partitioned 2-D matrices.
//!
//! A [`DistMat`] holds the local partition of a globally sized matrix, with
//! the partitioning decided by its [`MatrixFormat`]. Partitioned dimensions
//! are distributed cyclically (global column `j` of a column-partitioned
//! matrix lives on rank `j % p` at local index `j / p`), which keeps the
//! leading `m` global columns aligned with the leading local columns of every
//! rank when a mini-batch shrinks. Views over those leading columns are
//! re-derived each step by the driver and never stored.

use anyhow::Result;
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand::prelude::*;
use rand_distr::Normal;

use crate::comm::Comm;
use crate::{grid_bail, EvalType, MatrixFormat};

/// Count of indices below `n` owned by `idx` under a cyclic split into
/// `parts` pieces.
fn cyclic_share(n: usize, parts: usize, idx: usize) -> usize {
    if parts == 0 || idx >= parts {
        return 0;
    }
    (n + parts - 1 - idx) / parts
}

/// Nearly square process grid for two-dimensionally partitioned formats.
fn model_grid_dims(procs: usize) -> (usize, usize) {
    let mut h = 1;
    for d in 1..=procs {
        if d * d > procs {
            break;
        }
        if procs % d == 0 {
            h = d;
        }
    }
    (h, procs / h)
}

/// How each dimension of a format is split: (parts, this rank's index).
fn partition_of(format: MatrixFormat, procs: usize, rank: usize) -> Result<((usize, usize), (usize, usize))> {
    match format {
        MatrixFormat::StarStar => Ok(((1, 0), (1, 0))),
        MatrixFormat::CircCirc => {
            if rank == 0 {
                Ok(((1, 0), (1, 0)))
            } else {
                // non-root ranks hold nothing
                Ok(((0, 0), (0, 0)))
            }
        }
        MatrixFormat::StarVc => Ok(((1, 0), (procs, rank))),
        MatrixFormat::McStar => Ok(((procs, rank), (1, 0))),
        MatrixFormat::McMr => {
            let (gh, gw) = model_grid_dims(procs);
            Ok(((gh, rank % gh), (gw, rank / gh)))
        }
        MatrixFormat::Invalid => grid_bail!("cannot partition a matrix with an invalid format"),
    }
}

/// The local partition of a globally `height x width` matrix.
pub struct DistMat {
    format: MatrixFormat,
    global_height: usize,
    global_width: usize,
    row_split: (usize, usize),
    col_split: (usize, usize),
    local: Array2<f32>,
    comm: Comm,
}

impl std::fmt::Debug for DistMat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DistMat {{ {:?}, global {} x {}, local {} x {} }}",
            self.format,
            self.global_height,
            self.global_width,
            self.local.nrows(),
            self.local.ncols()
        )
    }
}

impl DistMat {
    pub fn zeros(
        comm: &Comm,
        format: MatrixFormat,
        height: usize,
        width: usize,
    ) -> Result<DistMat> {
        let procs = comm.get_procs_per_model();
        let rank = comm.get_rank_in_model();
        let (row_split, col_split) = partition_of(format, procs, rank)?;
        let local_h = cyclic_share(height, row_split.0, row_split.1);
        let local_w = cyclic_share(width, col_split.0, col_split.1);
        Ok(DistMat {
            format,
            global_height: height,
            global_width: width,
            row_split,
            col_split,
            local: Array2::zeros((local_h, local_w)),
            comm: comm.clone(),
        })
    }

    /// Gaussian init. The seed is shared across ranks so replicated
    /// partitions come out identical; partitioned formats perturb the seed
    /// with the rank so pieces differ.
    pub fn gaussian(
        comm: &Comm,
        format: MatrixFormat,
        height: usize,
        width: usize,
        mean: f32,
        stdev: f32,
        seed: u64,
    ) -> Result<DistMat> {
        let mut mat = DistMat::zeros(comm, format, height, width)?;
        let rank_salt = if mat.is_replicated() {
            0
        } else {
            comm.get_rank_in_model() as u64 + 1
        };
        let mut rng = StdRng::seed_from_u64(seed ^ (rank_salt << 32));
        let dist = Normal::new(mean, stdev).map_err(anyhow::Error::msg)?;
        mat.local = Array2::random_using(mat.local.raw_dim(), dist, &mut rng);
        Ok(mat)
    }

    /// Scatter a globally materialized matrix: every rank keeps its slice.
    pub fn from_global(comm: &Comm, format: MatrixFormat, global: &Array2<f32>) -> Result<DistMat> {
        let mut mat = DistMat::zeros(comm, format, global.nrows(), global.ncols())?;
        let (rp, ri) = mat.row_split;
        let (cp, ci) = mat.col_split;
        for li in 0..mat.local.nrows() {
            for lj in 0..mat.local.ncols() {
                let gi = if rp <= 1 { li } else { li * rp + ri };
                let gj = if cp <= 1 { lj } else { lj * cp + ci };
                mat.local[[li, lj]] = global[[gi, gj]];
            }
        }
        Ok(mat)
    }

    pub fn format(&self) -> MatrixFormat {
        self.format
    }

    pub fn global_dims(&self) -> (usize, usize) {
        (self.global_height, self.global_width)
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    /// True when every rank of the model holds the full matrix.
    pub fn is_replicated(&self) -> bool {
        self.row_split.0 == 1 && self.col_split.0 == 1 && self.format != MatrixFormat::CircCirc
    }

    pub fn local(&self) -> ArrayView2<'_, f32> {
        self.local.view()
    }

    pub fn local_mut(&mut self) -> ArrayViewMut2<'_, f32> {
        self.local.view_mut()
    }

    /// This rank's share of the leading `global_cols` columns.
    pub fn local_cols_of(&self, global_cols: usize) -> usize {
        cyclic_share(global_cols, self.col_split.0, self.col_split.1)
    }

    /// Global column index backing local column `k`.
    pub fn global_col_of(&self, k: usize) -> usize {
        if self.col_split.0 <= 1 {
            k
        } else {
            k * self.col_split.0 + self.col_split.1
        }
    }

    /// Non-owning view of the leading local columns that back the leading
    /// `global_cols` global columns.
    pub fn view_cols(&self, global_cols: usize) -> ArrayView2<'_, f32> {
        let w = self.local_cols_of(global_cols);
        self.local.slice(s![.., ..w])
    }

    pub fn view_cols_mut(&mut self, global_cols: usize) -> ArrayViewMut2<'_, f32> {
        let w = self.local_cols_of(global_cols);
        self.local.slice_mut(s![.., ..w])
    }

    /// Read-only view paired with the distribution info needed for global
    /// statistics.
    pub fn dist_view(&self, global_cols: usize) -> DistView<'_> {
        DistView {
            data: self.view_cols(global_cols),
            replicated: self.is_replicated(),
            comm: &self.comm,
        }
    }

    /// Add `alpha * other` into this matrix (same format and dims).
    pub fn scaled_add(&mut self, alpha: f32, other: &DistMat) -> Result<()> {
        if self.format != other.format || self.local.dim() != other.local.dim() {
            grid_bail!(
                "scaled_add on mismatched matrices: {:?} vs {:?}",
                self,
                other
            );
        }
        self.local.scaled_add(alpha, &other.local);
        Ok(())
    }

    pub fn fill(&mut self, v: f32) {
        self.local.fill(v);
    }

    /// Write the global matrix as plain text, one row per line, entries
    /// space-separated. The model master assembles partitions and writes;
    /// other ranks just contribute their piece.
    pub fn write_ascii(&self, path: &std::path::Path) -> Result<()> {
        use std::io::Write;

        let global = if self.is_replicated() {
            if !self.comm.am_model_master() {
                return Ok(());
            }
            self.local.clone()
        } else {
            let flat: Vec<f64> = self.local.iter().map(|&v| v as f64).collect();
            match self.comm.model_gather_f64(flat)? {
                None => return Ok(()),
                Some(pieces) => {
                    let mut global =
                        Array2::<f32>::zeros((self.global_height, self.global_width));
                    let procs = self.comm.get_procs_per_model();
                    for (r, piece) in pieces.into_iter().enumerate() {
                        let (row_split, col_split) = partition_of(self.format, procs, r)?;
                        let lh = cyclic_share(self.global_height, row_split.0, row_split.1);
                        let lw = cyclic_share(self.global_width, col_split.0, col_split.1);
                        for li in 0..lh {
                            for lj in 0..lw {
                                let gi = if row_split.0 <= 1 { li } else { li * row_split.0 + row_split.1 };
                                let gj = if col_split.0 <= 1 { lj } else { lj * col_split.0 + col_split.1 };
                                global[[gi, gj]] = piece[li * lw + lj] as f32;
                            }
                        }
                    }
                    global
                }
            }
        };

        let mut file = std::fs::File::create(path)?;
        for row in global.rows() {
            let line = itertools::Itertools::join(&mut row.iter().map(|v| v.to_string()), " ");
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }
}

/// A mini-batch-sized view plus what is needed to aggregate over the global
/// entry set.
pub struct DistView<'a> {
    pub data: ArrayView2<'a, f32>,
    replicated: bool,
    comm: &'a Comm,
}

impl<'a> DistView<'a> {
    /// Mean and standard deviation over the global entries.
    pub fn entrywise_mean_and_stdev(&self) -> Result<(EvalType, EvalType)> {
        let mut acc = [0.0f64; 3];
        for &v in self.data.iter() {
            acc[0] += v as f64;
            acc[1] += (v as f64) * (v as f64);
        }
        acc[2] = self.data.len() as f64;
        if !self.replicated {
            self.comm.model_allreduce_sum(&mut acc)?;
        }
        let mean = acc[0] / acc[2];
        let var = (acc[1] / acc[2] - mean * mean).max(0.0);
        Ok((mean, var.sqrt()))
    }

    /// Mean over the global entries.
    pub fn entrywise_mean(&self) -> Result<EvalType> {
        Ok(self.entrywise_mean_and_stdev()?.0)
    }

    /// Global entrywise mean of `f(a, b)` over two aligned views.
    pub fn mean_with<F: Fn(f32, f32) -> f64>(&self, other: &DistView<'_>, f: F) -> Result<EvalType> {
        let mut acc = [0.0f64; 2];
        for (&a, &b) in self.data.iter().zip(other.data.iter()) {
            acc[0] += f(a, b);
        }
        acc[1] = self.data.len() as f64;
        if !self.replicated {
            self.comm.model_allreduce_sum(&mut acc)?;
        }
        Ok(acc[0] / acc[1])
    }

    pub fn len_local(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::new_grid;

    #[test]
    fn cyclic_share_counts() {
        // 10 columns over 3 ranks: 4, 3, 3
        assert_eq!(cyclic_share(10, 3, 0), 4);
        assert_eq!(cyclic_share(10, 3, 1), 3);
        assert_eq!(cyclic_share(10, 3, 2), 3);
        assert_eq!(cyclic_share(5, 1, 0), 5);
    }

    #[test]
    fn grid_dims_nearly_square() {
        assert_eq!(model_grid_dims(1), (1, 1));
        assert_eq!(model_grid_dims(4), (2, 2));
        assert_eq!(model_grid_dims(6), (2, 3));
        assert_eq!(model_grid_dims(7), (1, 7));
    }

    #[test]
    fn replicated_matrix_holds_everything() {
        let comm = Comm::self_comm();
        let m = DistMat::zeros(&comm, MatrixFormat::StarStar, 3, 5).unwrap();
        assert_eq!(m.local().dim(), (3, 5));
        assert!(m.is_replicated());
        assert_eq!(m.local_cols_of(2), 2);
    }

    #[test]
    fn star_vc_partitions_columns_cyclically() {
        let ports = new_grid(2);
        let handles: Vec<_> = ports
            .into_iter()
            .map(|port| {
                std::thread::spawn(move || {
                    let comm = Comm::new(port);
                    let global =
                        Array2::from_shape_fn((2, 6), |(i, j)| (i * 6 + j) as f32);
                    let m = DistMat::from_global(&comm, MatrixFormat::StarVc, &global).unwrap();
                    assert_eq!(m.local().dim(), (2, 3));
                    // shrinking to 5 global columns: rank 0 keeps 3, rank 1 keeps 2
                    let want = if comm.get_rank_in_model() == 0 { 3 } else { 2 };
                    assert_eq!(m.local_cols_of(5), want);
                    // local col 1 backs global col 1*2+rank
                    assert_eq!(m.global_col_of(1), 2 + comm.get_rank_in_model());
                    (m.view_cols(5).ncols(), m.local()[[0, 0]])
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], (3, 0.0)); // global col 0
        assert_eq!(results[1], (2, 1.0)); // global col 1
    }

    #[test]
    fn global_stats_agree_across_partitions() {
        let global = Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as f32);
        let flat: Vec<f64> = global.iter().map(|&v| v as f64).collect();
        let n = flat.len() as f64;
        let mean = flat.iter().sum::<f64>() / n;
        let var = flat.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;

        let ports = new_grid(2);
        let g2 = global.clone();
        let handles: Vec<_> = ports
            .into_iter()
            .map(|port| {
                let global = g2.clone();
                std::thread::spawn(move || {
                    let comm = Comm::new(port);
                    let m = DistMat::from_global(&comm, MatrixFormat::StarVc, &global).unwrap();
                    m.dist_view(4).entrywise_mean_and_stdev().unwrap()
                })
            })
            .collect();
        for h in handles {
            let (m, s) = h.join().unwrap();
            assert!((m - mean).abs() < 1e-9);
            assert!((s - var.sqrt()).abs() < 1e-9);
        }
    }

    #[test]
    fn write_ascii_round_trips_partitioned_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mat.txt");
        let global = Array2::from_shape_fn((2, 4), |(i, j)| (10 * i + j) as f32);

        let ports = new_grid(2);
        let handles: Vec<_> = ports
            .into_iter()
            .map(|port| {
                let global = global.clone();
                let path = path.clone();
                std::thread::spawn(move || {
                    let comm = Comm::new(port);
                    let m = DistMat::from_global(&comm, MatrixFormat::StarVc, &global).unwrap();
                    m.write_ascii(&path).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], "0 1 2 3");
        assert_eq!(rows[1], "10 11 12 13");
    }
}
