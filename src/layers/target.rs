//! Target layer: the label-side sink of the graph.
//!
//! A target layer never owns dataset state; every dataset and dimension
//! query is forwarded to its paired input layer, so the sample-reading and
//! label-reading ends of a mini-batch can never drift apart. The pairing is
//! an arena relation validated when the graph is frozen and re-validated on
//! every pointer-list round trip.

use anyhow::Result;

use crate::graph::LayerId;
use crate::layers::Layer;
use crate::matrix::DistMat;
use crate::{grid_bail, ExecutionMode};

pub struct TargetLayer {
    paired_input: LayerId,
    for_regression: bool,
}

impl TargetLayer {
    pub fn new(paired_input: LayerId, for_regression: bool) -> TargetLayer {
        TargetLayer {
            paired_input,
            for_regression,
        }
    }

    pub fn paired_input(&self) -> LayerId {
        self.paired_input
    }

    pub fn set_paired_input(&mut self, id: LayerId) {
        self.paired_input = id;
    }

    pub fn is_for_regression(&self) -> bool {
        self.for_regression
    }

    /// Copy this rank's label columns of the current mini-batch into the
    /// activation buffer (the ground truth). The batch position comes from
    /// the paired input layer's dataset.
    pub fn fetch_labels(
        &self,
        mode: ExecutionMode,
        paired: &Layer,
        activations: &mut DistMat,
        global_cols: usize,
    ) -> Result<()> {
        let il = paired.as_input().ok_or_else(|| {
            crate::grid_error!(
                "target layer paired with non-input layer \"{}\"",
                paired.name()
            )
        })?;
        let ds = il.dataset(mode)?;
        let offset = ds.current_batch_offset();
        let n_local = activations.local_cols_of(global_cols);
        let cols: Vec<usize> = (0..n_local).map(|k| activations.global_col_of(k)).collect();
        let mut view = activations.view_cols_mut(global_cols);
        for (k, gc) in cols.into_iter().enumerate() {
            if self.for_regression {
                ds.reader().fetch_sample(offset + gc, view.column_mut(k))?;
            } else {
                ds.reader().fetch_label(offset + gc, view.column_mut(k))?;
            }
        }
        Ok(())
    }

    /// Append the paired relation to a pointer list, mirroring
    /// [`set_layer_pointers`](Self::set_layer_pointers).
    pub fn get_layer_pointers(&self, mut base: Vec<LayerId>) -> Vec<LayerId> {
        base.push(self.paired_input);
        base
    }

    /// Re-attach the paired input from the back of a pointer list. The id
    /// must name an input layer in the arena; anything else is a fatal
    /// configuration error, never a silent bad reference.
    pub fn set_layer_pointers(
        &mut self,
        mut pointers: Vec<LayerId>,
        arena: &[Layer],
    ) -> Result<Vec<LayerId>> {
        let Some(last) = pointers.pop() else {
            grid_bail!("empty layer pointer list while re-attaching paired input layer");
        };
        let ok = arena.get(last.0).map_or(false, |l| l.is_input());
        if !ok {
            grid_bail!(
                "invalid layer pointer {} used to set paired input layer",
                last
            );
        }
        self.paired_input = last;
        Ok(pointers)
    }
}
