//! Layer graph structure.
//!
//! Layers live in an arena owned by the model; the graph holds their
//! parent/child edges by index and produces the frozen topological order the
//! driver walks forward (and, reversed, backward). Cycles and dangling ids
//! are configuration errors.

use anyhow::Result;
use smallvec::SmallVec;

use crate::grid_bail;

/// Index of a layer in the model's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(pub usize);

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

#[derive(Default)]
pub struct LayerGraph {
    parents: Vec<SmallVec<[usize; 2]>>,
    children: Vec<SmallVec<[usize; 2]>>,
    topo: Vec<usize>,
}

impl LayerGraph {
    pub fn new() -> LayerGraph {
        LayerGraph::default()
    }

    pub fn num_layers(&self) -> usize {
        self.parents.len()
    }

    pub fn add_node(&mut self) -> LayerId {
        self.parents.push(SmallVec::new());
        self.children.push(SmallVec::new());
        self.topo.clear();
        LayerId(self.parents.len() - 1)
    }

    pub fn add_edge(&mut self, parent: LayerId, child: LayerId) -> Result<()> {
        let n = self.num_layers();
        if parent.0 >= n || child.0 >= n {
            grid_bail!("edge {} -> {} references unknown layer (have {})", parent, child, n);
        }
        if parent == child {
            grid_bail!("self edge on {}", parent);
        }
        self.children[parent.0].push(child.0);
        self.parents[child.0].push(parent.0);
        self.topo.clear();
        Ok(())
    }

    pub fn parents_of(&self, id: LayerId) -> &[usize] {
        &self.parents[id.0]
    }

    pub fn children_of(&self, id: LayerId) -> &[usize] {
        &self.children[id.0]
    }

    /// Kahn's algorithm, smallest-index-first so the order is deterministic.
    /// Every layer appears after all of its parents.
    pub fn compute_topological_order(&self) -> Result<Vec<LayerId>> {
        let n = self.num_layers();
        let mut indegree: Vec<usize> = (0..n).map(|i| self.parents[i].len()).collect();
        let mut emitted = vec![false; n];
        let mut order = Vec::with_capacity(n);
        while order.len() < n {
            let next = (0..n).find(|&i| !emitted[i] && indegree[i] == 0);
            let Some(i) = next else {
                grid_bail!("layer graph has a cycle; {} of {} layers ordered", order.len(), n);
            };
            emitted[i] = true;
            order.push(LayerId(i));
            for &c in &self.children[i] {
                indegree[c] -= 1;
            }
        }
        Ok(order)
    }

    /// Compute and store the order. Called once when the model is set up.
    pub fn freeze(&mut self) -> Result<()> {
        self.topo = self.compute_topological_order()?.into_iter().map(|l| l.0).collect();
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        !self.topo.is_empty() || self.num_layers() == 0
    }

    /// Frozen forward order.
    pub fn order(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.topo.iter().map(|&i| LayerId(i))
    }

    /// Frozen backward order.
    pub fn reverse_order(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.topo.iter().rev().map(|&i| LayerId(i))
    }
}
