//! Process grid and communicator.
//!
//! Ranks are cooperating workers joined by dedicated per-pair channels; the
//! collectives are blocking and assume every rank reaches them in the same
//! order, which the model driver guarantees by construction (all ranks run
//! the same mini-batch at the same step). A world of ranks can be split into
//! equally sized model groups; reductions and broadcasts stay inside one
//! model, gathers fan in across model masters for reporting.

use anyhow::{Context, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::grid_bail;

/// Message payload moved between ranks.
#[derive(Debug, Clone)]
pub enum Payload {
    F64(Vec<f64>),
    U64(Vec<u64>),
    Bytes(Vec<u8>),
}

/// One rank's endpoint into the grid: a sender towards every rank and a
/// receiver from every rank. Channels are per ordered pair, so traffic from
/// different peers never interleaves.
#[derive(Clone)]
pub struct GridPort {
    rank: usize,
    size: usize,
    tx: Vec<Sender<Payload>>,
    rx: Vec<Receiver<Payload>>,
}

/// Build the fully connected grid, one port per rank. Ports are `Send` and
/// are handed to rank threads.
pub fn new_grid(size: usize) -> Vec<GridPort> {
    assert!(size > 0, "grid must have at least one rank");
    let mut senders: Vec<Vec<Option<Sender<Payload>>>> = vec![Vec::new(); size];
    let mut receivers: Vec<Vec<Option<Receiver<Payload>>>> = vec![Vec::new(); size];
    for i in 0..size {
        senders[i] = (0..size).map(|_| None).collect();
        receivers[i] = (0..size).map(|_| None).collect();
    }
    for from in 0..size {
        for to in 0..size {
            let (s, r) = unbounded();
            senders[from][to] = Some(s);
            receivers[to][from] = Some(r);
        }
    }
    senders
        .into_iter()
        .zip(receivers)
        .enumerate()
        .map(|(rank, (tx, rx))| GridPort {
            rank,
            size,
            tx: tx.into_iter().map(Option::unwrap).collect(),
            rx: rx.into_iter().map(Option::unwrap).collect(),
        })
        .collect()
}

impl GridPort {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn send(&self, to: usize, payload: Payload) -> Result<()> {
        self.tx[to]
            .send(payload)
            .with_context(|| format!("rank {} failed to send to rank {}", self.rank, to))
    }

    fn recv(&self, from: usize) -> Result<Payload> {
        self.rx[from]
            .recv()
            .with_context(|| format!("rank {} failed to receive from rank {}", self.rank, from))
    }
}

/// Communicator over a grid, optionally split into model groups.
///
/// World rank `r` belongs to model `r / procs_per_model` with in-model rank
/// `r % procs_per_model`. Cloning shares the underlying channels; a clone is
/// only meant to be driven from its own rank's thread.
#[derive(Clone)]
pub struct Comm {
    port: GridPort,
    procs_per_model: usize,
}

impl Comm {
    /// Every rank in one model.
    pub fn new(port: GridPort) -> Comm {
        let procs = port.size;
        Comm {
            port,
            procs_per_model: procs,
        }
    }

    /// A communicator for a single-process world. Collectives degenerate to
    /// local no-ops.
    pub fn self_comm() -> Comm {
        Comm::new(new_grid(1).pop().unwrap())
    }

    /// Partition the world into models of `procs_per_model` ranks each.
    pub fn split_models(port: GridPort, procs_per_model: usize) -> Result<Comm> {
        if procs_per_model == 0 || port.size % procs_per_model != 0 {
            grid_bail!(
                "cannot split {} ranks into models of {} ranks",
                port.size,
                procs_per_model
            );
        }
        Ok(Comm {
            port,
            procs_per_model,
        })
    }

    pub fn world_rank(&self) -> usize {
        self.port.rank
    }

    pub fn world_size(&self) -> usize {
        self.port.size
    }

    pub fn get_procs_per_model(&self) -> usize {
        self.procs_per_model
    }

    pub fn get_num_models(&self) -> usize {
        self.port.size / self.procs_per_model
    }

    pub fn get_model_rank(&self) -> usize {
        self.port.rank / self.procs_per_model
    }

    pub fn get_rank_in_model(&self) -> usize {
        self.port.rank % self.procs_per_model
    }

    pub fn am_world_master(&self) -> bool {
        self.port.rank == 0
    }

    pub fn am_model_master(&self) -> bool {
        self.get_rank_in_model() == 0
    }

    pub fn get_world_master(&self) -> usize {
        0
    }

    fn world_rank_of(&self, model: usize, rank_in_model: usize) -> usize {
        model * self.procs_per_model + rank_in_model
    }

    fn model_master_world_rank(&self) -> usize {
        self.world_rank_of(self.get_model_rank(), 0)
    }

    /// Broadcast from the model master to every rank of this model.
    pub fn model_broadcast(&self, payload: &mut Payload) -> Result<()> {
        if self.procs_per_model == 1 {
            return Ok(());
        }
        let model = self.get_model_rank();
        if self.am_model_master() {
            for r in 1..self.procs_per_model {
                self.port
                    .send(self.world_rank_of(model, r), payload.clone())?;
            }
        } else {
            *payload = self.port.recv(self.model_master_world_rank())?;
        }
        Ok(())
    }

    pub fn model_broadcast_f64(&self, buf: &mut Vec<f64>) -> Result<()> {
        let mut payload = Payload::F64(std::mem::take(buf));
        self.model_broadcast(&mut payload)?;
        match payload {
            Payload::F64(v) => *buf = v,
            other => grid_bail!("expected f64 broadcast payload, got {:?}", other),
        }
        Ok(())
    }

    pub fn model_broadcast_u64(&self, buf: &mut Vec<u64>) -> Result<()> {
        let mut payload = Payload::U64(std::mem::take(buf));
        self.model_broadcast(&mut payload)?;
        match payload {
            Payload::U64(v) => *buf = v,
            other => grid_bail!("expected u64 broadcast payload, got {:?}", other),
        }
        Ok(())
    }

    /// Elementwise sum over every rank of this model; all ranks end up with
    /// the reduced values.
    pub fn model_allreduce_sum(&self, vals: &mut [f64]) -> Result<()> {
        if self.procs_per_model == 1 {
            return Ok(());
        }
        let model = self.get_model_rank();
        if self.am_model_master() {
            let mut acc = vals.to_vec();
            for r in 1..self.procs_per_model {
                match self.port.recv(self.world_rank_of(model, r))? {
                    Payload::F64(part) => {
                        if part.len() != acc.len() {
                            grid_bail!(
                                "allreduce length mismatch: {} vs {}",
                                part.len(),
                                acc.len()
                            );
                        }
                        for (a, p) in acc.iter_mut().zip(part) {
                            *a += p;
                        }
                    }
                    other => grid_bail!("expected f64 allreduce payload, got {:?}", other),
                }
            }
            vals.copy_from_slice(&acc);
            let mut payload = Payload::F64(acc);
            self.model_broadcast(&mut payload)?;
        } else {
            self.port
                .send(self.model_master_world_rank(), Payload::F64(vals.to_vec()))?;
            let mut payload = Payload::F64(Vec::new());
            self.model_broadcast(&mut payload)?;
            match payload {
                Payload::F64(v) => vals.copy_from_slice(&v),
                other => grid_bail!("expected f64 allreduce payload, got {:?}", other),
            }
        }
        Ok(())
    }

    /// Gather one scalar per model to the world master. Only model masters
    /// participate; the world master receives values in model order.
    pub fn intermodel_gather(&self, scalar: f64) -> Result<Vec<f64>> {
        debug_assert!(self.am_world_master());
        let mut out = vec![0.0; self.get_num_models()];
        out[0] = scalar;
        for model in 1..self.get_num_models() {
            match self.port.recv(self.world_rank_of(model, 0))? {
                Payload::F64(v) if v.len() == 1 => out[model] = v[0],
                other => grid_bail!("expected scalar gather payload, got {:?}", other),
            }
        }
        Ok(out)
    }

    /// Non-world-master side of [`intermodel_gather`](Self::intermodel_gather).
    pub fn intermodel_gather_to(&self, scalar: f64, root: usize) -> Result<()> {
        debug_assert!(self.am_model_master() && !self.am_world_master());
        self.port.send(root, Payload::F64(vec![scalar]))
    }

    /// Gather the model's column-partitioned pieces of a buffer to the model
    /// master. `pieces[r]` is rank r's contribution; non-masters get `None`.
    pub fn model_gather_f64(&self, local: Vec<f64>) -> Result<Option<Vec<Vec<f64>>>> {
        if self.procs_per_model == 1 {
            return Ok(Some(vec![local]));
        }
        let model = self.get_model_rank();
        if self.am_model_master() {
            let mut pieces = vec![local];
            for r in 1..self.procs_per_model {
                match self.port.recv(self.world_rank_of(model, r))? {
                    Payload::F64(v) => pieces.push(v),
                    other => grid_bail!("expected f64 gather payload, got {:?}", other),
                }
            }
            Ok(Some(pieces))
        } else {
            self.port
                .send(self.model_master_world_rank(), Payload::F64(local))?;
            Ok(None)
        }
    }

    /// Block until every rank in the world has arrived.
    pub fn world_barrier(&self) -> Result<()> {
        if self.port.size == 1 {
            return Ok(());
        }
        if self.am_world_master() {
            for r in 1..self.port.size {
                self.port.recv(r)?;
            }
            for r in 1..self.port.size {
                self.port.send(r, Payload::Bytes(Vec::new()))?;
            }
        } else {
            self.port.send(0, Payload::Bytes(Vec::new()))?;
            self.port.recv(0)?;
        }
        Ok(())
    }
}

/// Logger carrying the communicator identity. Replaces ambient rank globals:
/// anything that wants rank-tagged output takes one of these.
#[derive(Clone)]
pub struct RankLogger {
    model_rank: usize,
    rank_in_model: usize,
}

impl RankLogger {
    pub fn for_comm(comm: &Comm) -> RankLogger {
        RankLogger {
            model_rank: comm.get_model_rank(),
            rank_in_model: comm.get_rank_in_model(),
        }
    }

    pub fn info(&self, msg: &str) {
        tracing::info!(model = self.model_rank, rank = self.rank_in_model, "{}", msg);
    }

    pub fn debug(&self, msg: &str) {
        tracing::debug!(model = self.model_rank, rank = self.rank_in_model, "{}", msg);
    }

    pub fn warn(&self, msg: &str) {
        tracing::warn!(model = self.model_rank, rank = self.rank_in_model, "{}", msg);
    }
}
