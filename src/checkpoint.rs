//! Checkpoint persistence.
//!
//! State is written as typed records keyed by `(persist type, field name)`.
//! Shared checkpoints go through a [`Persist`] handle: only a model's rank 0
//! touches the files, and restored scalars travel to the other ranks by
//! broadcast, so a failed read can never leave ranks disagreeing. Per-rank
//! state (e.g. partitioned weights) goes through [`LocalCheckpoint`], one
//! file per rank. Read and write paths surface success flags; the policy on
//! failure (retry, abort, warn) belongs to the caller.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::grid_bail;

/// Which record file a field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistType {
    Train,
    Model,
}

impl PersistType {
    fn file_name(self) -> &'static str {
        match self {
            PersistType::Train => "train.bin",
            PersistType::Model => "model.bin",
        }
    }
}

#[derive(Debug, Clone)]
enum Record {
    F64(f64),
    U64(u64),
    Bytes(Vec<u8>),
}

const TAG_F64: u8 = 1;
const TAG_U64: u8 = 2;
const TAG_BYTES: u8 = 3;

/// An ordered set of named records with a little-endian binary form.
#[derive(Default)]
struct RecordStream {
    order: Vec<String>,
    records: HashMap<String, Record>,
}

impl RecordStream {
    fn put(&mut self, name: &str, record: Record) {
        if !self.records.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.records.insert(name.to_string(), record);
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for name in &self.order {
            let record = &self.records[name];
            let tag = match record {
                Record::F64(_) => TAG_F64,
                Record::U64(_) => TAG_U64,
                Record::Bytes(_) => TAG_BYTES,
            };
            out.write_u8(tag)?;
            out.write_u16::<LittleEndian>(name.len() as u16)?;
            out.write_all(name.as_bytes())?;
            match record {
                Record::F64(v) => out.write_f64::<LittleEndian>(*v)?,
                Record::U64(v) => out.write_u64::<LittleEndian>(*v)?,
                Record::Bytes(b) => {
                    out.write_u64::<LittleEndian>(b.len() as u64)?;
                    out.write_all(b)?;
                }
            }
        }
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<RecordStream> {
        let mut stream = RecordStream::default();
        let mut cur = Cursor::new(bytes);
        while (cur.position() as usize) < bytes.len() {
            let tag = cur.read_u8()?;
            let name_len = cur.read_u16::<LittleEndian>()? as usize;
            let mut name = vec![0u8; name_len];
            cur.read_exact(&mut name)?;
            let name = String::from_utf8(name).context("corrupt record name")?;
            let record = match tag {
                TAG_F64 => Record::F64(cur.read_f64::<LittleEndian>()?),
                TAG_U64 => Record::U64(cur.read_u64::<LittleEndian>()?),
                TAG_BYTES => {
                    let len = cur.read_u64::<LittleEndian>()? as usize;
                    let mut b = vec![0u8; len];
                    cur.read_exact(&mut b)?;
                    Record::Bytes(b)
                }
                t => grid_bail!("unknown checkpoint record tag {}", t),
            };
            stream.put(&name, record);
        }
        Ok(stream)
    }
}

/// Shared persistence handle over a checkpoint directory.
pub struct Persist {
    dir: PathBuf,
    streams: HashMap<PersistType, RecordStream>,
}

impl Persist {
    /// Handle for writing a fresh checkpoint.
    pub fn new(dir: &Path) -> Persist {
        Persist {
            dir: dir.to_path_buf(),
            streams: HashMap::new(),
        }
    }

    /// Handle over an existing checkpoint directory. Missing files fail
    /// individual reads, not the open.
    pub fn open(dir: &Path) -> Persist {
        let mut p = Persist::new(dir);
        for pt in [PersistType::Train, PersistType::Model] {
            let path = dir.join(pt.file_name());
            if let Ok(bytes) = std::fs::read(&path) {
                if let Ok(stream) = RecordStream::decode(&bytes) {
                    p.streams.insert(pt, stream);
                }
            }
        }
        p
    }

    pub fn write_f64(&mut self, pt: PersistType, name: &str, v: f64) {
        self.streams.entry(pt).or_default().put(name, Record::F64(v));
    }

    pub fn write_u64(&mut self, pt: PersistType, name: &str, v: u64) {
        self.streams.entry(pt).or_default().put(name, Record::U64(v));
    }

    pub fn write_bytes(&mut self, pt: PersistType, name: &str, bytes: Vec<u8>) {
        self.streams
            .entry(pt)
            .or_default()
            .put(name, Record::Bytes(bytes));
    }

    pub fn read_f64(&self, pt: PersistType, name: &str) -> Option<f64> {
        match self.streams.get(&pt)?.records.get(name)? {
            Record::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn read_u64(&self, pt: PersistType, name: &str) -> Option<u64> {
        match self.streams.get(&pt)?.records.get(name)? {
            Record::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn read_bytes(&self, pt: PersistType, name: &str) -> Option<&[u8]> {
        match self.streams.get(&pt)?.records.get(name)? {
            Record::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Flush every stream to disk. False means the checkpoint is not
    /// usable; nothing here retries.
    pub fn save(&self) -> bool {
        if std::fs::create_dir_all(&self.dir).is_err() {
            return false;
        }
        for (pt, stream) in &self.streams {
            let Ok(bytes) = stream.encode() else {
                return false;
            };
            if std::fs::write(self.dir.join(pt.file_name()), bytes).is_err() {
                return false;
            }
        }
        true
    }
}

/// Per-rank checkpoint file, the local flavor of the protocol.
pub struct LocalCheckpoint {
    path: PathBuf,
    stream: RecordStream,
}

impl LocalCheckpoint {
    pub fn new(dir: &Path, rank: usize) -> LocalCheckpoint {
        LocalCheckpoint {
            path: dir.join(format!("rank{}.bin", rank)),
            stream: RecordStream::default(),
        }
    }

    pub fn open(dir: &Path, rank: usize) -> Result<LocalCheckpoint> {
        let path = dir.join(format!("rank{}.bin", rank));
        let bytes = std::fs::read(&path)
            .with_context(|| format!("no local checkpoint at {}", path.display()))?;
        Ok(LocalCheckpoint {
            path,
            stream: RecordStream::decode(&bytes)?,
        })
    }

    pub fn write_f64(&mut self, name: &str, v: f64) {
        self.stream.put(name, Record::F64(v));
    }

    pub fn write_u64(&mut self, name: &str, v: u64) {
        self.stream.put(name, Record::U64(v));
    }

    pub fn write_bytes(&mut self, name: &str, bytes: Vec<u8>) {
        self.stream.put(name, Record::Bytes(bytes));
    }

    pub fn read_f64(&self, name: &str) -> Option<f64> {
        match self.stream.records.get(name)? {
            Record::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn read_u64(&self, name: &str) -> Option<u64> {
        match self.stream.records.get(name)? {
            Record::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn read_bytes(&self, name: &str) -> Option<&[u8]> {
        match self.stream.records.get(name)? {
            Record::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn save(&self) -> bool {
        if let Some(parent) = self.path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return false;
            }
        }
        match self.stream.encode() {
            Ok(bytes) => std::fs::write(&self.path, bytes).is_ok(),
            Err(_) => false,
        }
    }
}

/// Pack an f32 slice for a bytes record.
pub fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn bytes_to_f32s(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        grid_bail!("byte record length {} is not a multiple of 4", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
