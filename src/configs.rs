//! Run configuration.
//!
//! Anything serde-serializable round-trips through ron; trainer settings are
//! a plain struct with defaults so experiment files only name what they
//! change.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub trait Configure: Send + Sync {
    fn config(&self) -> String;
    fn load_config(&mut self, config: &str) -> Result<()>;
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Configure for T {
    fn config(&self) -> String {
        ron::to_string(self).unwrap()
    }

    fn load_config(&mut self, config: &str) -> Result<()> {
        *self = ron::from_str(config).context(format!("Failed to load config {}", config))?;
        Ok(())
    }
}

/// Settings of one training run.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TrainerConfig {
    /// Global mini-batch size across the model's ranks.
    pub mini_batch_size: usize,
    pub num_epochs: usize,
    /// Ranks per model when the world is split into replicas.
    pub procs_per_model: usize,
    /// Where shared and local checkpoints go; none disables checkpointing.
    pub checkpoint_dir: Option<PathBuf>,
    /// Path prefix for activation dumps; none disables dumping.
    pub dump_basename: Option<String>,
}

impl Default for TrainerConfig {
    fn default() -> TrainerConfig {
        TrainerConfig {
            mini_batch_size: 32,
            num_epochs: 4,
            procs_per_model: 1,
            checkpoint_dir: None,
            dump_basename: None,
        }
    }
}
