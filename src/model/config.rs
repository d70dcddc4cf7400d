//! Model hyperparameters.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Q2PError, Result};

/// Construction parameters for [`crate::Q2P`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Q2PConfig {
    pub num_entities: usize,
    pub num_relations: usize,
    pub embedding_dim: usize,
    #[serde(default = "default_num_particles")]
    pub num_particles: usize,
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f32,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    /// Seed for parameter initialisation.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_num_particles() -> usize {
    5
}

fn default_label_smoothing() -> f32 {
    0.1
}

fn default_dropout() -> f32 {
    0.3
}

fn default_seed() -> u64 {
    42
}

impl Q2PConfig {
    /// Config with default particle count, smoothing, dropout and seed.
    pub fn new(num_entities: usize, num_relations: usize, embedding_dim: usize) -> Self {
        Self {
            num_entities,
            num_relations,
            embedding_dim,
            num_particles: default_num_particles(),
            label_smoothing: default_label_smoothing(),
            dropout: default_dropout(),
            seed: default_seed(),
        }
    }

    pub fn with_particles(mut self, num_particles: usize) -> Self {
        self.num_particles = num_particles;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_label_smoothing(mut self, label_smoothing: f32) -> Self {
        self.label_smoothing = label_smoothing;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("num_entities", self.num_entities),
            ("num_relations", self.num_relations),
            ("embedding_dim", self.embedding_dim),
            ("num_particles", self.num_particles),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Q2PError::Config(format!("{} must be positive", name)));
            }
        }
        // ids are looked up as u32 tensors
        if self.num_entities > u32::MAX as usize || self.num_relations > u32::MAX as usize {
            return Err(Q2PError::Config("table sizes must fit in u32".into()));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(Q2PError::Config(format!(
                "label_smoothing must be in [0, 1), got {}",
                self.label_smoothing
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Q2PError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}
