//! System-wide configuration

use crate::consolidation::ConsolidationConfig;
use crate::error::{MemoryError, Result};
use crate::maintenance::MaintenanceConfig;
use crate::retrieval::RetrievalConfig;
use crate::transcript::TranscriptConfig;
use crate::working_memory::WorkingMemoryConfig;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything needed to open a [`crate::MemorySystem`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Directory holding `graph.db` and `transcripts.db`
    pub data_dir: PathBuf,
    /// Dimension of the hashing embedder
    pub embedding_dimension: usize,
    pub retrieval: RetrievalConfig,
    pub consolidation: ConsolidationConfig,
    pub working_memory: WorkingMemoryConfig,
    pub transcript: TranscriptConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./mnemos_data"),
            embedding_dimension: 384,
            retrieval: RetrievalConfig::default(),
            consolidation: ConsolidationConfig::default(),
            working_memory: WorkingMemoryConfig::default(),
            transcript: TranscriptConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Load from a JSON file; missing keys keep their defaults
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            MemoryError::Configuration(format!("{}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn graph_path(&self) -> PathBuf {
        self.data_dir.join("graph.db")
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.data_dir.join("transcripts.db")
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimension == 0 {
            return Err(MemoryError::Configuration(
                "embedding_dimension must be positive".into(),
            ));
        }
        if self.retrieval.default_top_k == 0 {
            return Err(MemoryError::Configuration("default_top_k must be positive".into()));
        }
        if self.consolidation.trigger_hour > 23 {
            return Err(MemoryError::Configuration(format!(
                "trigger_hour {} is not an hour of the day",
                self.consolidation.trigger_hour
            )));
        }
        if self.consolidation.chunk_size == 0 {
            return Err(MemoryError::Configuration("chunk_size must be positive".into()));
        }
        if self.working_memory.history_capacity == 0 {
            return Err(MemoryError::Configuration(
                "history_capacity must be positive".into(),
            ));
        }
        if self.transcript.session_timeout_secs <= 0 {
            return Err(MemoryError::Configuration(
                "session_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for memory config
pub struct MemoryConfigBuilder {
    config: MemoryConfig,
}

impl MemoryConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MemoryConfig::default(),
        }
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn embedding_dimension(mut self, dimension: usize) -> Self {
        self.config.embedding_dimension = dimension;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.config.retrieval.default_top_k = k;
        self
    }

    pub fn trigger_hour(mut self, hour: u32) -> Self {
        self.config.consolidation.trigger_hour = hour;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.consolidation.chunk_size = size;
        self
    }

    pub fn grounding_top_k(mut self, k: usize) -> Self {
        self.config.consolidation.grounding_top_k = k;
        self
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.working_memory.history_capacity = capacity;
        self
    }

    pub fn session_timeout_secs(mut self, secs: i64) -> Self {
        self.config.transcript.session_timeout_secs = secs;
        self
    }

    pub fn decay_after_pass(mut self, enabled: bool) -> Self {
        self.config.consolidation.decay_after_pass = enabled;
        self
    }

    pub fn maintenance(mut self, maintenance: MaintenanceConfig) -> Self {
        self.config.maintenance = maintenance;
        self
    }

    pub fn build(self) -> Result<MemoryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for MemoryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
