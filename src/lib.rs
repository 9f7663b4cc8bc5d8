//! # Mnemos - Working Memory and Context Graph for Conversational Agents
//!
//! A per-session working-memory buffer sits in front of a persistent graph of
//! long-term memories organized by context (experience, knowledge,
//! relationship, current). Recall merges both into one prompt block; a
//! background pipeline folds transcripts into the graph.

pub mod clock;
pub mod config;
pub mod consolidation;
pub mod embedding;
pub mod error;
pub mod extraction;
pub mod graph_store;
pub mod maintenance;
pub mod manager;
pub mod proposal;
pub mod relationship;
pub mod retrieval;
pub mod retry;
pub mod store;
pub mod transcript;
pub mod types;
pub mod vector_search;
pub mod working_memory;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{MemoryConfig, MemoryConfigBuilder};
pub use consolidation::{
    ApplySummary, ChunkOutcome, ChunkReport, ConsolidationConfig, ConsolidationPipeline,
    ConsolidationState, PassReport, TickReport,
};
pub use embedding::{EmbeddingProvider, HashEmbeddingProvider};
pub use error::{MemoryError, Result};
pub use extraction::{CommandExtractor, Extractor};
pub use graph_store::{GraphStats, GraphStore, HealthStatus, ScoredNode, VectorIndex};
pub use maintenance::{MaintenanceConfig, MaintenanceConfigBuilder, MaintenanceReport};
pub use manager::{render_long_term, MemoryManager, NO_LONG_TERM_MEMORIES};
pub use proposal::{ExtractionProposal, NodeDraft, NodeUpdate};
pub use relationship::{MemoryEdge, RelationshipCategory, RelationshipType};
pub use retrieval::{RetrievalConfig, RetrievalEngine, RetrievalOutcome, RetrievedMemory};
pub use retry::RetryConfig;
pub use store::SqliteGraphStore;
pub use transcript::{
    Role, SqliteTranscriptLog, TranscriptConfig, TranscriptLog, TranscriptTurn, TurnStatus,
};
pub use types::{
    CurrentDetails, ExperienceDetails, KnowledgeDetails, MemoryContext, MemoryNode, NodeId,
    NodeKind, RelationshipDetails,
};
pub use working_memory::{WorkingMemory, WorkingMemoryConfig};

use std::sync::Arc;

/// Process-level composition root.
///
/// Owns the shared graph store, transcript log, embedder and clock, and
/// hands out per-session managers and the consolidation pipeline.
#[derive(Clone)]
pub struct MemorySystem {
    config: MemoryConfig,
    store: Arc<SqliteGraphStore>,
    transcripts: Arc<dyn TranscriptLog>,
    embedder: Arc<dyn EmbeddingProvider>,
    clock: Arc<dyn Clock>,
    retrieval: Arc<RetrievalEngine>,
}

impl std::fmt::Debug for MemorySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySystem")
            .field("data_dir", &self.config.data_dir)
            .field("embedder", &self.embedder.name())
            .finish()
    }
}

impl MemorySystem {
    /// Open (or create) the SQLite graph and transcript databases under `data_dir`
    pub async fn open(config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let store = SqliteGraphStore::open(config.graph_path());
        let transcripts =
            SqliteTranscriptLog::open(config.transcript_path(), config.transcript.clone()).await?;
        Self::assemble(config, store, transcripts).await
    }

    /// Same wiring over in-memory databases
    pub async fn in_memory(config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteGraphStore::in_memory();
        let transcripts = SqliteTranscriptLog::in_memory(config.transcript.clone()).await?;
        Self::assemble(config, store, transcripts).await
    }

    async fn assemble(
        config: MemoryConfig,
        store: Arc<SqliteGraphStore>,
        transcripts: Arc<SqliteTranscriptLog>,
    ) -> Result<Self> {
        // The system holds a lease for its lifetime
        store.connect().await?;

        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(HashEmbeddingProvider::new(config.embedding_dimension));
        let retrieval = Arc::new(RetrievalEngine::new(
            store.clone(),
            Arc::clone(&embedder),
            config.retrieval.clone(),
        ));
        tracing::info!(data_dir = %config.data_dir.display(), "memory system ready");

        Ok(Self {
            config,
            store,
            transcripts,
            embedder,
            clock: Arc::new(SystemClock),
            retrieval,
        })
    }

    /// Replace the embedding capability
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = embedder;
        self.retrieval = Arc::new(RetrievalEngine::new(
            self.store.clone(),
            Arc::clone(&self.embedder),
            self.config.retrieval.clone(),
        ));
        self
    }

    /// Replace the wall clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteGraphStore> {
        &self.store
    }

    pub fn transcripts(&self) -> &Arc<dyn TranscriptLog> {
        &self.transcripts
    }

    pub fn retrieval(&self) -> &Arc<RetrievalEngine> {
        &self.retrieval
    }

    /// Memory manager for one conversation
    pub fn session(&self, user_id: &str, session_id: &str) -> Result<MemoryManager> {
        MemoryManager::new(
            user_id,
            session_id,
            Arc::clone(&self.retrieval),
            self.store.clone(),
            Arc::clone(&self.transcripts),
            Arc::clone(&self.clock),
            &self.config.working_memory,
        )
    }

    /// Consolidation pipeline sharing this system's store, log, embedder and clock
    pub fn pipeline(&self, extractor: Arc<dyn Extractor>) -> ConsolidationPipeline {
        ConsolidationPipeline::new(
            self.store.clone(),
            Arc::clone(&self.transcripts),
            Arc::clone(&self.embedder),
            Arc::clone(&self.retrieval),
            extractor,
            Arc::clone(&self.clock),
            self.config.consolidation.clone(),
        )
        .with_maintenance(self.config.maintenance.clone())
    }

    pub async fn health(&self) -> HealthStatus {
        self.store.health().await
    }

    pub async fn stats(&self) -> Result<GraphStats> {
        self.store.stats().await
    }

    /// Run importance decay over the whole graph
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        maintenance::run_maintenance(
            self.store.as_ref(),
            &self.config.maintenance,
            self.clock.now_utc(),
        )
        .await
    }

    /// Release the system's store lease
    pub async fn close(&self) -> Result<()> {
        self.store.disconnect().await
    }
}
