//! Context-aware retrieval: vector seed plus one-hop graph expansion

use crate::embedding::{embed_one, EmbeddingProvider};
use crate::error::{MemoryError, Result};
use crate::graph_store::{GraphStore, VectorIndex};
use crate::types::MemoryNode;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub index: VectorIndex,
    pub default_top_k: usize,
    pub embed_timeout_ms: u64,
    pub query_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            index: VectorIndex::default(),
            default_top_k: 3,
            embed_timeout_ms: 5_000,
            query_timeout_ms: 5_000,
        }
    }
}

/// A seed node, its similarity, and the nodes one edge away
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedMemory {
    pub node: MemoryNode,
    pub score: f32,
    pub related: Vec<MemoryNode>,
}

/// Retrieval result that never fails the caller.
///
/// On a store, embedding or timeout failure `memories` is empty and `error`
/// carries the cause.
#[derive(Debug, Default)]
pub struct RetrievalOutcome {
    pub memories: Vec<RetrievedMemory>,
    pub error: Option<MemoryError>,
}

impl RetrievalOutcome {
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

pub struct RetrievalEngine {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Find-and-expand for a conversation turn.
    ///
    /// Only argument errors are returned as `Err`; everything else degrades to
    /// an empty outcome. Returned nodes get their access bookkeeping bumped in
    /// a detached task.
    pub async fn retrieve(&self, query: &str, top_k: Option<usize>) -> Result<RetrievalOutcome> {
        let k = self.check_args(query, top_k)?;

        match self.find_and_expand(query, k).await {
            Ok(memories) => {
                self.schedule_access(&memories);
                Ok(RetrievalOutcome {
                    memories,
                    error: None,
                })
            }
            Err(e) => {
                warn!(error = %e, "retrieval degraded to an empty result");
                Ok(RetrievalOutcome {
                    memories: Vec::new(),
                    error: Some(e),
                })
            }
        }
    }

    /// Find-and-expand without access bookkeeping; failures propagate.
    pub async fn retrieve_untracked(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<RetrievedMemory>> {
        let k = self.check_args(query, top_k)?;
        self.find_and_expand(query, k).await
    }

    fn check_args(&self, query: &str, top_k: Option<usize>) -> Result<usize> {
        if query.trim().is_empty() {
            return Err(MemoryError::Validation("query text cannot be empty".into()));
        }
        match top_k.unwrap_or(self.config.default_top_k) {
            0 => Err(MemoryError::Validation("top_k must be positive".into())),
            k => Ok(k),
        }
    }

    async fn find_and_expand(&self, query: &str, k: usize) -> Result<Vec<RetrievedMemory>> {
        let embed_timeout = Duration::from_millis(self.config.embed_timeout_ms);
        let query_timeout = Duration::from_millis(self.config.query_timeout_ms);

        let vector = tokio::time::timeout(embed_timeout, embed_one(self.embedder.as_ref(), query))
            .await
            .map_err(|_| {
                MemoryError::Connectivity(format!(
                    "embedding timed out after {}ms",
                    self.config.embed_timeout_ms
                ))
            })??;

        let seeds = tokio::time::timeout(
            query_timeout,
            self.store.nearest(&self.config.index, &vector, k),
        )
        .await
        .map_err(|_| {
            MemoryError::Connectivity(format!(
                "{} query timed out after {}ms",
                self.config.index.name, self.config.query_timeout_ms
            ))
        })??;

        let now = Utc::now();
        let expansions = tokio::time::timeout(
            query_timeout,
            join_all(seeds.iter().map(|seed| self.store.neighbors(&seed.node.id, now))),
        )
        .await
        .map_err(|_| {
            MemoryError::Connectivity(format!(
                "graph expansion timed out after {}ms",
                self.config.query_timeout_ms
            ))
        })?;

        let mut memories = Vec::with_capacity(seeds.len());
        for (seed, related) in seeds.into_iter().zip(expansions) {
            let mut related = related?;
            related.retain(|n| n.id != seed.node.id);
            related.sort_by(|a, b| a.id.cmp(&b.id));
            related.dedup_by(|a, b| a.id == b.id);
            memories.push(RetrievedMemory {
                node: seed.node,
                score: seed.score,
                related,
            });
        }

        sort_memories(&mut memories);
        debug!(query_len = query.len(), k, hits = memories.len(), "find-and-expand");
        Ok(memories)
    }

    fn schedule_access(&self, memories: &[RetrievedMemory]) {
        if memories.is_empty() {
            return;
        }
        let ids: Vec<_> = memories.iter().map(|m| m.node.id.clone()).collect();
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.record_access(&ids, Utc::now()).await {
                warn!(error = %e, nodes = ids.len(), "access bookkeeping failed");
            }
        });
    }
}

/// Score descending, then importance descending, then id ascending
pub fn sort_memories(memories: &mut [RetrievedMemory]) {
    memories.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.node.importance.total_cmp(&a.node.importance))
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
}
