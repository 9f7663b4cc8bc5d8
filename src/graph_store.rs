//! Graph-store capability: the typed query surface over nodes and edges

use crate::error::Result;
use crate::relationship::MemoryEdge;
use crate::types::{MemoryContext, MemoryNode, NodeId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named vector index restricted to a set of node contexts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorIndex {
    pub name: String,
    pub contexts: Vec<MemoryContext>,
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self {
            name: "memory_vector_index".to_string(),
            contexts: vec![
                MemoryContext::Experience,
                MemoryContext::Knowledge,
                MemoryContext::Relationship,
            ],
        }
    }
}

/// A node paired with its similarity to a query vector
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNode {
    pub node: MemoryNode,
    pub score: f32,
}

/// Result of a store health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub backend: String,
    pub response_time_ms: u64,
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Node and edge counts
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphStats {
    pub total_nodes: i64,
    pub total_edges: i64,
    pub embedded_nodes: i64,
    pub nodes_by_context: BTreeMap<MemoryContext, i64>,
    pub edges_by_type: BTreeMap<String, i64>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Acquire a lease, opening the connection on first use
    async fn connect(&self) -> Result<()>;
    /// Release a lease; the connection closes with the last one
    async fn disconnect(&self) -> Result<()>;
    async fn health(&self) -> HealthStatus;

    /// Top `k` embedded nodes of the index's contexts by cosine similarity
    async fn nearest(
        &self,
        index: &VectorIndex,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredNode>>;

    /// Distinct nodes one unexpired edge away from `node_id`, in either direction
    async fn neighbors(&self, node_id: &str, at: DateTime<Utc>) -> Result<Vec<MemoryNode>>;

    async fn load_node(&self, id: &str) -> Result<Option<MemoryNode>>;

    /// Create or merge-by-id; a `None` embedding keeps the stored one
    async fn upsert_node(&self, node: &MemoryNode, embedding: Option<&[f32]>) -> Result<()>;

    /// Insert the edge or reinforce the existing (from, to, type) triple
    async fn merge_edge(&self, edge: &MemoryEdge) -> Result<MemoryEdge>;

    /// Write one node and its edges in a single transaction
    async fn upsert_node_with_edges(
        &self,
        node: &MemoryNode,
        embedding: Option<&[f32]>,
        edges: &[MemoryEdge],
    ) -> Result<Vec<MemoryEdge>>;

    async fn edges(&self, node_id: &str) -> Result<Vec<MemoryEdge>>;

    /// Bump access count and last-accessed time
    async fn record_access(&self, ids: &[NodeId], at: DateTime<Utc>) -> Result<()>;

    async fn list_nodes(
        &self,
        context: Option<MemoryContext>,
        limit: i64,
    ) -> Result<Vec<MemoryNode>>;

    async fn stats(&self) -> Result<GraphStats>;
}
