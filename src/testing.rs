//! Test doubles shared by the unit tests

use crate::embedding::{embed_one, EmbeddingProvider, HashEmbeddingProvider};
use crate::error::{MemoryError, Result};
use crate::extraction::Extractor;
use crate::graph_store::{GraphStats, GraphStore, HealthStatus, ScoredNode, VectorIndex};
use crate::proposal::ExtractionProposal;
use crate::relationship::MemoryEdge;
use crate::store::SqliteGraphStore;
use crate::types::{MemoryContext, MemoryNode, NodeId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) async fn memory_store() -> Arc<SqliteGraphStore> {
    let store = SqliteGraphStore::in_memory();
    store.connect().await.unwrap();
    store
}

pub(crate) fn hash_embedder() -> Arc<HashEmbeddingProvider> {
    Arc::new(HashEmbeddingProvider::new(384))
}

pub(crate) fn experience(content: &str) -> MemoryNode {
    MemoryNode::experience(content, "conversation").unwrap()
}

pub(crate) fn john() -> MemoryNode {
    MemoryNode::relationship("John is a colleague who helps with Python", "John", "colleague")
        .unwrap()
}

/// Embed a node's content and write it
pub(crate) async fn seed(
    store: &dyn GraphStore,
    embedder: &dyn EmbeddingProvider,
    node: &MemoryNode,
) {
    let vector = embed_one(embedder, &node.content).await.unwrap();
    store.upsert_node(node, Some(&vector)).await.unwrap();
}

/// Embedder with hand-picked vectors; unknown texts map to the zero vector
pub(crate) struct FixedEmbedder {
    dimension: usize,
    vectors: HashMap<String, Vec<f32>>,
    uniform: Option<Vec<f32>>,
    delay: Option<Duration>,
}

impl FixedEmbedder {
    pub(crate) fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
            uniform: None,
            delay: None,
        }
    }

    /// Every text gets the same vector
    pub(crate) fn uniform(vector: Vec<f32>) -> Self {
        Self {
            dimension: vector.len(),
            uniform: Some(vector),
            ..Self::new(0)
        }
    }

    pub(crate) fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl EmbeddingProvider for FixedEmbedder {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(texts
            .iter()
            .map(|text| match &self.uniform {
                Some(vector) => vector.clone(),
                None => self
                    .vectors
                    .get(text)
                    .cloned()
                    .unwrap_or_else(|| vec![0.0; self.dimension]),
            })
            .collect())
    }
}

fn unreachable() -> MemoryError {
    MemoryError::Connectivity("connection refused".into())
}

/// A store whose every call fails as unreachable
pub(crate) struct UnreachableStore;

#[async_trait]
impl GraphStore for UnreachableStore {
    fn backend_name(&self) -> &'static str {
        "unreachable"
    }

    async fn connect(&self) -> Result<()> {
        Err(unreachable())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: false,
            backend: "unreachable".into(),
            response_time_ms: 0,
            detail: Some("connection refused".into()),
            checked_at: Utc::now(),
        }
    }

    async fn nearest(&self, _: &VectorIndex, _: &[f32], _: usize) -> Result<Vec<ScoredNode>> {
        Err(unreachable())
    }

    async fn neighbors(&self, _: &str, _: DateTime<Utc>) -> Result<Vec<MemoryNode>> {
        Err(unreachable())
    }

    async fn load_node(&self, _: &str) -> Result<Option<MemoryNode>> {
        Err(unreachable())
    }

    async fn upsert_node(&self, _: &MemoryNode, _: Option<&[f32]>) -> Result<()> {
        Err(unreachable())
    }

    async fn merge_edge(&self, _: &MemoryEdge) -> Result<MemoryEdge> {
        Err(unreachable())
    }

    async fn upsert_node_with_edges(
        &self,
        _: &MemoryNode,
        _: Option<&[f32]>,
        _: &[MemoryEdge],
    ) -> Result<Vec<MemoryEdge>> {
        Err(unreachable())
    }

    async fn edges(&self, _: &str) -> Result<Vec<MemoryEdge>> {
        Err(unreachable())
    }

    async fn record_access(&self, _: &[NodeId], _: DateTime<Utc>) -> Result<()> {
        Err(unreachable())
    }

    async fn list_nodes(&self, _: Option<MemoryContext>, _: i64) -> Result<Vec<MemoryNode>> {
        Err(unreachable())
    }

    async fn stats(&self) -> Result<GraphStats> {
        Err(unreachable())
    }
}

/// Wraps a real store, counts writes and injects failures on demand
pub(crate) struct InstrumentedStore {
    inner: Arc<SqliteGraphStore>,
    pub(crate) writes: AtomicUsize,
    pub(crate) fail_reads: AtomicBool,
    pub(crate) fail_writes: AtomicBool,
    pub(crate) fail_access: AtomicBool,
}

impl InstrumentedStore {
    pub(crate) fn new(inner: Arc<SqliteGraphStore>) -> Self {
        Self {
            inner,
            writes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_access: AtomicBool::new(false),
        }
    }

    fn read_gate(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(unreachable());
        }
        Ok(())
    }

    fn write_gate(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(unreachable());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl GraphStore for InstrumentedStore {
    fn backend_name(&self) -> &'static str {
        "instrumented"
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn health(&self) -> HealthStatus {
        self.inner.health().await
    }

    async fn nearest(
        &self,
        index: &VectorIndex,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredNode>> {
        self.read_gate()?;
        self.inner.nearest(index, vector, k).await
    }

    async fn neighbors(&self, node_id: &str, at: DateTime<Utc>) -> Result<Vec<MemoryNode>> {
        self.read_gate()?;
        self.inner.neighbors(node_id, at).await
    }

    async fn load_node(&self, id: &str) -> Result<Option<MemoryNode>> {
        self.read_gate()?;
        self.inner.load_node(id).await
    }

    async fn upsert_node(&self, node: &MemoryNode, embedding: Option<&[f32]>) -> Result<()> {
        self.write_gate()?;
        self.inner.upsert_node(node, embedding).await
    }

    async fn merge_edge(&self, edge: &MemoryEdge) -> Result<MemoryEdge> {
        self.write_gate()?;
        self.inner.merge_edge(edge).await
    }

    async fn upsert_node_with_edges(
        &self,
        node: &MemoryNode,
        embedding: Option<&[f32]>,
        edges: &[MemoryEdge],
    ) -> Result<Vec<MemoryEdge>> {
        self.write_gate()?;
        self.inner.upsert_node_with_edges(node, embedding, edges).await
    }

    async fn edges(&self, node_id: &str) -> Result<Vec<MemoryEdge>> {
        self.inner.edges(node_id).await
    }

    async fn record_access(&self, ids: &[NodeId], at: DateTime<Utc>) -> Result<()> {
        if self.fail_access.load(Ordering::SeqCst) {
            return Err(unreachable());
        }
        self.inner.record_access(ids, at).await
    }

    async fn list_nodes(
        &self,
        context: Option<MemoryContext>,
        limit: i64,
    ) -> Result<Vec<MemoryNode>> {
        self.inner.list_nodes(context, limit).await
    }

    async fn stats(&self) -> Result<GraphStats> {
        self.inner.stats().await
    }
}

/// Extractor replaying queued responses, then empty proposals
#[derive(Default)]
pub(crate) struct ScriptedExtractor {
    responses: Mutex<VecDeque<Result<ExtractionProposal>>>,
    calls: Mutex<Vec<(String, Vec<NodeId>)>>,
}

impl ScriptedExtractor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn then_ok(self, proposal: ExtractionProposal) -> Self {
        self.responses.lock().unwrap().push_back(Ok(proposal));
        self
    }

    pub(crate) fn then_json(self, value: serde_json::Value) -> Self {
        let proposal = serde_json::from_value(value).unwrap();
        self.then_ok(proposal)
    }

    pub(crate) fn then_err(self, error: MemoryError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    /// Chunk texts and grounding ids seen so far
    pub(crate) fn calls(&self) -> Vec<(String, Vec<NodeId>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn extract(
        &self,
        chunk_text: &str,
        grounding: &[MemoryNode],
    ) -> Result<ExtractionProposal> {
        self.calls.lock().unwrap().push((
            chunk_text.to_string(),
            grounding.iter().map(|n| n.id.clone()).collect(),
        ));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ExtractionProposal::default()))
    }
}
