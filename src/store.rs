//! SQLite adapter for the memory graph

use crate::error::{MemoryError, Result};
use crate::graph_store::{GraphStats, GraphStore, HealthStatus, ScoredNode, VectorIndex};
use crate::relationship::{MemoryEdge, RelationshipCategory, RelationshipType};
use crate::types::{MemoryContext, MemoryNode, NodeId, NodeKind};
use crate::vector_search::{cosine_similarity, decode_vector, encode_vector, top_k};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const NODE_COLUMNS: &str = "id, memory_context, content, description, importance, \
    emotional_significance, confidence, created_at, updated_at, last_accessed_at, \
    access_count, tags, metadata, context_relevance, details";

const EDGE_COLUMNS: &str = "id, relationship_type, category, from_id, from_context, to_id, \
    to_context, strength, confidence, bidirectional, context_relevance, created_at, \
    last_reinforced, valid_from, valid_until, evidence_count, source_conversation, context, \
    properties";

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

#[derive(Default)]
struct Connection {
    pool: Option<SqlitePool>,
    /// In-memory databases vanish with their pool, so released pools are kept here
    parked: Option<SqlitePool>,
    leases: usize,
}

/// Property-graph store for memory nodes and relationship edges
pub struct SqliteGraphStore {
    location: Location,
    max_connections: u32,
    state: RwLock<Connection>,
}

impl std::fmt::Debug for SqliteGraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteGraphStore")
            .field("location", &self.location)
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl SqliteGraphStore {
    /// Store backed by a database file, created on first connect
    pub fn open(path: impl AsRef<Path>) -> Arc<Self> {
        Arc::new(Self {
            location: Location::File(path.as_ref().to_path_buf()),
            max_connections: 5,
            state: RwLock::new(Connection::default()),
        })
    }

    /// Create an in-memory store for testing
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            location: Location::Memory,
            max_connections: 1,
            state: RwLock::new(Connection::default()),
        })
    }

    async fn open_pool(&self) -> Result<SqlitePool> {
        let pool = match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .foreign_keys(true);
                SqlitePoolOptions::new()
                    .max_connections(self.max_connections)
                    .connect_with(options)
                    .await
            }
            Location::Memory => {
                let options = SqliteConnectOptions::new()
                    .in_memory(true)
                    .foreign_keys(true);
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await
            }
        }
        .map_err(|e| MemoryError::Connectivity(format!("failed to open graph store: {e}")))?;

        sqlx::migrate!("./migrations/graph").run(&pool).await?;
        Ok(pool)
    }

    /// Acquire a lease on the connection
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.pool.is_none() {
            let pool = match state.parked.take() {
                Some(pool) => pool,
                None => self.open_pool().await?,
            };
            state.pool = Some(pool);
            debug!(location = ?self.location, "graph store connected");
        }
        state.leases += 1;
        Ok(())
    }

    /// Release a lease; extra releases are ignored
    pub async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.leases == 0 {
            return Ok(());
        }
        state.leases -= 1;
        if state.leases == 0 {
            if let Some(pool) = state.pool.take() {
                match self.location {
                    Location::File(_) => pool.close().await,
                    Location::Memory => state.parked = Some(pool),
                }
                debug!(location = ?self.location, "graph store disconnected");
            }
        }
        Ok(())
    }

    async fn pool(&self) -> Result<SqlitePool> {
        self.state
            .read()
            .await
            .pool
            .clone()
            .ok_or_else(|| MemoryError::Connectivity("graph store is not connected".into()))
    }

    pub async fn health(&self) -> HealthStatus {
        let started = Instant::now();
        let probe = match self.pool().await {
            Ok(pool) => sqlx::query("SELECT 1")
                .execute(&pool)
                .await
                .map(|_| ())
                .map_err(MemoryError::from),
            Err(e) => Err(e),
        };

        HealthStatus {
            healthy: probe.is_ok(),
            backend: "sqlite".to_string(),
            response_time_ms: started.elapsed().as_millis() as u64,
            detail: probe.err().map(|e| e.to_string()),
            checked_at: Utc::now(),
        }
    }

    /// Brute-force cosine scan over the embedded nodes of the index's contexts
    pub async fn nearest(
        &self,
        index: &VectorIndex,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredNode>> {
        let pool = self.pool().await?;
        if k == 0 || index.contexts.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = placeholders(index.contexts.len());
        let query_str = format!(
            "SELECT {NODE_COLUMNS}, embedding FROM memory_nodes \
             WHERE embedding IS NOT NULL AND memory_context IN ({placeholders}) \
             ORDER BY id"
        );
        let mut query = sqlx::query(&query_str);
        for context in &index.contexts {
            query = query.bind(context.as_str());
        }
        let rows = query.fetch_all(&pool).await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let embedding = match decode_vector(&blob) {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!(index = %index.name, error = %e, "skipping undecodable embedding");
                    continue;
                }
            };
            if let Some(node) = decode_node(row) {
                let score = cosine_similarity(vector, &embedding);
                scored.push((node, score));
            }
        }

        Ok(top_k(scored, k)
            .into_iter()
            .map(|(node, score)| ScoredNode { node, score })
            .collect())
    }

    /// One-hop expansion over unexpired edges in either direction
    pub async fn neighbors(&self, node_id: &str, at: DateTime<Utc>) -> Result<Vec<MemoryNode>> {
        let edges = self.edges(node_id).await?;
        let neighbor_ids: BTreeSet<&str> = edges
            .iter()
            .filter(|edge| !edge.is_expired(at))
            .map(|edge| edge.other_end(node_id))
            .filter(|id| *id != node_id)
            .collect();

        if neighbor_ids.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.pool().await?;
        let query_str = format!(
            "SELECT {NODE_COLUMNS} FROM memory_nodes WHERE id IN ({}) ORDER BY id",
            placeholders(neighbor_ids.len())
        );
        let mut query = sqlx::query(&query_str);
        for id in &neighbor_ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&pool).await?;
        Ok(rows.iter().filter_map(decode_node).collect())
    }

    /// Load a node by ID
    pub async fn load_node(&self, id: &str) -> Result<Option<MemoryNode>> {
        let pool = self.pool().await?;
        let query_str = format!("SELECT {NODE_COLUMNS} FROM memory_nodes WHERE id = ?");
        let row = sqlx::query(&query_str)
            .bind(id)
            .fetch_optional(&pool)
            .await?;

        row.map(|row| row_to_node(&row)).transpose()
    }

    pub async fn upsert_node(&self, node: &MemoryNode, embedding: Option<&[f32]>) -> Result<()> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await?;
        write_node(&mut conn, node, embedding).await
    }

    pub async fn merge_edge(&self, edge: &MemoryEdge) -> Result<MemoryEdge> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await?;
        write_edge(&mut conn, edge).await
    }

    /// Node plus edges in one transaction; any failure leaves the graph unchanged
    pub async fn upsert_node_with_edges(
        &self,
        node: &MemoryNode,
        embedding: Option<&[f32]>,
        edges: &[MemoryEdge],
    ) -> Result<Vec<MemoryEdge>> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;

        write_node(&mut tx, node, embedding).await?;
        let mut stored = Vec::with_capacity(edges.len());
        for edge in edges {
            stored.push(write_edge(&mut tx, edge).await?);
        }

        tx.commit().await?;
        Ok(stored)
    }

    /// All edges touching a node, expired ones included
    pub async fn edges(&self, node_id: &str) -> Result<Vec<MemoryEdge>> {
        let pool = self.pool().await?;
        let query_str = format!(
            "SELECT {EDGE_COLUMNS} FROM memory_relationships \
             WHERE from_id = ? OR to_id = ? ORDER BY created_at, id"
        );
        let rows = sqlx::query(&query_str)
            .bind(node_id)
            .bind(node_id)
            .fetch_all(&pool)
            .await?;

        Ok(rows.iter().filter_map(decode_edge).collect())
    }

    /// Record access to a set of nodes
    pub async fn record_access(&self, ids: &[NodeId], at: DateTime<Utc>) -> Result<()> {
        let pool = self.pool().await?;
        let ids: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        if ids.is_empty() {
            return Ok(());
        }

        let query_str = format!(
            "UPDATE memory_nodes SET last_accessed_at = ?, access_count = access_count + 1 \
             WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&query_str).bind(at);
        for id in &ids {
            query = query.bind(*id);
        }
        query.execute(&pool).await?;

        Ok(())
    }

    /// Nodes by importance, optionally restricted to one context; a negative limit lists all
    pub async fn list_nodes(
        &self,
        context: Option<MemoryContext>,
        limit: i64,
    ) -> Result<Vec<MemoryNode>> {
        let pool = self.pool().await?;
        let rows = match context {
            Some(context) => {
                let query_str = format!(
                    "SELECT {NODE_COLUMNS} FROM memory_nodes WHERE memory_context = ? \
                     ORDER BY importance DESC, updated_at DESC LIMIT ?"
                );
                sqlx::query(&query_str)
                    .bind(context.as_str())
                    .bind(limit)
                    .fetch_all(&pool)
                    .await?
            }
            None => {
                let query_str = format!(
                    "SELECT {NODE_COLUMNS} FROM memory_nodes \
                     ORDER BY importance DESC, updated_at DESC LIMIT ?"
                );
                sqlx::query(&query_str).bind(limit).fetch_all(&pool).await?
            }
        };

        Ok(rows.iter().filter_map(decode_node).collect())
    }

    pub async fn stats(&self) -> Result<GraphStats> {
        let pool = self.pool().await?;

        let total_nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memory_nodes")
            .fetch_one(&pool)
            .await?;
        let embedded_nodes: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM memory_nodes WHERE embedding IS NOT NULL")
                .fetch_one(&pool)
                .await?;
        let total_edges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memory_relationships")
            .fetch_one(&pool)
            .await?;

        let mut nodes_by_context: BTreeMap<MemoryContext, i64> = BTreeMap::new();
        let rows = sqlx::query(
            "SELECT memory_context, COUNT(*) AS n FROM memory_nodes GROUP BY memory_context",
        )
        .fetch_all(&pool)
        .await?;
        for row in &rows {
            let context: String = row.try_get("memory_context")?;
            if let Ok(context) = context.parse::<MemoryContext>() {
                nodes_by_context.insert(context, row.try_get("n")?);
            }
        }

        let mut edges_by_type: BTreeMap<String, i64> = BTreeMap::new();
        let rows = sqlx::query(
            "SELECT relationship_type, COUNT(*) AS n FROM memory_relationships \
             GROUP BY relationship_type",
        )
        .fetch_all(&pool)
        .await?;
        for row in &rows {
            edges_by_type.insert(row.try_get("relationship_type")?, row.try_get("n")?);
        }

        Ok(GraphStats {
            total_nodes,
            total_edges,
            embedded_nodes,
            nodes_by_context,
            edges_by_type,
        })
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn connect(&self) -> Result<()> {
        self.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect().await
    }

    async fn health(&self) -> HealthStatus {
        self.health().await
    }

    async fn nearest(
        &self,
        index: &VectorIndex,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredNode>> {
        self.nearest(index, vector, k).await
    }

    async fn neighbors(&self, node_id: &str, at: DateTime<Utc>) -> Result<Vec<MemoryNode>> {
        self.neighbors(node_id, at).await
    }

    async fn load_node(&self, id: &str) -> Result<Option<MemoryNode>> {
        self.load_node(id).await
    }

    async fn upsert_node(&self, node: &MemoryNode, embedding: Option<&[f32]>) -> Result<()> {
        self.upsert_node(node, embedding).await
    }

    async fn merge_edge(&self, edge: &MemoryEdge) -> Result<MemoryEdge> {
        self.merge_edge(edge).await
    }

    async fn upsert_node_with_edges(
        &self,
        node: &MemoryNode,
        embedding: Option<&[f32]>,
        edges: &[MemoryEdge],
    ) -> Result<Vec<MemoryEdge>> {
        self.upsert_node_with_edges(node, embedding, edges).await
    }

    async fn edges(&self, node_id: &str) -> Result<Vec<MemoryEdge>> {
        self.edges(node_id).await
    }

    async fn record_access(&self, ids: &[NodeId], at: DateTime<Utc>) -> Result<()> {
        self.record_access(ids, at).await
    }

    async fn list_nodes(
        &self,
        context: Option<MemoryContext>,
        limit: i64,
    ) -> Result<Vec<MemoryNode>> {
        self.list_nodes(context, limit).await
    }

    async fn stats(&self) -> Result<GraphStats> {
        self.stats().await
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

/// Create or merge a node by id; `created_at` and a stored embedding survive the merge
async fn write_node(
    conn: &mut SqliteConnection,
    node: &MemoryNode,
    embedding: Option<&[f32]>,
) -> Result<()> {
    let tags = serde_json::to_string(&node.tags)?;
    let metadata = serde_json::to_string(&node.metadata)?;
    let relevance = serde_json::to_string(&node.context_relevance)?;
    let details = serde_json::to_string(&node.kind)?;
    let blob = embedding.map(encode_vector).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO memory_nodes (
            id, memory_context, content, description, importance, emotional_significance,
            confidence, created_at, updated_at, last_accessed_at, access_count, tags,
            metadata, context_relevance, details, embedding
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            memory_context = excluded.memory_context,
            content = excluded.content,
            description = excluded.description,
            importance = excluded.importance,
            emotional_significance = excluded.emotional_significance,
            confidence = excluded.confidence,
            updated_at = excluded.updated_at,
            last_accessed_at = COALESCE(excluded.last_accessed_at, memory_nodes.last_accessed_at),
            access_count = MAX(excluded.access_count, memory_nodes.access_count),
            tags = excluded.tags,
            metadata = excluded.metadata,
            context_relevance = excluded.context_relevance,
            details = excluded.details,
            embedding = COALESCE(excluded.embedding, memory_nodes.embedding)
        "#,
    )
    .bind(&node.id)
    .bind(node.context().as_str())
    .bind(&node.content)
    .bind(node.description.as_ref())
    .bind(node.importance)
    .bind(node.emotional_significance)
    .bind(node.confidence)
    .bind(node.created_at)
    .bind(node.updated_at)
    .bind(node.last_accessed_at)
    .bind(node.access_count)
    .bind(tags)
    .bind(metadata)
    .bind(relevance)
    .bind(details)
    .bind(blob)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Insert an edge or reinforce the existing (from, to, type) triple, returning the stored row
async fn write_edge(conn: &mut SqliteConnection, edge: &MemoryEdge) -> Result<MemoryEdge> {
    let mut edge = edge.clone();
    edge.validate()?;

    let present: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM memory_nodes WHERE id = ? OR id = ?")
            .bind(&edge.from_id)
            .bind(&edge.to_id)
            .fetch_one(&mut *conn)
            .await?;
    if present < 2 {
        return Err(MemoryError::NotFound(format!(
            "edge endpoint missing: {} -> {}",
            edge.from_id, edge.to_id
        )));
    }

    let relevance = serde_json::to_string(&edge.context_relevance)?;
    let properties = serde_json::to_string(&edge.properties)?;

    sqlx::query(
        r#"
        INSERT INTO memory_relationships (
            id, relationship_type, category, from_id, from_context, to_id, to_context,
            strength, confidence, bidirectional, context_relevance, created_at,
            last_reinforced, valid_from, valid_until, evidence_count, source_conversation,
            context, properties
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(from_id, to_id, relationship_type) DO UPDATE SET
            evidence_count = memory_relationships.evidence_count + 1,
            last_reinforced = excluded.last_reinforced,
            strength = MAX(memory_relationships.strength, excluded.strength),
            confidence = MAX(memory_relationships.confidence, excluded.confidence)
        "#,
    )
    .bind(&edge.id)
    .bind(edge.relationship_type.as_str())
    .bind(edge.category.as_str())
    .bind(&edge.from_id)
    .bind(edge.from_context.as_str())
    .bind(&edge.to_id)
    .bind(edge.to_context.as_str())
    .bind(edge.strength)
    .bind(edge.confidence)
    .bind(edge.bidirectional)
    .bind(relevance)
    .bind(edge.created_at)
    .bind(edge.last_reinforced)
    .bind(edge.valid_from)
    .bind(edge.valid_until)
    .bind(edge.evidence_count)
    .bind(edge.source_conversation.as_ref())
    .bind(edge.context.as_ref())
    .bind(properties)
    .execute(&mut *conn)
    .await?;

    let query_str = format!(
        "SELECT {EDGE_COLUMNS} FROM memory_relationships \
         WHERE from_id = ? AND to_id = ? AND relationship_type = ?"
    );
    let row = sqlx::query(&query_str)
        .bind(&edge.from_id)
        .bind(&edge.to_id)
        .bind(edge.relationship_type.as_str())
        .fetch_one(&mut *conn)
        .await?;

    row_to_edge(&row)
}

/// Helper: Convert database row to MemoryNode
fn row_to_node(row: &SqliteRow) -> Result<MemoryNode> {
    let details: String = row.try_get("details")?;
    let kind: NodeKind = serde_json::from_str(&details)?;

    let tags: String = row.try_get("tags").unwrap_or_default();
    let metadata: String = row.try_get("metadata").unwrap_or_default();
    let relevance: String = row.try_get("context_relevance").unwrap_or_default();

    Ok(MemoryNode {
        id: row.try_get("id")?,
        content: row.try_get("content")?,
        description: row.try_get("description").unwrap_or_default(),
        importance: row.try_get("importance").unwrap_or(0.5),
        emotional_significance: row.try_get("emotional_significance").unwrap_or(0.0),
        confidence: row.try_get("confidence").unwrap_or(0.8),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_accessed_at: row.try_get("last_accessed_at").unwrap_or_default(),
        access_count: row.try_get("access_count").unwrap_or(0),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        context_relevance: serde_json::from_str(&relevance)
            .unwrap_or_else(|_| kind.context().default_relevance()),
        kind,
    })
}

fn decode_node(row: &SqliteRow) -> Option<MemoryNode> {
    match row_to_node(row) {
        Ok(node) => Some(node),
        Err(e) => {
            let id: String = row.try_get("id").unwrap_or_default();
            warn!(node_id = %id, error = %e, "skipping unreadable memory node");
            None
        }
    }
}

/// Helper: Convert database row to MemoryEdge
fn row_to_edge(row: &SqliteRow) -> Result<MemoryEdge> {
    let relationship_type: String = row.try_get("relationship_type")?;
    let relationship_type: RelationshipType = relationship_type.parse()?;
    let category: String = row.try_get("category")?;
    let category: RelationshipCategory = category.parse()?;
    let from_context: String = row.try_get("from_context")?;
    let to_context: String = row.try_get("to_context")?;
    let relevance: String = row.try_get("context_relevance").unwrap_or_default();
    let properties: String = row.try_get("properties").unwrap_or_default();

    Ok(MemoryEdge {
        id: row.try_get("id")?,
        relationship_type,
        category,
        from_id: row.try_get("from_id")?,
        from_context: from_context.parse()?,
        to_id: row.try_get("to_id")?,
        to_context: to_context.parse()?,
        strength: row.try_get("strength").unwrap_or(0.5),
        confidence: row.try_get("confidence").unwrap_or(0.8),
        bidirectional: row.try_get("bidirectional").unwrap_or(false),
        context_relevance: serde_json::from_str(&relevance).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        last_reinforced: row.try_get("last_reinforced")?,
        valid_from: row.try_get("valid_from").unwrap_or_default(),
        valid_until: row.try_get("valid_until").unwrap_or_default(),
        evidence_count: row.try_get("evidence_count").unwrap_or(1),
        source_conversation: row.try_get("source_conversation").unwrap_or_default(),
        context: row.try_get("context").unwrap_or_default(),
        properties: serde_json::from_str(&properties).unwrap_or_default(),
    })
}

fn decode_edge(row: &SqliteRow) -> Option<MemoryEdge> {
    match row_to_edge(row) {
        Ok(edge) => Some(edge),
        Err(e) => {
            warn!(error = %e, "skipping unreadable relationship edge");
            None
        }
    }
}
