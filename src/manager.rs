//! Per-session memory manager: observe turns, recall prompt context

use crate::clock::Clock;
use crate::error::Result;
use crate::graph_store::GraphStore;
use crate::retrieval::{RetrievalEngine, RetrievedMemory};
use crate::transcript::{Role, TranscriptLog};
use crate::working_memory::{WorkingMemory, WorkingMemoryConfig};

use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

/// Long-term section used when retrieval finds nothing or is unavailable
pub const NO_LONG_TERM_MEMORIES: &str = "[No relevant long-term memories found]";

/// Composition root for one (user, session).
///
/// The graph-store lease is taken on first recall and released by
/// [`MemoryManager::disconnect`] or on drop.
pub struct MemoryManager {
    user_id: String,
    buffer: WorkingMemory,
    retrieval: Arc<RetrievalEngine>,
    store: Arc<dyn GraphStore>,
    transcripts: Arc<dyn TranscriptLog>,
    clock: Arc<dyn Clock>,
    connected: bool,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("user_id", &self.user_id)
            .field("buffer", &self.buffer)
            .field("store", &self.store.backend_name())
            .field("connected", &self.connected)
            .finish()
    }
}

impl MemoryManager {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        retrieval: Arc<RetrievalEngine>,
        store: Arc<dyn GraphStore>,
        transcripts: Arc<dyn TranscriptLog>,
        clock: Arc<dyn Clock>,
        config: &WorkingMemoryConfig,
    ) -> Result<Self> {
        let user_id = user_id.into();
        let buffer = WorkingMemory::new(user_id.clone(), session_id, config, Arc::clone(&clock))?;
        Ok(Self {
            user_id,
            buffer,
            retrieval,
            store,
            transcripts,
            clock,
            connected: false,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        self.buffer.session_id()
    }

    pub fn working_memory(&self) -> &WorkingMemory {
        &self.buffer
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Log the turn for consolidation, then update working memory.
    ///
    /// The buffer is updated even when the transcript append fails; that
    /// failure is still returned.
    pub async fn observe(&mut self, role: Role, text: &str) -> Result<()> {
        let logged = self
            .transcripts
            .append(&self.user_id, role, text, self.clock.now_utc())
            .await;
        let buffered = self.buffer.observe(role, text);

        if let Err(e) = &logged {
            warn!(user_id = %self.user_id, error = %e, "transcript append failed");
        }
        logged?;
        buffered
    }

    /// Real-time context followed by relevant long-term memories. Never fails.
    pub async fn recall(&mut self, query: &str) -> String {
        let real_time = self.buffer.snapshot();
        let memories = match self.long_term(query).await {
            Ok(memories) => memories,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "long-term recall unavailable");
                Vec::new()
            }
        };
        format!("{real_time}\n{}", render_long_term(&memories))
    }

    pub fn update_focus(&mut self, topic: &str, entities: &[String]) -> Result<()> {
        self.buffer.update_focus(topic, entities)
    }

    pub fn update_mood(&mut self, mood_delta: f32, stress_delta: f32) -> Result<()> {
        self.buffer.update_mood(mood_delta, stress_delta)
    }

    /// Release the store lease; repeated calls are no-ops
    pub async fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.store.disconnect().await?;
        debug!(user_id = %self.user_id, "memory session disconnected");
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if !self.connected {
            self.store.connect().await?;
            self.connected = true;
            debug!(user_id = %self.user_id, backend = self.store.backend_name(), "memory session connected");
        }
        Ok(())
    }

    async fn long_term(&mut self, query: &str) -> Result<Vec<RetrievedMemory>> {
        self.ensure_connected().await?;
        let outcome = self.retrieval.retrieve(query, None).await?;
        Ok(outcome.memories)
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if !self.connected {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            handle.spawn(async move {
                if let Err(e) = store.disconnect().await {
                    warn!(error = %e, "failed to release store lease on drop");
                }
            });
        }
    }
}

/// Render retrieved memories as the long-term section of the prompt context
pub fn render_long_term(memories: &[RetrievedMemory]) -> String {
    if memories.is_empty() {
        return NO_LONG_TERM_MEMORIES.to_string();
    }

    let mut out = String::from("[Relevant Long-Term Memories]\n");
    for memory in memories {
        let _ = writeln!(
            out,
            "- Primary Memory (Relevance: {:.2}): [{}] {}",
            memory.score,
            memory.node.context(),
            memory.node.content
        );
        for related in &memory.related {
            let _ = writeln!(
                out,
                "  - Linked Memory: [{}] {}",
                related.context(),
                related.content
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::MemoryError;
    use crate::relationship::{MemoryEdge, RelationshipType};
    use crate::retrieval::RetrievalConfig;
    use crate::testing::{self, FixedEmbedder, UnreachableStore};
    use crate::transcript::{SqliteTranscriptLog, TranscriptConfig, TranscriptTurn};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    async fn transcripts() -> Arc<SqliteTranscriptLog> {
        SqliteTranscriptLog::in_memory(TranscriptConfig::default())
            .await
            .unwrap()
    }

    fn manager(
        store: Arc<dyn GraphStore>,
        embedder: Arc<dyn crate::embedding::EmbeddingProvider>,
        transcripts: Arc<dyn TranscriptLog>,
    ) -> MemoryManager {
        let retrieval = Arc::new(RetrievalEngine::new(
            Arc::clone(&store),
            embedder,
            RetrievalConfig::default(),
        ));
        MemoryManager::new(
            "zafar",
            "s1",
            retrieval,
            store,
            transcripts,
            Arc::new(SystemClock),
            &WorkingMemoryConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn empty_graph_renders_placeholder() {
        let store = testing::memory_store().await;
        let mut memory = manager(store, testing::hash_embedder(), transcripts().await);

        let context = memory.recall("hello").await;
        assert!(context.starts_with("[START of Real-Time Context]"));
        assert!(context.ends_with("[END of Real-Time Context]\n[No relevant long-term memories found]"));
        memory.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn dominant_memory_is_rendered_first_with_links() {
        let store = testing::memory_store().await;
        let embedder = Arc::new(
            FixedEmbedder::new(2)
                .with("Who helped me with code?", vec![1.0, 0.0])
                .with("User debugged a script with John", vec![0.9, 0.1])
                .with("Went to the beach", vec![0.0, 1.0]),
        );
        let debugged = testing::experience("User debugged a script with John");
        let beach = testing::experience("Went to the beach");
        let john = testing::john();
        for node in [&debugged, &beach, &john] {
            testing::seed(store.as_ref(), embedder.as_ref(), node).await;
        }
        store
            .merge_edge(&MemoryEdge::new(
                RelationshipType::ExperienceToRelationship,
                &debugged,
                &john,
            ))
            .await
            .unwrap();

        let mut memory = manager(store, embedder, transcripts().await);
        let context = memory.recall("Who helped me with code?").await;

        let long_term = context
            .split_once("[END of Real-Time Context]\n")
            .unwrap()
            .1;
        let mut lines = long_term.lines();
        assert_eq!(lines.next(), Some("[Relevant Long-Term Memories]"));
        assert_eq!(
            lines.next(),
            Some("- Primary Memory (Relevance: 0.99): [EXPERIENCE] User debugged a script with John")
        );
        assert_eq!(
            lines.next(),
            Some("  - Linked Memory: [RELATIONSHIP] John is a colleague who helps with Python")
        );
    }

    #[tokio::test]
    async fn unreachable_store_degrades_instead_of_failing() {
        let mut memory = manager(
            Arc::new(UnreachableStore),
            testing::hash_embedder(),
            transcripts().await,
        );
        let context = memory.recall("anything").await;
        assert!(context.ends_with(NO_LONG_TERM_MEMORIES));
        assert!(!memory.is_connected());
        memory.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn observe_logs_and_buffers() {
        let store = testing::memory_store().await;
        let log = transcripts().await;
        let mut memory = manager(store, testing::hash_embedder(), log.clone());

        memory.observe(Role::User, "I'm stuck on a bug").await.unwrap();
        memory.update_focus("Debugging", &["Python".into()]).unwrap();
        memory.update_mood(-0.3, 0.4).unwrap();

        let pending = log.unconsolidated("zafar").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "I'm stuck on a bug");

        let snapshot = memory.working_memory().snapshot();
        assert!(snapshot.contains("Current Focus: Debugging"));
        assert!(snapshot.contains("user: I'm stuck on a bug"));
    }

    struct BrokenLog;

    #[async_trait]
    impl TranscriptLog for BrokenLog {
        async fn append(&self, _: &str, _: Role, _: &str, _: DateTime<Utc>) -> Result<TranscriptTurn> {
            Err(MemoryError::Connectivity("disk unavailable".into()))
        }
        async fn pending_users(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn unconsolidated(&self, _: &str) -> Result<Vec<TranscriptTurn>> {
            Ok(Vec::new())
        }
        async fn mark_consolidated(&self, _: &[String], _: DateTime<Utc>) -> Result<()> {
            Ok(())
        }
        async fn mark_failed(&self, _: &[String], _: &str, _: DateTime<Utc>) -> Result<()> {
            Ok(())
        }
        async fn failed(&self, _: &str) -> Result<Vec<TranscriptTurn>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn failed_append_still_updates_buffer() {
        let store = testing::memory_store().await;
        let mut memory = manager(store, testing::hash_embedder(), Arc::new(BrokenLog));

        let err = memory.observe(Role::User, "hello there").await.unwrap_err();
        assert!(matches!(err, MemoryError::Connectivity(_)));
        assert_eq!(
            memory.working_memory().current().content,
            "Last message from user: hello there"
        );
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let store = testing::memory_store().await;
        let mut memory = manager(store.clone(), testing::hash_embedder(), transcripts().await);

        memory.recall("warm up").await;
        assert!(memory.is_connected());
        memory.disconnect().await.unwrap();
        memory.disconnect().await.unwrap();
        assert!(!memory.is_connected());

        // The test's own lease keeps the store usable
        assert!(store.health().await.healthy);
    }
}
