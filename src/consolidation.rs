//! Background consolidation: fold pending transcript chunks into the memory graph
//!
//! Each user moves through `IDLE -> COLLECTING -> CHUNKING -> PROCESSING_CHUNK* -> IDLE`.
//! A pass grounds every chunk against the graph, asks the extractor for a
//! proposal and applies it item by item. Turns are marked consolidated only
//! after their proposal has been applied.

use crate::clock::Clock;
use crate::embedding::{embed_one, EmbeddingProvider};
use crate::error::{MemoryError, Result};
use crate::extraction::Extractor;
use crate::graph_store::GraphStore;
use crate::maintenance::{run_maintenance, MaintenanceConfig};
use crate::proposal::{ExtractionProposal, NodeDraft, NodeUpdate};
use crate::relationship::{MemoryEdge, RelationshipType};
use crate::retrieval::RetrievalEngine;
use crate::retry::{with_backoff, RetryConfig};
use crate::transcript::{TranscriptLog, TranscriptTurn};
use crate::types::{MemoryNode, NodeId};

use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Consolidation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Local wall-clock hour (0-23) from which the daily pass may run
    pub trigger_hour: u32,
    /// Turns per chunk
    pub chunk_size: usize,
    /// Grounding nodes retrieved per chunk
    pub grounding_top_k: usize,
    pub retry: RetryConfig,
    /// Upper bound for one extraction call
    pub extract_timeout_ms: u64,
    /// Sleep between ticks while a pass is incomplete
    pub poll_interval_secs: u64,
    /// Edge type linking applied nodes to their grounding
    pub default_link: RelationshipType,
    /// Run importance decay after a pass that consolidated something
    pub decay_after_pass: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            trigger_hour: 20,
            chunk_size: 10,
            grounding_top_k: 3,
            retry: RetryConfig::default(),
            extract_timeout_ms: 60_000,
            poll_interval_secs: 3600,
            default_link: RelationshipType::RelatedTo,
            decay_after_pass: false,
        }
    }
}

/// Per-user consolidation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsolidationState {
    #[default]
    Idle,
    Collecting,
    Chunking,
    ProcessingChunk { index: usize, total: usize },
}

impl ConsolidationState {
    pub fn can_transition(&self, next: ConsolidationState) -> bool {
        use ConsolidationState::*;
        match (*self, next) {
            (Idle, Collecting) => true,
            (Collecting, Idle) | (Collecting, Chunking) => true,
            (Chunking, ProcessingChunk { index: 0, total }) => total > 0,
            (ProcessingChunk { index, total }, ProcessingChunk { index: following, total: t }) => {
                t == total && following == index + 1 && following < total
            }
            (ProcessingChunk { .. }, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConsolidationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsolidationState::Idle => f.write_str("IDLE"),
            ConsolidationState::Collecting => f.write_str("COLLECTING"),
            ConsolidationState::Chunking => f.write_str("CHUNKING"),
            ConsolidationState::ProcessingChunk { index, total } => {
                write!(f, "PROCESSING_CHUNK({}/{})", index + 1, total)
            }
        }
    }
}

#[derive(Debug, Default)]
struct UserSchedule {
    state: ConsolidationState,
    /// Day of the last complete pass
    last_run: Option<NaiveDate>,
}

type Schedules = Arc<Mutex<HashMap<String, UserSchedule>>>;

fn lock(schedules: &Schedules) -> std::sync::MutexGuard<'_, HashMap<String, UserSchedule>> {
    schedules.lock().unwrap_or_else(|e| e.into_inner())
}

/// Puts the user back to IDLE however the pass ends
pub(crate) struct RunGuard {
    schedules: Schedules,
    user_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(schedule) = lock(&self.schedules).get_mut(&self.user_id) {
            schedule.state = ConsolidationState::Idle;
        }
    }
}

/// Items applied from one proposal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub added: usize,
    pub updated: usize,
    pub rejected: usize,
    pub edges: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Proposal applied and turns marked consolidated
    Consolidated,
    /// Extraction gave up; turns marked failed with the reason
    FailedSkipped(String),
    /// Connectivity lost; turns left pending for the next cycle
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    pub index: usize,
    pub turns: usize,
    pub outcome: ChunkOutcome,
    pub summary: ApplySummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub user_id: String,
    pub chunks: Vec<ChunkReport>,
    /// Every chunk was either consolidated or failed-skipped
    pub complete: bool,
}

impl PassReport {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            chunks: Vec::new(),
            complete: false,
        }
    }

    pub fn consolidated(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.outcome == ChunkOutcome::Consolidated)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| matches!(c.outcome, ChunkOutcome::FailedSkipped(_)))
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub passes: Vec<PassReport>,
    /// Users with pending turns who already had their pass today
    pub skipped_users: Vec<String>,
    /// Some user still has work that should be retried soon
    pub incomplete: bool,
}

/// Split turns into consecutive chunks of `size`; the last one may be short.
pub fn chunk_turns(turns: Vec<TranscriptTurn>, size: usize) -> Vec<Vec<TranscriptTurn>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(turns.len().div_ceil(size));
    let mut iter = turns.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(size).collect());
    }
    chunks
}

/// Time left until the next `hour:00` strictly after `now`
pub fn duration_until_next_trigger(now: DateTime<FixedOffset>, hour: u32) -> Duration {
    let local = now.naive_local();
    let Some(mut next) = local.date().and_hms_opt(hour.min(23), 0, 0) else {
        return Duration::from_secs(3600);
    };
    if next <= local {
        next += chrono::Duration::days(1);
    }
    (next - local).to_std().unwrap_or(Duration::ZERO)
}

/// Everything a chunk's items share while being applied
struct ChunkScope<'a> {
    namespace: Uuid,
    grounding: &'a [MemoryNode],
    session_id: &'a str,
    now: DateTime<Utc>,
}

pub struct ConsolidationPipeline {
    store: Arc<dyn GraphStore>,
    transcripts: Arc<dyn TranscriptLog>,
    embedder: Arc<dyn EmbeddingProvider>,
    retrieval: Arc<RetrievalEngine>,
    extractor: Arc<dyn Extractor>,
    clock: Arc<dyn Clock>,
    config: ConsolidationConfig,
    maintenance: MaintenanceConfig,
    schedules: Schedules,
}

impl ConsolidationPipeline {
    pub fn new(
        store: Arc<dyn GraphStore>,
        transcripts: Arc<dyn TranscriptLog>,
        embedder: Arc<dyn EmbeddingProvider>,
        retrieval: Arc<RetrievalEngine>,
        extractor: Arc<dyn Extractor>,
        clock: Arc<dyn Clock>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            store,
            transcripts,
            embedder,
            retrieval,
            extractor,
            clock,
            config,
            maintenance: MaintenanceConfig::default(),
            schedules: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Decay settings used when `decay_after_pass` is on
    pub fn with_maintenance(mut self, maintenance: MaintenanceConfig) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    pub fn state(&self, user_id: &str) -> ConsolidationState {
        lock(&self.schedules)
            .get(user_id)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Scheduled entry point: runs each pending user's daily pass once the trigger hour is reached.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_until(None).await
    }

    /// Forced pass for one user, ignoring the trigger hour and the daily limit.
    pub async fn run_user(&self, user_id: &str) -> Result<PassReport> {
        self.pass(user_id, None).await
    }

    /// Consolidate on the daily schedule until `shutdown` turns true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            trigger_hour = self.config.trigger_hour,
            chunk_size = self.config.chunk_size,
            extractor = self.extractor.name(),
            "consolidation loop started"
        );
        let poll = Duration::from_secs(self.config.poll_interval_secs.max(1));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.tick_until(Some(&shutdown)).await {
                Ok(report) if report.incomplete => poll,
                Ok(report) => {
                    if !report.passes.is_empty() {
                        info!(users = report.passes.len(), "daily consolidation finished");
                    }
                    duration_until_next_trigger(self.clock.now(), self.config.trigger_hour)
                }
                Err(e) => {
                    warn!(error = %e, "consolidation tick failed");
                    poll
                }
            };
            debug!(wait_secs = wait.as_secs(), "consolidation loop sleeping");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("consolidation loop stopped");
    }

    async fn tick_until(&self, stop: Option<&watch::Receiver<bool>>) -> Result<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();
        if now.hour() < self.config.trigger_hour {
            return Ok(report);
        }
        let today = now.date_naive();

        for user_id in self.transcripts.pending_users().await? {
            if stopping(stop) {
                report.incomplete = true;
                break;
            }
            if self.ran_on(&user_id, today) {
                report.skipped_users.push(user_id);
                continue;
            }
            match self.pass(&user_id, stop).await {
                Ok(pass) => {
                    report.incomplete |= !pass.complete;
                    report.passes.push(pass);
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "consolidation pass failed");
                    report.incomplete = true;
                }
            }
        }

        Ok(report)
    }

    async fn pass(&self, user_id: &str, stop: Option<&watch::Receiver<bool>>) -> Result<PassReport> {
        let _guard = self.begin(user_id)?;
        self.store.connect().await?;
        let result = self.consolidate_pending(user_id, stop).await;
        if let Err(e) = self.store.disconnect().await {
            warn!(user_id, error = %e, "failed to release graph store");
        }
        result
    }

    async fn consolidate_pending(
        &self,
        user_id: &str,
        stop: Option<&watch::Receiver<bool>>,
    ) -> Result<PassReport> {
        let mut report = PassReport::new(user_id);
        let turns = self.transcripts.unconsolidated(user_id).await?;
        if turns.is_empty() {
            self.transition(user_id, ConsolidationState::Idle)?;
            self.mark_ran(user_id);
            report.complete = true;
            return Ok(report);
        }

        self.transition(user_id, ConsolidationState::Chunking)?;
        let chunks = chunk_turns(turns, self.config.chunk_size);
        let total = chunks.len();
        info!(user_id, chunks = total, "consolidation pass started");

        for (index, chunk) in chunks.iter().enumerate() {
            if stopping(stop) {
                info!(user_id, index, "stop requested; remaining chunks stay pending");
                break;
            }
            self.transition(user_id, ConsolidationState::ProcessingChunk { index, total })?;
            let chunk_report = self.process_chunk(user_id, index, chunk).await;
            let aborted = matches!(chunk_report.outcome, ChunkOutcome::Aborted(_));
            report.chunks.push(chunk_report);
            if aborted {
                break;
            }
        }

        report.complete = report.chunks.len() == total
            && report
                .chunks
                .iter()
                .all(|c| !matches!(c.outcome, ChunkOutcome::Aborted(_)));
        if !report.chunks.is_empty() {
            self.transition(user_id, ConsolidationState::Idle)?;
        }
        if report.complete {
            self.mark_ran(user_id);
        }

        info!(
            user_id,
            consolidated = report.consolidated(),
            failed = report.failed(),
            complete = report.complete,
            "consolidation pass finished"
        );

        if self.config.decay_after_pass && report.consolidated() > 0 {
            if let Err(e) =
                run_maintenance(self.store.as_ref(), &self.maintenance, self.clock.now_utc()).await
            {
                warn!(user_id, error = %e, "post-pass decay failed");
            }
        }

        Ok(report)
    }

    async fn process_chunk(
        &self,
        user_id: &str,
        index: usize,
        chunk: &[TranscriptTurn],
    ) -> ChunkReport {
        let turn_ids: Vec<String> = chunk.iter().map(|t| t.turn_id.clone()).collect();
        let text = chunk
            .iter()
            .map(TranscriptTurn::line)
            .collect::<Vec<_>>()
            .join("\n");
        let mut report = ChunkReport {
            index,
            turns: chunk.len(),
            outcome: ChunkOutcome::Consolidated,
            summary: ApplySummary::default(),
        };

        let grounding = match self.ground(&text).await {
            Ok(grounding) => grounding,
            Err(e) => {
                warn!(user_id, index, error = %e, "grounding failed; chunk left pending");
                report.outcome = ChunkOutcome::Aborted(e.to_string());
                return report;
            }
        };

        let proposal = match self.extract(&text, &grounding).await {
            Ok(proposal) => proposal,
            Err(e) => {
                let reason = e.to_string();
                let now = self.clock.now_utc();
                report.outcome = match self.transcripts.mark_failed(&turn_ids, &reason, now).await {
                    Ok(()) => {
                        warn!(user_id, index, error = %reason, "extraction failed; chunk skipped for review");
                        ChunkOutcome::FailedSkipped(reason)
                    }
                    Err(mark_err) => {
                        warn!(user_id, index, error = %mark_err, "could not mark chunk failed");
                        ChunkOutcome::Aborted(mark_err.to_string())
                    }
                };
                return report;
            }
        };

        let scope = ChunkScope {
            namespace: Uuid::new_v5(&Uuid::NAMESPACE_OID, turn_ids.join(",").as_bytes()),
            grounding: &grounding,
            session_id: chunk.first().map(|t| t.session_id.as_str()).unwrap_or_default(),
            now: self.clock.now_utc(),
        };
        match self.apply_proposal(&proposal, &scope).await {
            Ok(summary) => report.summary = summary,
            Err(e) => {
                warn!(user_id, index, error = %e, "graph write failed; chunk left pending");
                report.outcome = ChunkOutcome::Aborted(e.to_string());
                return report;
            }
        }

        if let Err(e) = self
            .transcripts
            .mark_consolidated(&turn_ids, self.clock.now_utc())
            .await
        {
            warn!(user_id, index, error = %e, "could not mark chunk consolidated");
            report.outcome = ChunkOutcome::Aborted(e.to_string());
            return report;
        }

        debug!(
            user_id,
            index,
            added = report.summary.added,
            updated = report.summary.updated,
            rejected = report.summary.rejected,
            edges = report.summary.edges,
            "chunk consolidated"
        );
        report
    }

    async fn ground(&self, text: &str) -> Result<Vec<MemoryNode>> {
        let retrieval = self.retrieval.as_ref();
        let k = self.config.grounding_top_k.max(1);
        let memories = with_backoff(&self.config.retry, "grounding retrieval", move || {
            retrieval.retrieve_untracked(text, Some(k))
        })
        .await?;
        Ok(memories.into_iter().map(|m| m.node).collect())
    }

    async fn extract(&self, text: &str, grounding: &[MemoryNode]) -> Result<ExtractionProposal> {
        let extractor = self.extractor.as_ref();
        let timeout_ms = self.config.extract_timeout_ms;
        with_backoff(&self.config.retry, "extraction", move || async move {
            tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                extractor.extract(text, grounding),
            )
            .await
            .map_err(|_| {
                MemoryError::Connectivity(format!("extraction timed out after {timeout_ms}ms"))
            })?
        })
        .await
    }

    /// Apply every item independently. Only connectivity loss is returned as an error.
    async fn apply_proposal(
        &self,
        proposal: &ExtractionProposal,
        scope: &ChunkScope<'_>,
    ) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();

        for (index, item) in proposal.nodes_to_add.iter().enumerate() {
            match self.apply_add(item, scope).await {
                Ok(edges) => {
                    summary.added += 1;
                    summary.edges += edges;
                }
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    summary.rejected += 1;
                    warn!(item = index, error = %e, "proposed memory rejected");
                }
            }
        }

        for (index, item) in proposal.nodes_to_update.iter().enumerate() {
            match self.apply_update(item, scope).await {
                Ok(edges) => {
                    summary.updated += 1;
                    summary.edges += edges;
                }
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    summary.rejected += 1;
                    warn!(item = index, error = %e, "proposed update rejected");
                }
            }
        }

        Ok(summary)
    }

    /// Ids are keyed by the chunk plus the item's context and content, so a
    /// replay upserts each item onto its own node whatever order it arrives in
    async fn apply_add(&self, item: &serde_json::Value, scope: &ChunkScope<'_>) -> Result<usize> {
        let draft = NodeDraft::from_value(item)?;
        let link = draft.link_type;
        let grounded_on = draft.grounded_on.clone();
        let content = draft
            .fields
            .get("content")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .trim();
        let name = format!("add:{}:{content}", draft.context);
        let id = Uuid::new_v5(&scope.namespace, name.as_bytes()).to_string();
        let node = draft.into_node(id, scope.now)?;

        let embedding = self.embed(&node.content).await?;
        let edges = self.grounding_edges(&node, link, &grounded_on, scope);
        self.write(&node, Some(&embedding), &edges).await
    }

    async fn apply_update(
        &self,
        item: &serde_json::Value,
        scope: &ChunkScope<'_>,
    ) -> Result<usize> {
        let update = NodeUpdate::from_value(item)?;
        let store = self.store.as_ref();
        let id = update.memory_id.as_str();
        let mut node = with_backoff(&self.config.retry, "node load", move || store.load_node(id))
            .await?
            .ok_or_else(|| MemoryError::NotFound(update.memory_id.clone()))?;

        let previous_content = node.content.clone();
        let changed = node.apply_updates(&update.updates, scope.now)?;
        let embedding = if node.content != previous_content {
            Some(self.embed(&node.content).await?)
        } else {
            None
        };
        debug!(node_id = %node.id, fields = ?changed, "memory updated");

        let edges = self.grounding_edges(&node, update.link_type, &update.grounded_on, scope);
        self.write(&node, embedding.as_deref(), &edges).await
    }

    /// Edges from `node` to the grounding it was matched against, never to itself
    fn grounding_edges(
        &self,
        node: &MemoryNode,
        link: Option<RelationshipType>,
        grounded_on: &[NodeId],
        scope: &ChunkScope<'_>,
    ) -> Vec<MemoryEdge> {
        let link = link.unwrap_or(self.config.default_link);
        scope
            .grounding
            .iter()
            .filter(|g| g.id != node.id)
            .filter(|g| grounded_on.is_empty() || grounded_on.contains(&g.id))
            .map(|g| {
                let edge = MemoryEdge::new(link, node, g);
                if scope.session_id.is_empty() {
                    edge
                } else {
                    edge.with_source_conversation(scope.session_id)
                }
            })
            .collect()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = self.embedder.as_ref();
        let timeout_ms = self.retrieval.config().embed_timeout_ms;
        with_backoff(&self.config.retry, "embedding", move || async move {
            tokio::time::timeout(Duration::from_millis(timeout_ms), embed_one(embedder, text))
                .await
                .map_err(|_| {
                    MemoryError::Connectivity(format!("embedding timed out after {timeout_ms}ms"))
                })?
        })
        .await
    }

    async fn write(
        &self,
        node: &MemoryNode,
        embedding: Option<&[f32]>,
        edges: &[MemoryEdge],
    ) -> Result<usize> {
        let store = self.store.as_ref();
        let written = with_backoff(&self.config.retry, "node write", move || {
            store.upsert_node_with_edges(node, embedding, edges)
        })
        .await?;
        Ok(written.len())
    }

    pub(crate) fn begin(&self, user_id: &str) -> Result<RunGuard> {
        let mut schedules = lock(&self.schedules);
        let schedule = schedules.entry(user_id.to_string()).or_default();
        if schedule.state != ConsolidationState::Idle {
            return Err(MemoryError::InvalidOperation(format!(
                "consolidation for {user_id} is already {}",
                schedule.state
            )));
        }
        schedule.state = ConsolidationState::Collecting;
        Ok(RunGuard {
            schedules: Arc::clone(&self.schedules),
            user_id: user_id.to_string(),
        })
    }

    fn transition(&self, user_id: &str, next: ConsolidationState) -> Result<()> {
        let mut schedules = lock(&self.schedules);
        let schedule = schedules.entry(user_id.to_string()).or_default();
        if !schedule.state.can_transition(next) {
            return Err(MemoryError::InvalidOperation(format!(
                "illegal consolidation transition {} -> {next}",
                schedule.state
            )));
        }
        schedule.state = next;
        Ok(())
    }

    fn ran_on(&self, user_id: &str, day: NaiveDate) -> bool {
        lock(&self.schedules)
            .get(user_id)
            .is_some_and(|s| s.last_run == Some(day))
    }

    fn mark_ran(&self, user_id: &str) {
        let today = self.clock.now().date_naive();
        lock(&self.schedules)
            .entry(user_id.to_string())
            .or_default()
            .last_run = Some(today);
    }
}

fn stopping(stop: Option<&watch::Receiver<bool>>) -> bool {
    stop.is_some_and(|rx| *rx.borrow())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::retrieval::RetrievalConfig;
    use crate::store::SqliteGraphStore;
    use crate::testing::{self, InstrumentedStore, ScriptedExtractor};
    use crate::transcript::{Role, SqliteTranscriptLog, TranscriptConfig};
    use crate::graph_store::VectorIndex;
    use crate::types::{MemoryContext, NodeKind};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct Harness {
        pipeline: Arc<ConsolidationPipeline>,
        store: Arc<InstrumentedStore>,
        inner: Arc<SqliteGraphStore>,
        transcripts: Arc<SqliteTranscriptLog>,
        extractor: Arc<ScriptedExtractor>,
        clock: Arc<ManualClock>,
    }

    fn at(rfc3339: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap()
    }

    fn fast_config(chunk_size: usize) -> ConsolidationConfig {
        ConsolidationConfig {
            chunk_size,
            retry: RetryConfig {
                max_retries: 1,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                backoff_multiplier: 2.0,
            },
            extract_timeout_ms: 2_000,
            ..ConsolidationConfig::default()
        }
    }

    async fn harness(extractor: ScriptedExtractor, config: ConsolidationConfig) -> Harness {
        let inner = testing::memory_store().await;
        let store = Arc::new(InstrumentedStore::new(Arc::clone(&inner)));
        let transcripts = SqliteTranscriptLog::in_memory(TranscriptConfig::default())
            .await
            .unwrap();
        let embedder = testing::hash_embedder();
        let retrieval = Arc::new(RetrievalEngine::new(
            store.clone(),
            embedder.clone(),
            RetrievalConfig::default(),
        ));
        let extractor = Arc::new(extractor);
        let clock = Arc::new(ManualClock::new(at("2026-03-02T21:00:00+00:00")));
        let pipeline = Arc::new(ConsolidationPipeline::new(
            store.clone(),
            transcripts.clone(),
            embedder,
            retrieval,
            extractor.clone(),
            clock.clone(),
            config,
        ));
        Harness {
            pipeline,
            store,
            inner,
            transcripts,
            extractor,
            clock,
        }
    }

    async fn say(h: &Harness, user: &str, lines: &[&str]) -> Vec<TranscriptTurn> {
        let mut turns = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            let turn = h
                .transcripts
                .append(user, role, line, h.clock.now_utc())
                .await
                .unwrap();
            turns.push(turn);
        }
        turns
    }

    fn turn(seq: i64) -> TranscriptTurn {
        TranscriptTurn {
            seq,
            turn_id: format!("t{seq}"),
            user_id: "u".into(),
            session_id: "s".into(),
            role: Role::User,
            content: format!("line {seq}"),
            created_at: Utc::now(),
            status: crate::transcript::TurnStatus::Pending,
            failure_reason: None,
        }
    }

    #[test]
    fn chunks_keep_order_and_short_tail() {
        let turns: Vec<_> = (1..=25).map(turn).collect();
        let chunks = chunk_turns(turns, 10);
        let lengths: Vec<_> = chunks.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![10, 10, 5]);
        let seqs: Vec<i64> = chunks.iter().flatten().map(|t| t.seq).collect();
        assert_eq!(seqs, (1..=25).collect::<Vec<_>>());
        assert!(chunk_turns(Vec::new(), 10).is_empty());
    }

    #[test]
    fn state_machine_rejects_illegal_moves() {
        use ConsolidationState::*;
        assert!(Idle.can_transition(Collecting));
        assert!(Collecting.can_transition(Idle));
        assert!(Collecting.can_transition(Chunking));
        assert!(Chunking.can_transition(ProcessingChunk { index: 0, total: 2 }));
        assert!(ProcessingChunk { index: 0, total: 2 }
            .can_transition(ProcessingChunk { index: 1, total: 2 }));
        assert!(ProcessingChunk { index: 1, total: 2 }.can_transition(Idle));

        assert!(!Idle.can_transition(Chunking));
        assert!(!Chunking.can_transition(ProcessingChunk { index: 0, total: 0 }));
        assert!(!Chunking.can_transition(ProcessingChunk { index: 1, total: 2 }));
        assert!(!ProcessingChunk { index: 1, total: 2 }
            .can_transition(ProcessingChunk { index: 2, total: 2 }));
        assert!(!Collecting.can_transition(Collecting));
        assert_eq!(ProcessingChunk { index: 0, total: 3 }.to_string(), "PROCESSING_CHUNK(1/3)");
    }

    #[test]
    fn next_trigger_is_later_today_or_tomorrow() {
        let before = duration_until_next_trigger(at("2026-03-02T18:30:00+02:00"), 20);
        assert_eq!(before, Duration::from_secs(90 * 60));

        let after = duration_until_next_trigger(at("2026-03-02T20:00:00+02:00"), 20);
        assert_eq!(after, Duration::from_secs(24 * 3600));
    }

    #[tokio::test]
    async fn proposal_updates_grounding_and_adds_one_node() {
        let john = testing::john();
        let extractor = ScriptedExtractor::new().then_json(json!({
            "nodes_to_add": [{
                "memory_context": "EXPERIENCE",
                "content": "User debugged a script with John",
                "event_type": "pair_programming"
            }],
            "nodes_to_update": [{
                "memory_id": john.id,
                "updates": {"interaction_frequency": 0.9}
            }]
        }));
        let h = harness(extractor, fast_config(10)).await;
        testing::seed(h.inner.as_ref(), &*testing::hash_embedder(), &john).await;
        say(&h, "u", &["John helped me debug my script", "Glad it works now"]).await;

        let report = h.pipeline.run_user("u").await.unwrap();
        assert!(report.complete);
        let chunk = &report.chunks[0];
        assert_eq!(chunk.outcome, ChunkOutcome::Consolidated);
        assert_eq!(chunk.summary.added, 1);
        assert_eq!(chunk.summary.updated, 1);
        assert_eq!(chunk.summary.rejected, 0);
        assert_eq!(chunk.summary.edges, 1);

        let calls = h.extractor.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.starts_with("user: John helped me"));
        assert_eq!(calls[0].1, vec![john.id.clone()]);

        let stats = h.inner.stats().await.unwrap();
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.total_edges, 1);

        let updated = h.inner.load_node(&john.id).await.unwrap().unwrap();
        match &updated.kind {
            NodeKind::Relationship(d) => assert!((d.interaction_frequency - 0.9).abs() < 1e-6),
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(updated.updated_at > john.updated_at);

        let neighbors = h.inner.neighbors(&john.id, Utc::now()).await.unwrap();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].content, "User debugged a script with John");

        assert!(h.transcripts.unconsolidated("u").await.unwrap().is_empty());
        assert_eq!(h.pipeline.state("u"), ConsolidationState::Idle);
    }

    #[tokio::test]
    async fn second_tick_on_the_same_day_writes_nothing() {
        let extractor = ScriptedExtractor::new().then_json(json!({
            "nodes_to_add": [{"memory_context": "EXPERIENCE", "content": "Went hiking", "event_type": "outing"}]
        }));
        let h = harness(extractor, fast_config(10)).await;
        say(&h, "u", &["I went hiking", "Sounds fun"]).await;

        let first = h.pipeline.tick().await.unwrap();
        assert_eq!(first.passes.len(), 1);
        assert!(!first.incomplete);
        let writes = h.store.writes.load(Ordering::SeqCst);
        assert_eq!(writes, 1);

        say(&h, "u", &["One more thing"]).await;
        h.clock.advance(chrono::Duration::hours(1));
        let second = h.pipeline.tick().await.unwrap();
        assert!(second.passes.is_empty());
        assert_eq!(second.skipped_users, vec!["u".to_string()]);
        assert_eq!(h.store.writes.load(Ordering::SeqCst), writes);
        assert_eq!(h.extractor.calls().len(), 1);

        // The next day's trigger picks up the leftover turn
        h.clock.advance(chrono::Duration::days(1));
        let third = h.pipeline.tick().await.unwrap();
        assert_eq!(third.passes.len(), 1);
        assert_eq!(h.extractor.calls().len(), 2);
    }

    #[tokio::test]
    async fn nothing_runs_before_the_trigger_hour() {
        let h = harness(ScriptedExtractor::new(), fast_config(10)).await;
        h.clock.set(at("2026-03-02T19:59:00+00:00"));
        say(&h, "u", &["hello"]).await;

        let report = h.pipeline.tick().await.unwrap();
        assert_eq!(report, TickReport::default());
        assert_eq!(h.transcripts.unconsolidated("u").await.unwrap().len(), 1);

        // A forced pass ignores the hour
        let pass = h.pipeline.run_user("u").await.unwrap();
        assert_eq!(pass.consolidated(), 1);
    }

    #[tokio::test]
    async fn exhausted_extraction_marks_chunk_failed_and_moves_on() {
        let extractor = ScriptedExtractor::new()
            .then_err(MemoryError::Connectivity("extractor down".into()))
            .then_err(MemoryError::Connectivity("extractor down".into()))
            .then_json(json!({
                "nodes_to_add": [{"memory_context": "EXPERIENCE", "content": "Read a book", "event_type": "reading"}]
            }));
        let h = harness(extractor, fast_config(2)).await;
        say(&h, "u", &["a", "b", "c", "d"]).await;

        let report = h.pipeline.run_user("u").await.unwrap();
        assert!(report.complete);
        assert!(matches!(report.chunks[0].outcome, ChunkOutcome::FailedSkipped(_)));
        assert_eq!(report.chunks[1].outcome, ChunkOutcome::Consolidated);
        assert_eq!(h.extractor.calls().len(), 3);

        let failed = h.transcripts.failed("u").await.unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed[0].failure_reason.as_deref().unwrap().contains("exhausted"));
        assert!(h.transcripts.unconsolidated("u").await.unwrap().is_empty());
        assert_eq!(h.inner.stats().await.unwrap().total_nodes, 1);
    }

    #[tokio::test]
    async fn malformed_proposal_is_skipped_without_retry() {
        let extractor = ScriptedExtractor::new()
            .then_err(MemoryError::Validation("proposal is not JSON".into()));
        let h = harness(extractor, fast_config(10)).await;
        say(&h, "u", &["hi"]).await;

        let report = h.pipeline.run_user("u").await.unwrap();
        assert!(matches!(report.chunks[0].outcome, ChunkOutcome::FailedSkipped(_)));
        assert_eq!(h.extractor.calls().len(), 1);
        assert_eq!(h.transcripts.failed("u").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn grounding_outage_leaves_turns_pending() {
        let h = harness(ScriptedExtractor::new(), fast_config(10)).await;
        say(&h, "u", &["hi", "hello"]).await;
        h.store.fail_reads.store(true, Ordering::SeqCst);

        let report = h.pipeline.run_user("u").await.unwrap();
        assert!(!report.complete);
        assert!(matches!(report.chunks[0].outcome, ChunkOutcome::Aborted(_)));
        assert!(h.extractor.calls().is_empty());
        assert_eq!(h.transcripts.unconsolidated("u").await.unwrap().len(), 2);
        assert_eq!(h.pipeline.state("u"), ConsolidationState::Idle);

        // An incomplete pass does not use up the day
        h.store.fail_reads.store(false, Ordering::SeqCst);
        let tick = h.pipeline.tick().await.unwrap();
        assert_eq!(tick.passes.len(), 1);
        assert!(h.transcripts.unconsolidated("u").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_outage_aborts_and_replay_does_not_duplicate() {
        let proposal = json!({
            "nodes_to_add": [{"memory_context": "EXPERIENCE", "content": "Baked bread", "event_type": "cooking"}]
        });
        let extractor = ScriptedExtractor::new()
            .then_json(proposal.clone())
            .then_json(proposal);
        let h = harness(extractor, fast_config(10)).await;
        say(&h, "u", &["I baked bread"]).await;

        h.store.fail_writes.store(true, Ordering::SeqCst);
        let report = h.pipeline.run_user("u").await.unwrap();
        assert!(matches!(report.chunks[0].outcome, ChunkOutcome::Aborted(_)));
        assert_eq!(h.transcripts.unconsolidated("u").await.unwrap().len(), 1);
        assert_eq!(h.inner.stats().await.unwrap().total_nodes, 0);

        h.store.fail_writes.store(false, Ordering::SeqCst);
        let report = h.pipeline.run_user("u").await.unwrap();
        assert_eq!(report.chunks[0].outcome, ChunkOutcome::Consolidated);
        assert_eq!(h.inner.stats().await.unwrap().total_nodes, 1);
    }

    #[tokio::test]
    async fn replayed_proposal_merges_by_id() {
        let h = harness(ScriptedExtractor::new(), fast_config(10)).await;
        let proposal: ExtractionProposal = serde_json::from_value(json!({
            "nodes_to_add": [{"memory_context": "KNOWLEDGE", "content": "Rust has ownership",
                "concept": "ownership", "definition": "one owner per value", "category": "rust"}]
        }))
        .unwrap();
        let grounding = Vec::new();
        let scope = ChunkScope {
            namespace: Uuid::new_v5(&Uuid::NAMESPACE_OID, b"t1,t2"),
            grounding: &grounding,
            session_id: "s",
            now: Utc::now(),
        };

        h.pipeline.apply_proposal(&proposal, &scope).await.unwrap();
        h.pipeline.apply_proposal(&proposal, &scope).await.unwrap();
        assert_eq!(h.inner.stats().await.unwrap().total_nodes, 1);
    }

    #[tokio::test]
    async fn reordered_replay_keeps_each_item_on_its_own_node() {
        let h = harness(ScriptedExtractor::new(), fast_config(10)).await;
        let bread = json!({"memory_context": "EXPERIENCE", "content": "Baked bread", "event_type": "cooking"});
        let yeast = json!({"memory_context": "KNOWLEDGE", "content": "Yeast needs warmth",
            "concept": "yeast", "definition": "a leavening fungus", "category": "baking"});
        let first: ExtractionProposal =
            serde_json::from_value(json!({ "nodes_to_add": [bread.clone(), yeast.clone()] })).unwrap();
        let replay: ExtractionProposal =
            serde_json::from_value(json!({ "nodes_to_add": [yeast, bread] })).unwrap();
        let grounding = Vec::new();
        let scope = ChunkScope {
            namespace: Uuid::new_v5(&Uuid::NAMESPACE_OID, b"t1"),
            grounding: &grounding,
            session_id: "s",
            now: Utc::now(),
        };

        h.pipeline.apply_proposal(&first, &scope).await.unwrap();
        h.pipeline.apply_proposal(&replay, &scope).await.unwrap();

        let stats = h.inner.stats().await.unwrap();
        assert_eq!(stats.total_nodes, 2);
        let knowledge = h
            .inner
            .list_nodes(Some(MemoryContext::Knowledge), 10)
            .await
            .unwrap();
        assert_eq!(knowledge.len(), 1);
        assert_eq!(knowledge[0].content, "Yeast needs warmth");
        let experiences = h
            .inner
            .list_nodes(Some(MemoryContext::Experience), 10)
            .await
            .unwrap();
        assert_eq!(experiences.len(), 1);
        assert_eq!(experiences[0].content, "Baked bread");
    }

    #[tokio::test]
    async fn content_update_re_embeds_the_node() {
        let h = harness(ScriptedExtractor::new(), fast_config(10)).await;
        let embedder = testing::hash_embedder();
        let note = testing::experience("Walked the dog in the park");
        let other = testing::experience("Sourdough starter needs feeding daily");
        testing::seed(h.inner.as_ref(), embedder.as_ref(), &note).await;
        testing::seed(h.inner.as_ref(), embedder.as_ref(), &other).await;

        let new_text = "Repaired the bicycle chain with Priya";
        let proposal: ExtractionProposal = serde_json::from_value(json!({
            "nodes_to_update": [{"memory_id": note.id.clone(), "updates": {"content": new_text}}]
        }))
        .unwrap();
        let grounding = Vec::new();
        let scope = ChunkScope {
            namespace: Uuid::new_v5(&Uuid::NAMESPACE_OID, b"t9"),
            grounding: &grounding,
            session_id: "s",
            now: Utc::now(),
        };
        let summary = h.pipeline.apply_proposal(&proposal, &scope).await.unwrap();
        assert_eq!(summary.updated, 1);

        let query = embed_one(embedder.as_ref(), new_text).await.unwrap();
        let hits = h
            .inner
            .nearest(&VectorIndex::default(), &query, 1)
            .await
            .unwrap();
        assert_eq!(hits[0].node.id, note.id);
        assert_eq!(hits[0].node.content, new_text);
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn bad_items_do_not_roll_back_siblings() {
        let john = testing::john();
        let extractor = ScriptedExtractor::new().then_json(json!({
            "nodes_to_add": [
                {"memory_context": "EXPERIENCE", "content": "Lunch with John", "event_type": "meal",
                 "link_type": "EXPERIENCE_TO_RELATIONSHIP"},
                {"memory_context": "KNOWLEDGE", "content": "Half a fact", "concept": "x"},
                {"type": "EXPERIENCE", "content": "   ", "event_type": "void"}
            ],
            "nodes_to_update": [
                {"memory_id": "missing-node", "updates": {"importance": 0.9}}
            ]
        }));
        let h = harness(extractor, fast_config(10)).await;
        testing::seed(h.inner.as_ref(), &*testing::hash_embedder(), &john).await;
        say(&h, "u", &["Had lunch with John"]).await;

        let report = h.pipeline.run_user("u").await.unwrap();
        let chunk = &report.chunks[0];
        assert_eq!(chunk.outcome, ChunkOutcome::Consolidated);
        assert_eq!(chunk.summary.added, 1);
        assert_eq!(chunk.summary.rejected, 3);

        let edges = h.inner.edges(&john.id).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relationship_type, RelationshipType::ExperienceToRelationship);
        assert_eq!(edges[0].to_id, john.id);
    }

    #[tokio::test]
    async fn concurrent_run_for_a_user_is_refused() {
        let h = harness(ScriptedExtractor::new(), fast_config(10)).await;
        say(&h, "u", &["hi"]).await;

        let guard = h.pipeline.begin("u").unwrap();
        assert_eq!(h.pipeline.state("u"), ConsolidationState::Collecting);
        let err = h.pipeline.run_user("u").await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidOperation(_)));

        drop(guard);
        assert_eq!(h.pipeline.state("u"), ConsolidationState::Idle);
        assert!(h.pipeline.run_user("u").await.unwrap().complete);
    }

    #[tokio::test]
    async fn decay_runs_after_a_productive_pass() {
        let extractor = ScriptedExtractor::new().then_json(json!({
            "nodes_to_add": [{"memory_context": "EXPERIENCE", "content": "Moved house", "event_type": "life"}]
        }));
        let config = ConsolidationConfig {
            decay_after_pass: true,
            ..fast_config(10)
        };
        let h = harness(extractor, config).await;
        let now = h.clock.now_utc();
        let mut old = testing::experience("An old memory");
        old.created_at = now - chrono::Duration::days(90);
        old.updated_at = now - chrono::Duration::days(20);
        old.importance = 0.8;
        h.inner.upsert_node(&old, None).await.unwrap();
        say(&h, "u", &["I moved house"]).await;

        h.pipeline.run_user("u").await.unwrap();
        let decayed = h.inner.load_node(&old.id).await.unwrap().unwrap();
        assert!(decayed.importance < 0.8);
    }

    #[tokio::test]
    async fn loop_stops_on_signal() {
        let h = harness(ScriptedExtractor::new(), fast_config(10)).await;
        h.clock.set(at("2026-03-02T08:00:00+00:00"));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&h.pipeline).run(rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
