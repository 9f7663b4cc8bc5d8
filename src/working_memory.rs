//! Per-session working memory: the live Current node and recent turns
//!
//! Everything here is synchronous and in-process; nothing touches a store.

use crate::clock::{time_bucket_of, Clock};
use crate::error::{MemoryError, Result};
use crate::transcript::Role;
use crate::types::{CurrentDetails, MemoryNode, NodeKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

/// Working-memory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingMemoryConfig {
    /// Turns kept in the rolling history
    pub history_capacity: usize,
}

impl Default for WorkingMemoryConfig {
    fn default() -> Self {
        Self {
            history_capacity: 10,
        }
    }
}

/// One remembered turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedTurn {
    pub role: Role,
    pub content: String,
}

pub struct WorkingMemory {
    user_id: String,
    session_id: String,
    /// Envelope of the Current node; its kind is synced from `details` on every mutation
    current: MemoryNode,
    details: CurrentDetails,
    history: VecDeque<BufferedTurn>,
    capacity: usize,
    last_interaction: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WorkingMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingMemory")
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("focus", &self.focus())
            .field("turns", &self.history.len())
            .finish()
    }
}

impl WorkingMemory {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        config: &WorkingMemoryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let now = clock.now();
        let mut details = CurrentDetails::new("greeting", time_bucket_of(&now));
        details.current_mood = 0.1;
        details.stress_level = 0.0;
        let current = MemoryNode::new_at(
            "Initializing new conversation context.",
            NodeKind::Current(details.clone()),
            now.with_timezone(&Utc),
        )?;

        Ok(Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            current,
            details,
            history: VecDeque::with_capacity(config.history_capacity),
            capacity: config.history_capacity.max(1),
            last_interaction: now.with_timezone(&Utc),
            clock,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The live Current node
    pub fn current(&self) -> &MemoryNode {
        &self.current
    }

    pub fn history(&self) -> impl Iterator<Item = &BufferedTurn> {
        self.history.iter()
    }

    pub fn last_interaction(&self) -> DateTime<Utc> {
        self.last_interaction
    }

    pub fn details(&self) -> &CurrentDetails {
        &self.details
    }

    pub fn focus(&self) -> &str {
        &self.details.current_focus
    }

    pub fn mood(&self) -> f32 {
        self.details.current_mood
    }

    pub fn stress(&self) -> f32 {
        self.details.stress_level
    }

    /// Record a turn, evicting the oldest beyond capacity
    pub fn observe(&mut self, role: Role, text: &str) -> Result<()> {
        self.history.push_back(BufferedTurn {
            role,
            content: text.to_string(),
        });
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }

        let now = self.clock.now();
        self.last_interaction = now.with_timezone(&Utc);
        self.current.content = format!("Last message from {role}: {text}");
        self.details.time_context = time_bucket_of(&now).to_string();
        self.touch()
    }

    /// Replace the focus; a non-empty entity list also replaces the recent references
    pub fn update_focus(&mut self, topic: &str, entities: &[String]) -> Result<()> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(MemoryError::Validation("focus cannot be empty".into()));
        }
        self.details.current_focus = topic.to_string();
        if !entities.is_empty() {
            self.details.recent_relationships = entities.to_vec();
        }
        tracing::debug!(session_id = %self.session_id, focus = topic, "focus updated");
        self.touch()
    }

    /// Shift mood and stress, clamped to [-1, 1] and [0, 1]
    pub fn update_mood(&mut self, mood_delta: f32, stress_delta: f32) -> Result<()> {
        let details = &mut self.details;
        details.current_mood = (details.current_mood + mood_delta).clamp(-1.0, 1.0);
        details.stress_level = (details.stress_level + stress_delta).clamp(0.0, 1.0);
        self.touch()
    }

    /// Fixed-format block for prompt injection
    pub fn snapshot(&self) -> String {
        let details = &self.details;
        let mut out = String::new();
        let _ = writeln!(out, "[START of Real-Time Context]");
        let _ = writeln!(out, "Current Focus: {}", details.current_focus);
        let _ = writeln!(out, "Time Context: {}", details.time_context);
        let _ = writeln!(
            out,
            "Current Mood: {:.2} (from -1 sad to 1 happy)",
            details.current_mood
        );
        let _ = writeln!(
            out,
            "Current Stress: {:.2} (from 0 calm to 1 stressed)",
            details.stress_level
        );
        let _ = writeln!(
            out,
            "Recent Conversation History (last {} turns):",
            self.history.len()
        );
        for turn in &self.history {
            let _ = writeln!(out, "{}: {}", turn.role, turn.content);
        }
        out.push_str("[END of Real-Time Context]");
        out
    }

    /// Sync the details into the node and revalidate it
    fn touch(&mut self) -> Result<()> {
        let now = self.clock.now_utc();
        self.current.kind = NodeKind::Current(self.details.clone());
        self.current.revalidate(now)?;
        if let NodeKind::Current(details) = &self.current.kind {
            self.details = details.clone();
        }
        Ok(())
    }
}
