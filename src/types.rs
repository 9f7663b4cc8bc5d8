//! Memory contexts, the node envelope and its four variants

use crate::error::{MemoryError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Unique identifier for memory nodes
pub type NodeId = String;

/// How a memory is organized and retrieved
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryContext {
    /// What happened + what was learned from it
    Experience,
    /// What is known + how it is used
    Knowledge,
    /// Who is known + how we interact
    Relationship,
    /// What is in focus right now
    Current,
}

impl MemoryContext {
    /// All memory contexts
    pub const ALL: &[MemoryContext] = &[
        MemoryContext::Experience,
        MemoryContext::Knowledge,
        MemoryContext::Relationship,
        MemoryContext::Current,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryContext::Experience => "EXPERIENCE",
            MemoryContext::Knowledge => "KNOWLEDGE",
            MemoryContext::Relationship => "RELATIONSHIP",
            MemoryContext::Current => "CURRENT",
        }
    }

    /// Default cross-context relevance weights for a node owned by this context
    pub fn default_relevance(&self) -> BTreeMap<MemoryContext, f32> {
        let weight = match self {
            MemoryContext::Current => 0.8,
            _ => 0.5,
        };
        MemoryContext::ALL
            .iter()
            .filter(|c| *c != self)
            .map(|c| (*c, weight))
            .collect()
    }
}

impl std::fmt::Display for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryContext {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EXPERIENCE" => Ok(MemoryContext::Experience),
            "KNOWLEDGE" => Ok(MemoryContext::Knowledge),
            "RELATIONSHIP" => Ok(MemoryContext::Relationship),
            "CURRENT" => Ok(MemoryContext::Current),
            other => Err(MemoryError::Validation(format!(
                "unknown memory context: {other}"
            ))),
        }
    }
}

/// Clamp into [0, 1]; NaN collapses to 0.
pub(crate) fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Clamp into [-1, 1]; NaN collapses to 0.
pub(crate) fn clamp_signed(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(-1.0, 1.0)
    }
}

fn half() -> f32 {
    0.5
}

fn casual() -> String {
    "casual".to_string()
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MemoryError::Validation(format!("`{field}` cannot be empty")));
    }
    Ok(())
}

/// What happened to me + what I learned from it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperienceDetails {
    /// meeting, conversation, problem_solving, ...
    pub event_type: String,
    #[serde(default = "Utc::now", alias = "timestamp")]
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub lessons_learned: Vec<String>,
    #[serde(default)]
    pub insights_gained: Vec<String>,
    #[serde(default)]
    pub skills_practiced: Vec<String>,
    /// -1.0 to 1.0
    #[serde(default)]
    pub emotional_tone: f32,
    #[serde(default = "half")]
    pub social_significance: f32,
    #[serde(default = "half")]
    pub personal_impact: f32,
}

impl ExperienceDetails {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            occurred_at: Utc::now(),
            participants: Vec::new(),
            location: None,
            lessons_learned: Vec::new(),
            insights_gained: Vec::new(),
            skills_practiced: Vec::new(),
            emotional_tone: 0.0,
            social_significance: 0.5,
            personal_impact: 0.5,
        }
    }
}

/// What I know + how I use it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeDetails {
    pub concept: String,
    pub definition: String,
    pub category: String,
    #[serde(default)]
    pub how_to_use: Vec<String>,
    #[serde(default)]
    pub practical_examples: Vec<String>,
    #[serde(default)]
    pub use_cases: Vec<String>,
    #[serde(default)]
    pub understanding_level: f32,
    #[serde(default = "half")]
    pub confidence_level: f32,
    #[serde(default)]
    pub mastery_level: f32,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub related_concepts: Vec<String>,
    #[serde(default)]
    pub applications: Vec<String>,
}

impl KnowledgeDetails {
    pub fn new(
        concept: impl Into<String>,
        definition: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            concept: concept.into(),
            definition: definition.into(),
            category: category.into(),
            how_to_use: Vec::new(),
            practical_examples: Vec::new(),
            use_cases: Vec::new(),
            understanding_level: 0.0,
            confidence_level: 0.5,
            mastery_level: 0.0,
            prerequisites: Vec::new(),
            related_concepts: Vec::new(),
            applications: Vec::new(),
        }
    }
}

/// Who I know + how I feel + how we interact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipDetails {
    pub person_name: String,
    /// friend, family, colleague, ...
    pub relationship_type: String,
    #[serde(default = "half")]
    pub relationship_strength: f32,
    /// -1.0 to 1.0
    #[serde(default)]
    pub emotional_connection: f32,
    #[serde(default = "half")]
    pub trust_level: f32,
    #[serde(default)]
    pub intimacy_level: f32,
    #[serde(default)]
    pub interaction_frequency: f32,
    #[serde(default)]
    pub interaction_contexts: Vec<String>,
    #[serde(default = "casual")]
    pub communication_style: String,
    #[serde(default)]
    pub personality_traits: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub power_dynamic: Option<String>,
    #[serde(default)]
    pub support_patterns: Vec<String>,
    #[serde(default)]
    pub conflict_patterns: Vec<String>,
}

impl RelationshipDetails {
    pub fn new(person_name: impl Into<String>, relationship_type: impl Into<String>) -> Self {
        Self {
            person_name: person_name.into(),
            relationship_type: relationship_type.into(),
            relationship_strength: 0.5,
            emotional_connection: 0.0,
            trust_level: 0.5,
            intimacy_level: 0.0,
            interaction_frequency: 0.0,
            interaction_contexts: Vec::new(),
            communication_style: casual(),
            personality_traits: Vec::new(),
            interests: Vec::new(),
            skills: Vec::new(),
            power_dynamic: None,
            support_patterns: Vec::new(),
            conflict_patterns: Vec::new(),
        }
    }
}

/// What I'm thinking about now
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentDetails {
    #[serde(alias = "focus")]
    pub current_focus: String,
    #[serde(default = "half")]
    pub attention_span: f32,
    #[serde(default = "half")]
    pub cognitive_load: f32,
    #[serde(default)]
    pub active_context: Map<String, Value>,
    #[serde(default)]
    pub current_goals: Vec<String>,
    #[serde(default)]
    pub current_tasks: Vec<String>,
    #[serde(default)]
    pub recent_experiences: Vec<NodeId>,
    #[serde(default)]
    pub recent_knowledge: Vec<NodeId>,
    #[serde(default)]
    pub recent_relationships: Vec<NodeId>,
    /// morning, afternoon, evening, night, ...
    pub time_context: String,
    #[serde(default = "half")]
    pub urgency_level: f32,
    #[serde(default)]
    pub deadline_pressure: f32,
    /// -1.0 to 1.0
    #[serde(default)]
    pub current_mood: f32,
    #[serde(default)]
    pub stress_level: f32,
    #[serde(default = "half")]
    pub energy_level: f32,
}

impl CurrentDetails {
    pub fn new(current_focus: impl Into<String>, time_context: impl Into<String>) -> Self {
        Self {
            current_focus: current_focus.into(),
            attention_span: 0.5,
            cognitive_load: 0.5,
            active_context: Map::new(),
            current_goals: Vec::new(),
            current_tasks: Vec::new(),
            recent_experiences: Vec::new(),
            recent_knowledge: Vec::new(),
            recent_relationships: Vec::new(),
            time_context: time_context.into(),
            urgency_level: 0.5,
            deadline_pressure: 0.0,
            current_mood: 0.0,
            stress_level: 0.0,
            energy_level: 0.5,
        }
    }
}

/// Variant-specific payload, tagged by the owning context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "memory_context", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Experience(ExperienceDetails),
    Knowledge(KnowledgeDetails),
    Relationship(RelationshipDetails),
    Current(CurrentDetails),
}

impl NodeKind {
    pub fn context(&self) -> MemoryContext {
        match self {
            NodeKind::Experience(_) => MemoryContext::Experience,
            NodeKind::Knowledge(_) => MemoryContext::Knowledge,
            NodeKind::Relationship(_) => MemoryContext::Relationship,
            NodeKind::Current(_) => MemoryContext::Current,
        }
    }

    /// Build the variant for `context` from loose JSON fields.
    ///
    /// Keys that belong to other variants or to the envelope are ignored;
    /// a missing required key is a validation error.
    pub fn from_fields(context: MemoryContext, fields: &Map<String, Value>) -> Result<Self> {
        let value = Value::Object(fields.clone());
        let kind = match context {
            MemoryContext::Experience => serde_json::from_value(value).map(NodeKind::Experience),
            MemoryContext::Knowledge => serde_json::from_value(value).map(NodeKind::Knowledge),
            MemoryContext::Relationship => {
                serde_json::from_value(value).map(NodeKind::Relationship)
            }
            MemoryContext::Current => serde_json::from_value(value).map(NodeKind::Current),
        };
        kind.map_err(|e| MemoryError::Validation(format!("{context}: {e}")))
    }

    fn clamp_scores(&mut self) {
        match self {
            NodeKind::Experience(d) => {
                d.emotional_tone = clamp_signed(d.emotional_tone);
                d.social_significance = clamp_unit(d.social_significance);
                d.personal_impact = clamp_unit(d.personal_impact);
            }
            NodeKind::Knowledge(d) => {
                d.understanding_level = clamp_unit(d.understanding_level);
                d.confidence_level = clamp_unit(d.confidence_level);
                d.mastery_level = clamp_unit(d.mastery_level);
            }
            NodeKind::Relationship(d) => {
                d.relationship_strength = clamp_unit(d.relationship_strength);
                d.emotional_connection = clamp_signed(d.emotional_connection);
                d.trust_level = clamp_unit(d.trust_level);
                d.intimacy_level = clamp_unit(d.intimacy_level);
                d.interaction_frequency = clamp_unit(d.interaction_frequency);
            }
            NodeKind::Current(d) => {
                d.attention_span = clamp_unit(d.attention_span);
                d.cognitive_load = clamp_unit(d.cognitive_load);
                d.urgency_level = clamp_unit(d.urgency_level);
                d.deadline_pressure = clamp_unit(d.deadline_pressure);
                d.current_mood = clamp_signed(d.current_mood);
                d.stress_level = clamp_unit(d.stress_level);
                d.energy_level = clamp_unit(d.energy_level);
            }
        }
    }

    fn check_required(&self) -> Result<()> {
        match self {
            NodeKind::Experience(d) => require("event_type", &d.event_type),
            NodeKind::Knowledge(d) => {
                require("concept", &d.concept)?;
                require("definition", &d.definition)?;
                require("category", &d.category)
            }
            NodeKind::Relationship(d) => {
                require("person_name", &d.person_name)?;
                require("relationship_type", &d.relationship_type)
            }
            NodeKind::Current(d) => {
                require("current_focus", &d.current_focus)?;
                require("time_context", &d.time_context)
            }
        }
    }
}

/// A persisted memory unit belonging to exactly one context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryNode {
    /// Unique identifier
    pub id: NodeId,
    /// The memory content (never empty after trimming)
    pub content: String,
    pub description: Option<String>,
    /// Importance score (0.0 - 1.0)
    pub importance: f32,
    /// Emotional significance (-1.0 to 1.0)
    pub emotional_significance: f32,
    /// Confidence in the extraction (0.0 - 1.0)
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
    /// Strictly advances on every mutation
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: i64,
    pub tags: BTreeSet<String>,
    pub metadata: Map<String, Value>,
    /// Relevance of this memory to each *other* context (0.0 - 1.0)
    pub context_relevance: BTreeMap<MemoryContext, f32>,
    pub kind: NodeKind,
}

/// Envelope keys understood by [`MemoryNode::from_fields`] and [`MemoryNode::apply_updates`].
const ENVELOPE_KEYS: &[&str] = &[
    "content",
    "description",
    "importance",
    "emotional_significance",
    "confidence",
    "tags",
    "metadata",
    "context_relevance",
];

/// Keys an update may echo back but never change.
const FROZEN_KEYS: &[&str] = &[
    "id",
    "memory_id",
    "created_at",
    "updated_at",
    "last_accessed_at",
    "access_count",
];

impl MemoryNode {
    /// Create a validated node with default scores
    pub fn new(content: impl Into<String>, kind: NodeKind) -> Result<Self> {
        Self::new_at(content, kind, Utc::now())
    }

    /// Create a validated node stamped with `now`
    pub fn new_at(content: impl Into<String>, kind: NodeKind, now: DateTime<Utc>) -> Result<Self> {
        let context = kind.context();
        let mut node = Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            description: None,
            importance: 0.5,
            emotional_significance: 0.0,
            confidence: 0.8,
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
            access_count: 0,
            tags: BTreeSet::new(),
            metadata: Map::new(),
            context_relevance: context.default_relevance(),
            kind,
        };
        node.normalize()?;
        Ok(node)
    }

    pub fn experience(content: impl Into<String>, event_type: impl Into<String>) -> Result<Self> {
        Self::new(content, NodeKind::Experience(ExperienceDetails::new(event_type)))
    }

    pub fn knowledge(
        content: impl Into<String>,
        concept: impl Into<String>,
        definition: impl Into<String>,
        category: impl Into<String>,
    ) -> Result<Self> {
        Self::new(
            content,
            NodeKind::Knowledge(KnowledgeDetails::new(concept, definition, category)),
        )
    }

    pub fn relationship(
        content: impl Into<String>,
        person_name: impl Into<String>,
        relationship_type: impl Into<String>,
    ) -> Result<Self> {
        Self::new(
            content,
            NodeKind::Relationship(RelationshipDetails::new(person_name, relationship_type)),
        )
    }

    /// Build a node of `context` from loose JSON fields (an extraction item).
    pub fn from_fields(
        context: MemoryContext,
        fields: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let content = match fields.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(MemoryError::Validation("`content` must be a string".into()))
            }
            None => return Err(MemoryError::Validation("missing field `content`".into())),
        };
        let kind = NodeKind::from_fields(context, fields)?;
        let mut node = Self::new_at(content, kind, now)?;

        let envelope: Map<String, Value> = fields
            .iter()
            .filter(|(k, _)| ENVELOPE_KEYS.contains(&k.as_str()) && k.as_str() != "content")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in &envelope {
            node.set_envelope_field(key, value)?;
        }
        node.normalize()?;
        Ok(node)
    }

    /// Set the identifier
    pub fn with_id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set custom importance
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = clamp_unit(importance);
        self
    }

    pub fn with_emotional_significance(mut self, value: f32) -> Self {
        self.emotional_significance = clamp_signed(value);
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = clamp_unit(confidence);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        self.description = Some(description.trim().to_string()).filter(|d| !d.is_empty());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn context(&self) -> MemoryContext {
        self.kind.context()
    }

    /// Re-run validation after a mutation: trim, clamp, check, bump `updated_at`.
    pub fn revalidate(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.normalize()?;
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::microseconds(1)
        };
        Ok(())
    }

    fn normalize(&mut self) -> Result<()> {
        let trimmed = self.content.trim();
        if trimmed.is_empty() {
            return Err(MemoryError::Validation("content cannot be empty".into()));
        }
        if trimmed.len() != self.content.len() {
            self.content = trimmed.to_string();
        }
        self.description = self
            .description
            .take()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        self.importance = clamp_unit(self.importance);
        self.emotional_significance = clamp_signed(self.emotional_significance);
        self.confidence = clamp_unit(self.confidence);
        self.access_count = self.access_count.max(0);

        let own = self.context();
        self.context_relevance.remove(&own);
        for weight in self.context_relevance.values_mut() {
            *weight = clamp_unit(*weight);
        }

        self.kind.clamp_scores();
        self.kind.check_required()
    }

    /// Merge loose JSON fields into this node and revalidate.
    ///
    /// Nothing is changed when any field fails to apply. Returns the names of
    /// fields whose value actually changed.
    pub fn apply_updates(
        &mut self,
        updates: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let before = serde_json::to_value(&*self)?;
        let mut next = self.clone();

        let mut detail_fields = match serde_json::to_value(&next.kind)? {
            Value::Object(map) => map,
            _ => {
                return Err(MemoryError::Serialization(
                    "node details did not serialize to an object".into(),
                ))
            }
        };
        let mut details_touched = false;

        for (key, value) in updates {
            let key = key.as_str();
            if FROZEN_KEYS.contains(&key) {
                continue;
            }
            if key == "memory_context" || key == "type" {
                let requested: MemoryContext = value
                    .as_str()
                    .ok_or_else(|| MemoryError::Validation(format!("`{key}` must be a string")))?
                    .parse()?;
                if requested != next.context() {
                    return Err(MemoryError::Validation(format!(
                        "cannot move a {} memory to {requested}",
                        next.context()
                    )));
                }
                continue;
            }
            if ENVELOPE_KEYS.contains(&key) {
                next.set_envelope_field(key, value)?;
            } else {
                detail_fields.insert(key.to_string(), value.clone());
                details_touched = true;
            }
        }

        if details_touched {
            let context = next.context();
            next.kind = serde_json::from_value(Value::Object(detail_fields))
                .map_err(|e| MemoryError::Validation(format!("{context}: {e}")))?;
        }

        next.revalidate(now)?;

        let after = serde_json::to_value(&next)?;
        let changed = updates
            .keys()
            .filter(|k| field_value(&before, k) != field_value(&after, k))
            .cloned()
            .collect();

        *self = next;
        Ok(changed)
    }

    fn set_envelope_field(&mut self, key: &str, value: &Value) -> Result<()> {
        match key {
            "content" => self.content = expect_str(key, value)?.to_string(),
            "description" => {
                self.description = match value {
                    Value::Null => None,
                    other => Some(expect_str(key, other)?.to_string()),
                }
            }
            "importance" => self.importance = expect_f32(key, value)?,
            "emotional_significance" => self.emotional_significance = expect_f32(key, value)?,
            "confidence" => self.confidence = expect_f32(key, value)?,
            "tags" => {
                let tags = value
                    .as_array()
                    .ok_or_else(|| MemoryError::Validation("`tags` must be an array".into()))?;
                for tag in tags {
                    self.tags.insert(expect_str(key, tag)?.to_string());
                }
            }
            "metadata" => {
                let map = value
                    .as_object()
                    .ok_or_else(|| MemoryError::Validation("`metadata` must be an object".into()))?;
                for (k, v) in map {
                    self.metadata.insert(k.clone(), v.clone());
                }
            }
            "context_relevance" => {
                let map = value.as_object().ok_or_else(|| {
                    MemoryError::Validation("`context_relevance` must be an object".into())
                })?;
                for (k, v) in map {
                    let context: MemoryContext = k.parse()?;
                    self.context_relevance.insert(context, expect_f32(key, v)?);
                }
            }
            other => {
                return Err(MemoryError::Validation(format!(
                    "`{other}` is not an envelope field"
                )))
            }
        }
        Ok(())
    }
}

fn expect_str<'a>(key: &str, value: &'a Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| MemoryError::Validation(format!("`{key}` must be a string")))
}

fn expect_f32(key: &str, value: &Value) -> Result<f32> {
    value
        .as_f64()
        .map(|v| v as f32)
        .ok_or_else(|| MemoryError::Validation(format!("`{key}` must be a number")))
}

/// Look a key up on the envelope first, then on the variant payload.
fn field_value<'a>(node: &'a Value, key: &str) -> Option<&'a Value> {
    node.get(key)
        .or_else(|| node.get("kind").and_then(|kind| kind.get(key)))
}
