//! Typed, directed edges between memory nodes

use crate::error::{MemoryError, Result};
use crate::types::{clamp_unit, MemoryContext, MemoryNode, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Edge family a relationship type belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipCategory {
    CrossContext,
    WithinContext,
    Temporal,
    Causal,
    Similarity,
}

impl RelationshipCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipCategory::CrossContext => "cross_context",
            RelationshipCategory::WithinContext => "within_context",
            RelationshipCategory::Temporal => "temporal",
            RelationshipCategory::Causal => "causal",
            RelationshipCategory::Similarity => "similarity",
        }
    }
}

impl std::fmt::Display for RelationshipCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationshipCategory {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cross_context" => Ok(RelationshipCategory::CrossContext),
            "within_context" => Ok(RelationshipCategory::WithinContext),
            "temporal" => Ok(RelationshipCategory::Temporal),
            "causal" => Ok(RelationshipCategory::Causal),
            "similarity" => Ok(RelationshipCategory::Similarity),
            other => Err(MemoryError::Validation(format!(
                "unknown relationship category: {other}"
            ))),
        }
    }
}

macro_rules! relationship_types {
    ($($variant:ident => $name:literal, $category:ident;)+) => {
        /// The 28 edge types
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum RelationshipType {
            $($variant,)+
        }

        impl RelationshipType {
            pub const ALL: &[RelationshipType] = &[$(RelationshipType::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(RelationshipType::$variant => $name,)+
                }
            }

            /// The category this type is declared under
            pub fn category(&self) -> RelationshipCategory {
                match self {
                    $(RelationshipType::$variant => RelationshipCategory::$category,)+
                }
            }
        }

        impl std::str::FromStr for RelationshipType {
            type Err = MemoryError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($name => Ok(RelationshipType::$variant),)+
                    other => Err(MemoryError::Validation(format!(
                        "unknown relationship type: {other}"
                    ))),
                }
            }
        }
    };
}

relationship_types! {
    ExperienceToKnowledge => "EXPERIENCE_TO_KNOWLEDGE", CrossContext;
    KnowledgeToExperience => "KNOWLEDGE_TO_EXPERIENCE", CrossContext;
    ExperienceToRelationship => "EXPERIENCE_TO_RELATIONSHIP", CrossContext;
    RelationshipToExperience => "RELATIONSHIP_TO_EXPERIENCE", CrossContext;
    KnowledgeToRelationship => "KNOWLEDGE_TO_RELATIONSHIP", CrossContext;
    RelationshipToKnowledge => "RELATIONSHIP_TO_KNOWLEDGE", CrossContext;
    CurrentToExperience => "CURRENT_TO_EXPERIENCE", CrossContext;
    ExperienceToCurrent => "EXPERIENCE_TO_CURRENT", CrossContext;
    CurrentToKnowledge => "CURRENT_TO_KNOWLEDGE", CrossContext;
    KnowledgeToCurrent => "KNOWLEDGE_TO_CURRENT", CrossContext;
    CurrentToRelationship => "CURRENT_TO_RELATIONSHIP", CrossContext;
    RelationshipToCurrent => "RELATIONSHIP_TO_CURRENT", CrossContext;
    ExperienceChain => "EXPERIENCE_CHAIN", WithinContext;
    KnowledgeHierarchy => "KNOWLEDGE_HIERARCHY", WithinContext;
    RelationshipNetwork => "RELATIONSHIP_NETWORK", WithinContext;
    CurrentSequence => "CURRENT_SEQUENCE", WithinContext;
    HappenedBefore => "HAPPENED_BEFORE", Temporal;
    HappenedAfter => "HAPPENED_AFTER", Temporal;
    Concurrent => "CONCURRENT", Temporal;
    During => "DURING", Temporal;
    Caused => "CAUSED", Causal;
    ResultedIn => "RESULTED_IN", Causal;
    Influenced => "INFLUENCED", Causal;
    Triggered => "TRIGGERED", Causal;
    SimilarTo => "SIMILAR_TO", Similarity;
    OppositeOf => "OPPOSITE_OF", Similarity;
    RelatedTo => "RELATED_TO", Similarity;
    AssociatedWith => "ASSOCIATED_WITH", Similarity;
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed, typed edge between two memory nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEdge {
    pub id: String,
    pub relationship_type: RelationshipType,
    pub category: RelationshipCategory,
    pub from_id: NodeId,
    pub from_context: MemoryContext,
    pub to_id: NodeId,
    pub to_context: MemoryContext,
    /// Strength of the connection (0.0 - 1.0)
    pub strength: f32,
    pub confidence: f32,
    pub bidirectional: bool,
    pub context_relevance: BTreeMap<MemoryContext, f32>,
    pub created_at: DateTime<Utc>,
    pub last_reinforced: DateTime<Utc>,
    pub valid_from: Option<DateTime<Utc>>,
    /// Edge is ignored by expansion once this has passed
    pub valid_until: Option<DateTime<Utc>>,
    pub evidence_count: i64,
    pub source_conversation: Option<String>,
    pub context: Option<String>,
    pub properties: Map<String, Value>,
}

impl MemoryEdge {
    /// Create an edge from `from` to `to` with default weights
    pub fn new(relationship_type: RelationshipType, from: &MemoryNode, to: &MemoryNode) -> Self {
        Self::between(
            relationship_type,
            from.id.clone(),
            from.context(),
            to.id.clone(),
            to.context(),
        )
    }

    pub fn between(
        relationship_type: RelationshipType,
        from_id: impl Into<NodeId>,
        from_context: MemoryContext,
        to_id: impl Into<NodeId>,
        to_context: MemoryContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            relationship_type,
            category: relationship_type.category(),
            from_id: from_id.into(),
            from_context,
            to_id: to_id.into(),
            to_context,
            strength: 0.5,
            confidence: 0.8,
            bidirectional: false,
            context_relevance: BTreeMap::new(),
            created_at: now,
            last_reinforced: now,
            valid_from: None,
            valid_until: None,
            evidence_count: 1,
            source_conversation: None,
            context: None,
            properties: Map::new(),
        }
    }

    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = clamp_unit(strength);
        self
    }

    pub fn with_source_conversation(mut self, source: impl Into<String>) -> Self {
        self.source_conversation = Some(source.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn valid_until(mut self, until: DateTime<Utc>) -> Self {
        self.valid_until = Some(until);
        self
    }

    /// Check category membership and endpoints, clamp weights.
    pub fn validate(&mut self) -> Result<()> {
        if self.category != self.relationship_type.category() {
            return Err(MemoryError::Validation(format!(
                "{} belongs to {}, not {}",
                self.relationship_type,
                self.relationship_type.category(),
                self.category
            )));
        }
        if self.from_id.is_empty() || self.to_id.is_empty() {
            return Err(MemoryError::Validation("edge endpoint missing".into()));
        }
        if self.from_id == self.to_id {
            return Err(MemoryError::Validation(format!(
                "self-loop on {} rejected",
                self.from_id
            )));
        }
        if let (Some(from), Some(until)) = (self.valid_from, self.valid_until) {
            if until < from {
                return Err(MemoryError::Validation(
                    "valid_until precedes valid_from".into(),
                ));
            }
        }

        self.strength = clamp_unit(self.strength);
        self.confidence = clamp_unit(self.confidence);
        for weight in self.context_relevance.values_mut() {
            *weight = clamp_unit(*weight);
        }
        self.evidence_count = self.evidence_count.max(1);
        Ok(())
    }

    /// Fold a repeated observation of the same (from, to, type) triple into this edge.
    pub fn reinforce(&mut self, observed: &MemoryEdge, now: DateTime<Utc>) {
        self.evidence_count += 1;
        self.last_reinforced = now;
        self.strength = self.strength.max(clamp_unit(observed.strength));
        self.confidence = self.confidence.max(clamp_unit(observed.confidence));
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| until <= now)
    }

    /// The endpoint opposite `node_id`
    pub fn other_end(&self, node_id: &str) -> &str {
        if self.from_id == node_id {
            &self.to_id
        } else {
            &self.from_id
        }
    }
}
