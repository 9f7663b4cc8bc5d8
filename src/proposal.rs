//! Extraction proposals: the untrusted add/update payload produced per chunk

use crate::error::{MemoryError, Result};
use crate::relationship::RelationshipType;
use crate::types::{MemoryContext, MemoryNode, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw proposal as returned by an extractor.
///
/// Items stay untyped so a single malformed entry can be rejected on its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractionProposal {
    #[serde(default, alias = "memories_to_add")]
    pub nodes_to_add: Vec<Value>,
    #[serde(default, alias = "memories_to_update")]
    pub nodes_to_update: Vec<Value>,
}

impl ExtractionProposal {
    /// Parse a proposal, tolerating prose or code fences around the JSON object.
    pub fn from_json(text: &str) -> Result<Self> {
        let start = text.find('{');
        let end = text.rfind('}');
        let body = match (start, end) {
            (Some(start), Some(end)) if start < end => &text[start..=end],
            _ => {
                return Err(MemoryError::Validation(
                    "extraction output contains no JSON object".into(),
                ))
            }
        };
        serde_json::from_str(body)
            .map_err(|e| MemoryError::Validation(format!("malformed proposal: {e}")))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes_to_add.is_empty() && self.nodes_to_update.is_empty()
    }
}

/// A validated-shape add item; node invariants are checked by [`NodeDraft::into_node`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDraft {
    pub context: MemoryContext,
    pub fields: Map<String, Value>,
    pub link_type: Option<RelationshipType>,
    pub grounded_on: Vec<NodeId>,
}

impl NodeDraft {
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| MemoryError::Validation("add item must be an object".into()))?;

        let context = map
            .get("memory_context")
            .or_else(|| map.get("type"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MemoryError::Validation("add item is missing `memory_context`".into())
            })?
            .parse::<MemoryContext>()?;

        Ok(Self {
            context,
            fields: map.clone(),
            link_type: link_type(map)?,
            grounded_on: grounded_on(map)?,
        })
    }

    pub fn into_node(self, id: NodeId, now: DateTime<Utc>) -> Result<MemoryNode> {
        Ok(MemoryNode::from_fields(self.context, &self.fields, now)?.with_id(id))
    }
}

/// An update item targeting an existing node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub memory_id: NodeId,
    pub updates: Map<String, Value>,
    pub link_type: Option<RelationshipType>,
    pub grounded_on: Vec<NodeId>,
}

impl NodeUpdate {
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| MemoryError::Validation("update item must be an object".into()))?;

        let memory_id = map
            .get("memory_id")
            .or_else(|| map.get("id"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| MemoryError::Validation("update item is missing `memory_id`".into()))?
            .to_string();

        // Either a nested `updates` object or the remaining keys inline
        let updates = match map.get("updates") {
            Some(Value::Object(updates)) => updates.clone(),
            Some(_) => {
                return Err(MemoryError::Validation("`updates` must be an object".into()))
            }
            None => map
                .iter()
                .filter(|(k, _)| {
                    !matches!(k.as_str(), "memory_id" | "id" | "link_type" | "grounded_on")
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        if updates.is_empty() {
            return Err(MemoryError::Validation(format!(
                "update for {memory_id} carries no fields"
            )));
        }

        Ok(Self {
            memory_id,
            updates,
            link_type: link_type(map)?,
            grounded_on: grounded_on(map)?,
        })
    }
}

fn link_type(map: &Map<String, Value>) -> Result<Option<RelationshipType>> {
    match map.get("link_type") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => s.parse().map(Some),
        Some(_) => Err(MemoryError::Validation("`link_type` must be a string".into())),
    }
}

fn grounded_on(map: &Map<String, Value>) -> Result<Vec<NodeId>> {
    match map.get("grounded_on") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(ids)) => ids
            .iter()
            .map(|id| {
                id.as_str().map(str::to_string).ok_or_else(|| {
                    MemoryError::Validation("`grounded_on` must hold node ids".into())
                })
            })
            .collect(),
        Some(_) => Err(MemoryError::Validation("`grounded_on` must be an array".into())),
    }
}
