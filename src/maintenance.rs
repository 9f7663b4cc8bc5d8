//! Memory maintenance: importance drift over persisted nodes

use crate::error::Result;
use crate::graph_store::GraphStore;
use crate::types::MemoryContext;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Decay rate per day (0.0 - 1.0)
    pub decay_rate: f32,
    /// Access within this many days boosts importance
    pub recent_access_days: i64,
    /// No access for longer than this reduces importance
    pub stale_access_days: i64,
    /// Smallest importance change worth writing
    pub min_change: f32,
    /// Nodes examined per context
    pub batch_limit: i64,
    /// Whether to apply decay
    pub enable_decay: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            decay_rate: 0.05,
            recent_access_days: 7,
            stale_access_days: 30,
            min_change: 0.01,
            batch_limit: 1000,
            enable_decay: true,
        }
    }
}

/// Maintenance report
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Number of nodes whose importance changed
    pub decayed: usize,
    /// Total nodes checked
    pub checked: usize,
}

/// Run maintenance tasks
pub async fn run_maintenance(
    store: &dyn GraphStore,
    config: &MaintenanceConfig,
    now: DateTime<Utc>,
) -> Result<MaintenanceReport> {
    if !config.enable_decay {
        return Ok(MaintenanceReport::default());
    }
    apply_decay(store, config, now).await
}

/// Apply importance decay based on age and access patterns
async fn apply_decay(
    store: &dyn GraphStore,
    config: &MaintenanceConfig,
    now: DateTime<Utc>,
) -> Result<MaintenanceReport> {
    let mut report = MaintenanceReport::default();

    for context in MemoryContext::ALL {
        let nodes = store.list_nodes(Some(*context), config.batch_limit).await?;

        for mut node in nodes {
            report.checked += 1;
            let new_importance = decayed_importance(
                node.importance,
                node.created_at,
                node.last_accessed_at,
                config,
                now,
            );

            // Only update if change is significant
            if (new_importance - node.importance).abs() > config.min_change {
                node.importance = new_importance;
                node.revalidate(now)?;
                store.upsert_node(&node, None).await?;
                report.decayed += 1;
            }
        }
    }

    tracing::debug!(
        checked = report.checked,
        decayed = report.decayed,
        "importance decay applied"
    );
    Ok(report)
}

/// Importance after age decay and access modulation.
///
/// Age counts from `created_at`; decay writes bump `updated_at`. Only a recorded
/// access earns the recency boost. A node never accessed turns stale once it is
/// older than `stale_access_days`.
pub fn decayed_importance(
    importance: f32,
    created_at: DateTime<Utc>,
    last_accessed_at: Option<DateTime<Utc>>,
    config: &MaintenanceConfig,
    now: DateTime<Utc>,
) -> f32 {
    let days_old = (now - created_at).num_days().max(0);
    let days_since_access = (now - last_accessed_at.unwrap_or(created_at))
        .num_days()
        .max(0);

    let age_decay = 1.0 - (days_old as f32 * config.decay_rate).min(0.5);
    let recently_accessed =
        last_accessed_at.is_some() && days_since_access < config.recent_access_days;
    let access_boost = if recently_accessed {
        1.1
    } else if days_since_access > config.stale_access_days {
        0.9
    } else {
        1.0
    };

    (importance * age_decay * access_boost).clamp(0.0, 1.0)
}

/// Builder for maintenance config
pub struct MaintenanceConfigBuilder {
    config: MaintenanceConfig,
}

impl MaintenanceConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MaintenanceConfig::default(),
        }
    }

    pub fn decay_rate(mut self, rate: f32) -> Self {
        self.config.decay_rate = rate;
        self
    }

    pub fn min_change(mut self, min_change: f32) -> Self {
        self.config.min_change = min_change;
        self
    }

    pub fn enable_decay(mut self, enable: bool) -> Self {
        self.config.enable_decay = enable;
        self
    }

    pub fn build(self) -> MaintenanceConfig {
        self.config
    }
}

impl Default for MaintenanceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
