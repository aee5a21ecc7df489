//! Engine configuration
//!
//! All inputs are plain data and are validated when a pass enters
//! `preparing`. Entity registrations carry the dependency edges used to
//! order sync tasks (tickets before cashless transactions, etc.).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::EntityConflictConfig;

/// Pull batch sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

/// Exponential backoff parameters for failed queue items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First retry delay (ms); doubles per attempt
    pub base_delay_ms: u64,
    /// Delay ceiling (ms)
    pub max_delay_ms: u64,
    /// Attempts after which an item is flagged permanently failed
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 5 * 60 * 1_000,
            max_attempts: 8,
        }
    }
}

/// One syncable entity type and its dependencies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRegistration {
    /// Entity type name, e.g. "tickets"
    pub name: String,
    /// Entity types that must sync before this one
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub conflict: EntityConflictConfig,
}

impl EntityRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            conflict: EntityConflictConfig::default(),
        }
    }

    #[must_use]
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|&d| d.to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_conflict(mut self, conflict: EntityConflictConfig) -> Self {
        self.conflict = conflict;
        self
    }
}

/// Full configuration for the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Festival the device is scoped to
    pub festival_id: String,
    /// Stable device identifier, sent with every push
    pub device_id: String,
    pub entities: Vec<EntityRegistration>,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl SyncConfig {
    /// Validate scope, uniqueness, dependency closure, and batch sizing.
    pub fn validate(&self) -> Result<()> {
        if self.festival_id.trim().is_empty() {
            return Err(Error::Config("festival_id must not be empty".into()));
        }
        if self.device_id.trim().is_empty() {
            return Err(Error::Config("device_id must not be empty".into()));
        }
        if self.entities.is_empty() {
            return Err(Error::Config("at least one entity must be registered".into()));
        }
        if self.batch.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }

        let mut seen = HashSet::new();
        for entity in &self.entities {
            if entity.name.trim().is_empty() {
                return Err(Error::Config("entity name must not be empty".into()));
            }
            if !seen.insert(entity.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate entity registration: {}",
                    entity.name
                )));
            }
        }
        for entity in &self.entities {
            for dep in &entity.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(Error::Config(format!(
                        "{} depends on unregistered entity {dep}",
                        entity.name
                    )));
                }
            }
        }

        // A cycle makes the pass unorderable
        self.ordered_entities()?;
        Ok(())
    }

    /// Entity names in dependency order (Kahn's algorithm; registration
    /// order breaks ties so output is deterministic).
    pub fn ordered_entities(&self) -> Result<Vec<&EntityRegistration>> {
        let mut in_degree: HashMap<&str, usize> = self
            .entities
            .iter()
            .map(|e| (e.name.as_str(), e.depends_on.len()))
            .collect();

        let mut ordered = Vec::with_capacity(self.entities.len());
        loop {
            let next = self
                .entities
                .iter()
                .find(|e| in_degree.get(e.name.as_str()) == Some(&0));
            let Some(entity) = next else { break };

            in_degree.remove(entity.name.as_str());
            ordered.push(entity);

            for other in &self.entities {
                if other.depends_on.iter().any(|d| d == &entity.name) {
                    if let Some(degree) = in_degree.get_mut(other.name.as_str()) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
        }

        if ordered.len() != self.entities.len() {
            let stuck: Vec<&str> = in_degree.keys().copied().collect();
            return Err(Error::Config(format!(
                "dependency cycle among entities: {}",
                stuck.join(", ")
            )));
        }
        Ok(ordered)
    }

    /// Conflict config for one entity type, if registered
    pub fn conflict_config(&self, entity_type: &str) -> Option<&EntityConflictConfig> {
        self.entities
            .iter()
            .find(|e| e.name == entity_type)
            .map(|e| &e.conflict)
    }
}

/// Background sync scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundSyncConfig {
    /// Desired interval between passes; clamped to [`MIN_SYNC_INTERVAL`]
    pub min_interval: Duration,
    #[serde(default)]
    pub requires_wifi: bool,
    #[serde(default)]
    pub requires_charging: bool,
}

/// OS/battery floor under which the background service will not schedule
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(60);

impl Default for BackgroundSyncConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(15 * 60),
            requires_wifi: false,
            requires_charging: false,
        }
    }
}

impl BackgroundSyncConfig {
    /// Interval with the floor applied
    pub fn effective_interval(&self) -> Duration {
        self.min_interval.max(MIN_SYNC_INTERVAL)
    }
}
