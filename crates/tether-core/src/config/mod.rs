//! Engine configuration.
//!
//! `EngineConfig` is loaded from a JSON file (or built in code) and shared by
//! the orchestrator, the queue manager and the background scheduler.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::EntityType;
use crate::util::{is_http_url, normalize_text_option};
use crate::{Error, Result};

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
const DEFAULT_RETENTION_DAYS: u32 = 30;
const DEFAULT_WORKSPACE_ID: &str = "default";
const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Tunables for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Failed attempts before a queue item is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per remote call timeout
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Background sync period
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// How long resolved conflicts and dead letters are kept
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Entity types pulled from the remote each cycle
    #[serde(default = "default_tracked_entities")]
    pub tracked_entities: Vec<EntityType>,
    /// Merge allow-lists overriding the schema defaults
    #[serde(default)]
    pub merge_fields: BTreeMap<EntityType, Vec<String>>,
    /// Key for the sync watermark
    #[serde(default = "default_workspace_id")]
    pub workspace_id: String,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

/// Where the remote API lives.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            retention_days: DEFAULT_RETENTION_DAYS,
            tracked_entities: default_tracked_entities(),
            merge_fields: BTreeMap::new(),
            workspace_id: DEFAULT_WORKSPACE_ID.to_string(),
            remote: None,
        }
    }
}

impl EngineConfig {
    /// Read and validate a JSON config file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|error| {
            Error::InvalidInput(format!("invalid config {}: {error}", path.display()))
        })?;
        config.validate()
    }

    /// Check invariants and normalize free-form values.
    pub fn validate(mut self) -> Result<Self> {
        if self.max_retries == 0 {
            return Err(Error::InvalidInput("max_retries must be at least 1".into()));
        }
        if self.call_timeout_ms == 0 {
            return Err(Error::InvalidInput("call_timeout_ms must be positive".into()));
        }
        if self.sync_interval_secs == 0 {
            return Err(Error::InvalidInput("sync_interval_secs must be positive".into()));
        }

        self.workspace_id = normalize_text_option(Some(self.workspace_id))
            .ok_or_else(|| Error::InvalidInput("workspace_id must not be empty".into()))?;

        self.tracked_entities.sort();
        self.tracked_entities.dedup();
        if self.tracked_entities.is_empty() {
            return Err(Error::InvalidInput(
                "tracked_entities must name at least one entity type".into(),
            ));
        }

        self.remote = match self.remote.take() {
            Some(remote) => Some(remote.validate()?),
            None => None,
        };
        Ok(self)
    }

    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub const fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Retention window in milliseconds.
    pub fn retention_millis(&self) -> i64 {
        i64::from(self.retention_days) * MILLIS_PER_DAY
    }

    /// Fields a merge takes from the local side for `entity_type`.
    pub fn merge_fields_for(&self, entity_type: EntityType) -> Vec<String> {
        self.merge_fields.get(&entity_type).map_or_else(
            || {
                entity_type
                    .schema()
                    .default_merge_fields
                    .iter()
                    .map(|field| (*field).to_string())
                    .collect()
            },
            Clone::clone,
        )
    }
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token,
        }
    }

    /// Require an http(s) base URL; strip trailing slashes and blank tokens.
    pub fn validate(self) -> Result<Self> {
        let base_url = normalize_text_option(Some(self.base_url))
            .ok_or_else(|| Error::InvalidInput("remote.base_url is required".into()))?;
        if !is_http_url(&base_url) {
            return Err(Error::InvalidInput(
                "remote.base_url must include http:// or https://".into(),
            ));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: normalize_text_option(self.auth_token),
        })
    }
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

const fn default_sync_interval_secs() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

const fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_tracked_entities() -> Vec<EntityType> {
    EntityType::ALL.to_vec()
}

fn default_workspace_id() -> String {
    DEFAULT_WORKSPACE_ID.to_string()
}
