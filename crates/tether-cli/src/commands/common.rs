use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tether_core::models::DeadLetter;
use tether_core::sync::SyncCycleResult;
use tether_core::{
    Detached, EngineConfig, EntityRecord, HttpRemoteApi, LocalStore, OfflineChangeRecord,
    RemoteApi, RemoteConfig, StrategyRegistry, SyncOrchestrator,
};

use crate::error::CliError;

pub const DB_PATH_ENV: &str = "TETHER_DB_PATH";
pub const CONFIG_PATH_ENV: &str = "TETHER_CONFIG";
pub const API_URL_ENV: &str = "TETHER_API_URL";
pub const API_TOKEN_ENV: &str = "TETHER_API_TOKEN";

const ENGINE_FIELDS: [&str; 2] = ["updated_at", "deleted"];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Local reads and writes; a missing remote is fine
    Local,
    /// Commands that talk to the server
    RequireRemote,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    match cli_db_path.or_else(|| env::var_os(DB_PATH_ENV).map(PathBuf::from)) {
        Some(path) => Ok(path),
        None => default_db_path(),
    }
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("tether").join("tether.db"))
        .ok_or_else(|| CliError::Config("failed to resolve the data directory".into()))
}

/// Explicit path, then `TETHER_CONFIG`, then the default file if it exists.
pub fn resolve_config_path(cli_config: Option<PathBuf>) -> Option<PathBuf> {
    cli_config
        .or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        .or_else(|| {
            dirs::config_dir()
                .map(|dir| dir.join("tether").join("config.json"))
                .filter(|path| path.is_file())
        })
}

pub fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig, CliError> {
    let config = match path {
        Some(path) => EngineConfig::load_from_path(path)?,
        None => EngineConfig::default(),
    };
    with_remote_override(
        config,
        env::var(API_URL_ENV).ok(),
        env::var(API_TOKEN_ENV).ok(),
    )
}

/// Environment values take precedence over the config file's `remote`.
pub fn with_remote_override(
    mut config: EngineConfig,
    api_url: Option<String>,
    api_token: Option<String>,
) -> Result<EngineConfig, CliError> {
    let api_url = api_url.filter(|url| !url.trim().is_empty());
    let api_token = api_token.filter(|token| !token.trim().is_empty());

    match (api_url, config.remote.as_mut()) {
        (Some(url), _) => config.remote = Some(RemoteConfig::new(url, api_token)),
        (None, Some(remote)) => {
            if api_token.is_some() {
                remote.auth_token = api_token;
            }
        }
        (None, None) => {}
    }
    Ok(config.validate()?)
}

pub async fn open_engine(
    db_path: &Path,
    config_path: Option<&Path>,
    mode: OpenMode,
    strategies: StrategyRegistry,
) -> Result<SyncOrchestrator, CliError> {
    let config = load_engine_config(config_path)?;

    let remote: Arc<dyn RemoteApi> = match (&config.remote, mode) {
        (Some(remote), _) => {
            tracing::debug!("Using remote {}", remote.base_url);
            Arc::new(HttpRemoteApi::from_config(remote)?)
        }
        (None, OpenMode::RequireRemote) => return Err(CliError::SyncNotConfigured),
        (None, OpenMode::Local) => Arc::new(Detached),
    };

    let store = LocalStore::open_path(db_path).await?;
    Ok(SyncOrchestrator::with_strategies(
        store, remote, config, strategies,
    )?)
}

pub fn normalize_entity_id(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyId)
    } else {
        Ok(trimmed.to_string())
    }
}

/// Parse `name=value` pairs. Values that read as JSON (numbers, booleans,
/// null, arrays, objects, quoted strings) keep their type; anything else is
/// taken as a plain string.
pub fn parse_field_assignments(parts: &[String]) -> Result<Map<String, Value>, CliError> {
    let mut fields = Map::new();
    for part in parts {
        let Some((name, raw)) = part.split_once('=') else {
            return Err(CliError::InvalidField(part.clone()));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(CliError::InvalidField(part.clone()));
        }
        if ENGINE_FIELDS.contains(&name) {
            return Err(CliError::ReservedField(name.to_string()));
        }
        fields.insert(name.to_string(), parse_field_value(raw));
    }
    Ok(fields)
}

pub fn parse_field_value(raw: &str) -> Value {
    serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Short human label for a record: its title, name or email when present.
pub fn record_label(record: &EntityRecord) -> String {
    ["title", "name", "email"]
        .iter()
        .find_map(|field| record.field_str(field))
        .map_or_else(|| "-".to_string(), |text| preview(text, 40))
}

/// First line of `text`, whitespace collapsed, cut to `max_chars`.
pub fn preview(text: &str, max_chars: usize) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    let collapsed = first_line.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_record_lines(records: &[EntityRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let short_id = record.id.chars().take(13).collect::<String>();
            let label = record_label(record);
            let relative_time = format_relative_time(record.updated_at, now_ms);
            let marker = if record.is_synced { "" } else { "  *" };
            format!("{short_id:<13}  {label:<40}  {relative_time}{marker}")
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[OfflineChangeRecord]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let state = match (conflict.resolved, conflict.resolution) {
                (true, Some(resolution)) => resolution.to_string(),
                (false, Some(resolution)) => format!("open ({resolution})"),
                (_, None) => "open".to_string(),
            };
            let mut line = format!(
                "{}  {}  {:<15}  {} {}  {state}",
                conflict.id,
                format_timestamp(conflict.detected_at),
                conflict.change_type.conflict_label(),
                conflict.entity_type,
                conflict.entity_id
            );
            if let Some(error) = &conflict.last_error {
                line.push_str(&format!("  error: {error}"));
            }
            line
        })
        .collect()
}

pub fn format_dead_letter_lines(letters: &[DeadLetter]) -> Vec<String> {
    letters
        .iter()
        .map(|letter| {
            format!(
                "{}  {}  {} {} {}  after {} attempts: {}",
                letter.id,
                format_timestamp(letter.failed_at),
                letter.operation,
                letter.entity_type,
                letter.entity_id,
                letter.retry_count,
                letter.last_error
            )
        })
        .collect()
}

pub fn format_cycle_summary(result: &SyncCycleResult) -> Vec<String> {
    let mut lines = vec![format!(
        "{} uploaded, {} failed, {} dead-lettered, {} pulled, {} conflict(s)",
        result.synced_items,
        result.failed_items,
        result.dead_lettered,
        result.pulled_records,
        result.conflicts.len()
    )];
    if result.unresolved_conflicts > 0 {
        lines[0].push_str(&format!(", {} awaiting review", result.unresolved_conflicts));
    }
    for conflict in &result.conflicts {
        let outcome = conflict
            .resolution
            .map_or_else(|| "unresolved".to_string(), |resolution| resolution.to_string());
        lines.push(format!(
            "  {} {} {}: {outcome}",
            conflict.change_type.conflict_label(),
            conflict.entity_type,
            conflict.entity_id
        ));
    }
    for issue in &result.errors {
        match (&issue.entity_type, &issue.entity_id) {
            (Some(entity_type), Some(entity_id)) => {
                lines.push(format!("  error {entity_type} {entity_id}: {}", issue.message));
            }
            _ => lines.push(format!("  error: {}", issue.message)),
        }
    }
    lines
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
