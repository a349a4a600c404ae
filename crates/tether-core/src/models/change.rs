//! Offline change log model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::entity::EntityType;
use super::queue::QueueOperation;
use crate::error::Error;

/// Which kind of local divergence caused a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Label used in logs and UI (`UPDATE_CONFLICT`, ...).
    pub const fn conflict_label(self) -> &'static str {
        match self {
            Self::Create => "CREATE_CONFLICT",
            Self::Update => "UPDATE_CONFLICT",
            Self::Delete => "DELETE_CONFLICT",
        }
    }
}

impl From<QueueOperation> for ChangeType {
    fn from(operation: QueueOperation) -> Self {
        match operation {
            QueueOperation::Create => Self::Create,
            QueueOperation::Update => Self::Update,
            QueueOperation::Delete => Self::Delete,
        }
    }
}

impl FromStr for ChangeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::Database(format!("unknown change type '{other}'"))),
        }
    }
}

/// Outcome chosen for a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    Merge,
    Manual,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "LOCAL_WINS",
            Self::RemoteWins => "REMOTE_WINS",
            Self::Merge => "MERGE",
            Self::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "LOCAL_WINS" | "LOCAL" => Ok(Self::LocalWins),
            "REMOTE_WINS" | "REMOTE" => Ok(Self::RemoteWins),
            "MERGE" => Ok(Self::Merge),
            "MANUAL" => Ok(Self::Manual),
            other => Err(Error::InvalidInput(format!("unknown resolution '{other}'"))),
        }
    }
}

/// A detected divergence between an unsynced local edit and a remote edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineChangeRecord {
    pub id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub change_type: ChangeType,
    /// Local snapshot at detection time
    pub conflicting_local: Value,
    /// Remote snapshot (refreshed while the conflict stays open)
    pub conflicting_remote: Value,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
    pub resolution: Option<Resolution>,
    pub resolved: bool,
    pub resolved_at: Option<i64>,
    /// Last strategy failure, if any
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_parses_short_forms() {
        assert_eq!("local".parse::<Resolution>().unwrap(), Resolution::LocalWins);
        assert_eq!("remote-wins".parse::<Resolution>().unwrap(), Resolution::RemoteWins);
        assert_eq!("merge".parse::<Resolution>().unwrap(), Resolution::Merge);
        assert!("coin-flip".parse::<Resolution>().is_err());
    }

    #[test]
    fn change_type_labels() {
        assert_eq!(ChangeType::Update.conflict_label(), "UPDATE_CONFLICT");
        assert_eq!(ChangeType::from(QueueOperation::Delete), ChangeType::Delete);
    }
}
