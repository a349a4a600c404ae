//! Entity types, table schemas and the generic entity record

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Business entity types the engine knows how to store and sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Task,
    Project,
    User,
    Workspace,
}

/// Static description of how an entity type is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySchema {
    /// Local table holding rows of this type
    pub table: &'static str,
    /// Fields a merge takes from the local snapshot unless configured otherwise
    pub default_merge_fields: &'static [&'static str],
}

const TASK_SCHEMA: EntitySchema = EntitySchema {
    table: "tasks",
    default_merge_fields: &["title", "description", "status", "priority"],
};

const PROJECT_SCHEMA: EntitySchema = EntitySchema {
    table: "projects",
    default_merge_fields: &["name", "description", "status"],
};

const USER_SCHEMA: EntitySchema = EntitySchema {
    table: "users",
    default_merge_fields: &["display_name"],
};

const WORKSPACE_SCHEMA: EntitySchema = EntitySchema {
    table: "workspaces",
    default_merge_fields: &["name"],
};

impl EntityType {
    /// Every entity type, in table creation order.
    pub const ALL: [Self; 4] = [Self::Workspace, Self::User, Self::Project, Self::Task];

    /// Schema registry lookup.
    pub const fn schema(self) -> &'static EntitySchema {
        match self {
            Self::Task => &TASK_SCHEMA,
            Self::Project => &PROJECT_SCHEMA,
            Self::User => &USER_SCHEMA,
            Self::Workspace => &WORKSPACE_SCHEMA,
        }
    }

    /// Local table name for this type.
    pub const fn table(self) -> &'static str {
        self.schema().table
    }

    /// Lowercase wire name (`task`, `project`, ...).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Project => "project",
            Self::User => "user",
            Self::Workspace => "workspace",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "task" | "tasks" => Ok(Self::Task),
            "project" | "projects" => Ok(Self::Project),
            "user" | "users" => Ok(Self::User),
            "workspace" | "workspaces" => Ok(Self::Workspace),
            other => Err(Error::InvalidInput(format!("unknown entity type '{other}'"))),
        }
    }
}

/// Generate a new entity id (UUID v7, time-sortable).
#[must_use]
pub fn new_entity_id() -> String {
    Uuid::now_v7().to_string()
}

/// A locally cached entity row with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Unique identifier shared with the remote
    pub id: String,
    /// Which table this record lives in
    pub entity_type: EntityType,
    /// Business fields
    pub data: Map<String, Value>,
    /// Last modification timestamp (Unix ms)
    pub updated_at: i64,
    /// False while local edits have not been confirmed by the server
    pub is_synced: bool,
    /// When the row was last reconciled with the server (Unix ms)
    pub last_sync_at: Option<i64>,
    /// Local tombstone kept until a queued delete has been uploaded
    pub is_deleted: bool,
}

impl EntityRecord {
    /// Create an unsynced record stamped with the current time.
    #[must_use]
    pub fn new(entity_type: EntityType, id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            entity_type,
            data,
            updated_at: chrono::Utc::now().timestamp_millis(),
            is_synced: false,
            last_sync_at: None,
            is_deleted: false,
        }
    }

    /// Read a string business field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }

    /// Shallow-merge a JSON object patch into the business fields.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            self.data.insert(key.clone(), value.clone());
        }
    }

    /// Snapshot used for queue payloads and conflict records.
    pub fn snapshot(&self) -> Value {
        let mut data = self.data.clone();
        data.insert("id".to_string(), Value::String(self.id.clone()));
        data.insert("updated_at".to_string(), Value::from(self.updated_at));
        if self.is_deleted {
            data.insert("deleted".to_string(), Value::Bool(true));
        }
        Value::Object(data)
    }
}

/// A record as reported by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Server-side modification timestamp (Unix ms)
    pub updated_at: i64,
    /// Remote tombstone
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteRecord {
    /// Snapshot in the same shape as [`EntityRecord::snapshot`].
    pub fn snapshot(&self) -> Value {
        let mut data = self.data.clone();
        data.insert("id".to_string(), Value::String(self.id.clone()));
        data.insert("updated_at".to_string(), Value::from(self.updated_at));
        if self.deleted {
            data.insert("deleted".to_string(), Value::Bool(true));
        }
        Value::Object(data)
    }

    /// Rebuild a remote record from a server or stored snapshot. The
    /// server timestamp is mandatory since detection and the watermark
    /// depend on it.
    pub fn from_snapshot(entity_type: EntityType, snapshot: &Value) -> crate::Result<Self> {
        if snapshot.get("updated_at").and_then(Value::as_i64).is_none() {
            let id = snapshot.get("id").and_then(Value::as_str).unwrap_or("?");
            return Err(Error::InvalidInput(format!(
                "remote {entity_type} {id} has no integer updated_at"
            )));
        }
        let (id, updated_at, deleted, data) = split_snapshot(snapshot)?;
        Ok(Self {
            id,
            entity_type,
            data,
            updated_at,
            deleted,
        })
    }
}

/// Split a snapshot into `(id, updated_at, deleted, business fields)`.
/// A missing `updated_at` reads as 0, which only local queue payloads rely on.
pub(crate) fn split_snapshot(
    snapshot: &Value,
) -> crate::Result<(String, i64, bool, Map<String, Value>)> {
    let Value::Object(map) = snapshot else {
        return Err(Error::InvalidInput("snapshot must be a JSON object".into()));
    };
    let mut data = map.clone();
    let id = data
        .remove("id")
        .and_then(|value| value.as_str().map(str::to_string))
        .ok_or_else(|| Error::InvalidInput("snapshot is missing an id".into()))?;
    let updated_at = data
        .remove("updated_at")
        .and_then(|value| value.as_i64())
        .unwrap_or_default();
    let deleted = data
        .remove("deleted")
        .and_then(|value| value.as_bool())
        .unwrap_or(false);
    Ok((id, updated_at, deleted, data))
}

/// Strongly typed entities that map onto one [`EntityType`].
pub trait Syncable: Serialize + for<'de> Deserialize<'de> {
    const ENTITY_TYPE: EntityType;

    /// Entity id
    fn id(&self) -> &str;

    /// Business fields without the id.
    fn to_fields(&self) -> crate::Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(mut map) => {
                map.remove("id");
                Ok(map)
            }
            _ => Err(Error::InvalidInput(format!(
                "{} must serialize to a JSON object",
                Self::ENTITY_TYPE
            ))),
        }
    }

    /// Rebuild the typed entity from a stored record.
    fn from_record(record: &EntityRecord) -> crate::Result<Self> {
        let mut map = record.data.clone();
        map.insert("id".to_string(), Value::String(record.id.clone()));
        Ok(serde_json::from_value(Value::Object(map))?)
    }
}

/// Workflow state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

/// A task in a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl Task {
    /// Create a new todo task with a fresh id
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: new_entity_id(),
            title: title.into(),
            description: None,
            status: TaskStatus::Todo,
            priority: 0,
            project_id: None,
        }
    }
}

impl Syncable for Task {
    const ENTITY_TYPE: EntityType = EntityType::Task;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A project grouping tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
}

impl Project {
    /// Create a new project with a fresh id
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_entity_id(),
            name: name.into(),
            description: None,
            status: None,
            workspace_id: None,
        }
    }
}

impl Syncable for Project {
    const ENTITY_TYPE: EntityType = EntityType::Project;

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn entity_type_parses_singular_and_plural() {
        assert_eq!("task".parse::<EntityType>().unwrap(), EntityType::Task);
        assert_eq!("Projects".parse::<EntityType>().unwrap(), EntityType::Project);
        assert!("notes".parse::<EntityType>().is_err());
    }

    #[test]
    fn every_type_has_a_distinct_table() {
        let mut tables = EntityType::ALL.map(EntityType::table).to_vec();
        tables.sort_unstable();
        tables.dedup();
        assert_eq!(tables.len(), EntityType::ALL.len());
    }

    #[test]
    fn apply_patch_is_shallow_merge() {
        let mut record = EntityRecord::new(
            EntityType::Task,
            "t-1",
            json!({"title": "A", "priority": 1}).as_object().unwrap().clone(),
        );
        record.apply_patch(json!({"title": "B"}).as_object().unwrap());
        assert_eq!(record.field_str("title"), Some("B"));
        assert_eq!(record.data["priority"], json!(1));
    }

    #[test]
    fn snapshot_splits_back_into_remote_record() {
        let remote = RemoteRecord {
            id: "t-1".to_string(),
            entity_type: EntityType::Task,
            data: json!({"title": "B"}).as_object().unwrap().clone(),
            updated_at: 42,
            deleted: true,
        };
        let rebuilt = RemoteRecord::from_snapshot(EntityType::Task, &remote.snapshot()).unwrap();
        assert_eq!(rebuilt, remote);
    }

    #[test]
    fn remote_snapshot_requires_a_timestamp() {
        for snapshot in [
            json!({"id": "t-1", "title": "B"}),
            json!({"id": "t-1", "updated_at": "yesterday"}),
            json!({"id": "t-1", "updated_at": null}),
        ] {
            assert!(matches!(
                RemoteRecord::from_snapshot(EntityType::Task, &snapshot),
                Err(Error::InvalidInput(_))
            ));
        }

        // local queue payloads may omit it
        let (id, updated_at, _, _) = split_snapshot(&json!({"id": "t-1"})).unwrap();
        assert_eq!((id.as_str(), updated_at), ("t-1", 0));
    }

    #[test]
    fn task_fields_exclude_id() {
        let task = Task::new("Write docs");
        let fields = task.to_fields().unwrap();
        assert!(!fields.contains_key("id"));
        assert_eq!(fields["status"], json!("todo"));

        let record = EntityRecord::new(EntityType::Task, task.id.clone(), fields);
        assert_eq!(Task::from_record(&record).unwrap(), task);
    }
}
