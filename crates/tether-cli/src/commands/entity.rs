use std::path::Path;

use tether_core::{EntityType, StrategyRegistry, SyncOrchestrator};

use crate::commands::common::{
    format_record_lines, normalize_entity_id, open_engine, parse_field_assignments, OpenMode,
};
use crate::error::CliError;

async fn open_local(db_path: &Path, config_path: Option<&Path>) -> Result<SyncOrchestrator, CliError> {
    open_engine(db_path, config_path, OpenMode::Local, StrategyRegistry::new()).await
}

pub async fn run_add(
    entity_type: EntityType,
    assignments: &[String],
    as_json: bool,
    db_path: &Path,
    config_path: Option<&Path>,
) -> Result<(), CliError> {
    let fields = parse_field_assignments(assignments)?;
    let engine = open_local(db_path, config_path).await?;
    let record = engine.create(entity_type, fields).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("{}", record.id);
    }
    Ok(())
}

pub async fn run_list(
    entity_type: EntityType,
    limit: usize,
    as_json: bool,
    db_path: &Path,
    config_path: Option<&Path>,
) -> Result<(), CliError> {
    let engine = open_local(db_path, config_path).await?;
    let mut records = engine.list(entity_type).await?;
    records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    records.truncate(limit);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No {entity_type} entities stored locally.");
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_show(
    entity_type: EntityType,
    id: &str,
    db_path: &Path,
    config_path: Option<&Path>,
) -> Result<(), CliError> {
    let id = normalize_entity_id(id)?;
    let engine = open_local(db_path, config_path).await?;
    let record = engine
        .find(entity_type, &id)
        .await?
        .ok_or_else(|| CliError::NotFound(format!("{entity_type} {id}")))?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub async fn run_update(
    entity_type: EntityType,
    id: &str,
    assignments: &[String],
    db_path: &Path,
    config_path: Option<&Path>,
) -> Result<(), CliError> {
    let id = normalize_entity_id(id)?;
    let mut patch = parse_field_assignments(assignments)?;
    if patch.remove("id").is_some() {
        return Err(CliError::ReservedField("id".to_string()));
    }

    let engine = open_local(db_path, config_path).await?;
    let record = engine
        .update(entity_type, &id, patch)
        .await?
        .ok_or_else(|| CliError::NotFound(format!("{entity_type} {id}")))?;

    println!("Updated {entity_type} {}", record.id);
    Ok(())
}

pub async fn run_delete(
    entity_type: EntityType,
    id: &str,
    db_path: &Path,
    config_path: Option<&Path>,
) -> Result<(), CliError> {
    let id = normalize_entity_id(id)?;
    let engine = open_local(db_path, config_path).await?;
    if !engine.delete(entity_type, &id).await? {
        return Err(CliError::NotFound(format!("{entity_type} {id}")));
    }

    println!("Deleted {entity_type} {id}");
    Ok(())
}
