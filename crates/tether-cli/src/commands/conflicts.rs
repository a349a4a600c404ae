use std::path::Path;

use tether_core::sync::ResolutionAction;
use tether_core::{Resolution, StrategyRegistry};

use crate::commands::common::{
    format_conflict_lines, format_dead_letter_lines, normalize_entity_id, open_engine, OpenMode,
};
use crate::error::CliError;

pub async fn run_conflicts(
    include_resolved: bool,
    limit: usize,
    as_json: bool,
    db_path: &Path,
    config_path: Option<&Path>,
) -> Result<(), CliError> {
    let engine = open_engine(db_path, config_path, OpenMode::Local, StrategyRegistry::new()).await?;
    let conflicts = engine.conflicts(include_resolved, limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_resolve(
    change_id: &str,
    resolution: Resolution,
    db_path: &Path,
    config_path: Option<&Path>,
) -> Result<(), CliError> {
    let change_id = normalize_entity_id(change_id)?;
    let engine = open_engine(db_path, config_path, OpenMode::Local, StrategyRegistry::new()).await?;
    let action = engine.resolve_conflict(&change_id, resolution).await?;

    println!("{}", describe_action(&action));
    Ok(())
}

pub fn describe_action(action: &ResolutionAction) -> String {
    match action {
        ResolutionAction::Requeued(operation) => {
            format!("Kept local version; {operation} queued for the next sync")
        }
        ResolutionAction::AppliedRemote => "Applied remote version".to_string(),
        ResolutionAction::Merged { local_fields } if local_fields.is_empty() => {
            "Merged: every field taken from remote; queued for the next sync".to_string()
        }
        ResolutionAction::Merged { local_fields } => format!(
            "Merged: kept local {}; queued for the next sync",
            local_fields.join(", ")
        ),
        ResolutionAction::Parked => "Left open for review".to_string(),
    }
}

pub async fn run_dead_letters(
    limit: usize,
    as_json: bool,
    db_path: &Path,
    config_path: Option<&Path>,
) -> Result<(), CliError> {
    let engine = open_engine(db_path, config_path, OpenMode::Local, StrategyRegistry::new()).await?;
    let letters = engine.dead_letters(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&letters)?);
        return Ok(());
    }

    if letters.is_empty() {
        println!("No dead-lettered uploads.");
        return Ok(());
    }

    for line in format_dead_letter_lines(&letters) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_requeue(
    id: &str,
    db_path: &Path,
    config_path: Option<&Path>,
) -> Result<(), CliError> {
    let id = normalize_entity_id(id)?;
    let engine = open_engine(db_path, config_path, OpenMode::Local, StrategyRegistry::new()).await?;
    let item = engine.requeue_dead_letter(&id).await?;

    println!(
        "Requeued {} {} {} as {}",
        item.operation, item.entity_type, item.entity_id, item.id
    );
    Ok(())
}
