//! Tether CLI - work with locally cached entities and sync them with a remote API
//!
//! Writes land locally first and are uploaded by `tether sync`.

mod cli;
mod commands;
mod error;


use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, DeadLetterCommands};
use crate::commands::common::{resolve_config_path, resolve_db_path};
use crate::commands::completions::run_completions;
use crate::commands::conflicts::{run_conflicts, run_dead_letters, run_requeue, run_resolve};
use crate::commands::entity::{run_add, run_delete, run_list, run_show, run_update};
use crate::commands::sync::{run_status, run_sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tether=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let db_path = resolve_db_path(cli.db_path)?;
    let config_path = resolve_config_path(cli.config);
    let config_path = config_path.as_deref();

    match cli.command {
        Commands::Add { kind, fields, json } => {
            run_add(kind.into(), &fields, json, &db_path, config_path).await?;
        }
        Commands::List { kind, limit, json } => {
            run_list(kind.into(), limit, json, &db_path, config_path).await?;
        }
        Commands::Show { kind, id } => run_show(kind.into(), &id, &db_path, config_path).await?,
        Commands::Update { kind, id, fields } => {
            run_update(kind.into(), &id, &fields, &db_path, config_path).await?;
        }
        Commands::Delete { kind, id } => run_delete(kind.into(), &id, &db_path, config_path).await?,
        Commands::Sync {
            watch,
            review,
            json,
        } => run_sync(watch, review, json, &db_path, config_path).await?,
        Commands::Status { json } => run_status(json, &db_path, config_path).await?,
        Commands::Conflicts { all, limit, json } => {
            run_conflicts(all, limit, json, &db_path, config_path).await?;
        }
        Commands::Resolve {
            change_id,
            resolution,
        } => run_resolve(&change_id, resolution.into(), &db_path, config_path).await?,
        Commands::DeadLetters {
            command: Some(DeadLetterCommands::Requeue { id }),
            ..
        } => run_requeue(&id, &db_path, config_path).await?,
        Commands::DeadLetters {
            command: None,
            limit,
            json,
        } => run_dead_letters(limit, json, &db_path, config_path).await?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
