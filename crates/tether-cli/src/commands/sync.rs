use std::path::Path;

use tether_core::models::Resolution;
use tether_core::sync::{FixedStrategy, SyncCycleResult};
use tether_core::{BackgroundSync, EntityType, Reachability, StrategyRegistry};

use crate::commands::common::{format_cycle_summary, format_timestamp, open_engine, OpenMode};
use crate::error::CliError;

pub fn strategies_for(review: bool) -> StrategyRegistry {
    let mut strategies = StrategyRegistry::new();
    if review {
        for entity_type in EntityType::ALL {
            strategies.register(entity_type, FixedStrategy(Resolution::Manual));
        }
    }
    strategies
}

pub async fn run_sync(
    watch: bool,
    review: bool,
    as_json: bool,
    db_path: &Path,
    config_path: Option<&Path>,
) -> Result<(), CliError> {
    let engine = open_engine(
        db_path,
        config_path,
        OpenMode::RequireRemote,
        strategies_for(review),
    )
    .await?;

    if !watch {
        let result = engine.sync().await?;
        print_cycle(&result, as_json)?;
        return Ok(());
    }

    let interval = engine.config().sync_interval();
    let listener = engine.events().subscribe(move |result| {
        if let Err(error) = print_cycle(result, as_json) {
            tracing::warn!("Could not print sync result: {error}");
        }
    });
    let background = BackgroundSync::spawn(engine.clone(), &Reachability::default(), interval);
    println!(
        "Syncing every {}s, press Ctrl-C to stop",
        interval.as_secs()
    );

    tokio::signal::ctrl_c().await?;
    background.shutdown().await;
    engine.events().unsubscribe(listener);
    Ok(())
}

fn print_cycle(result: &SyncCycleResult, as_json: bool) -> Result<(), CliError> {
    if as_json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }

    let outcome = if result.success { "Sync completed" } else { "Sync finished with errors" };
    println!("{outcome} at {}", format_timestamp(result.finished_at));
    for line in format_cycle_summary(result) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_status(
    as_json: bool,
    db_path: &Path,
    config_path: Option<&Path>,
) -> Result<(), CliError> {
    let engine = open_engine(db_path, config_path, OpenMode::Local, StrategyRegistry::new()).await?;
    let status = engine.status().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("state:          {}", status.state);
    println!("pending items:  {}", status.pending_items);
    println!("open conflicts: {}", status.open_conflicts);
    println!("dead letters:   {}", status.dead_letters);
    println!(
        "watermark:      {}",
        status
            .watermark
            .map_or_else(|| "never synced".to_string(), format_timestamp)
    );
    Ok(())
}
