use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tether_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid field assignment '{0}', expected name=value")]
    InvalidField(String),
    #[error("Field '{0}' is managed by the sync engine")]
    ReservedField(String),
    #[error("Entity ID cannot be empty")]
    EmptyId,
    #[error("{0} not found")]
    NotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Set TETHER_API_URL (and TETHER_API_TOKEN) or add a `remote` section to the config file."
    )]
    SyncNotConfigured,
}
