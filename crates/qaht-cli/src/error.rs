use qaht_core::{ConfigError, ResilienceError};
use qaht_warehouse::WarehouseError;
use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("usage error: {0}")]
    Usage(String),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Usage(_) => 2,
            Self::Resilience(ResilienceError::Serialization(_)) => 4,
            Self::Resilience(ResilienceError::Persistence(_)) => 6,
            Self::Resilience(_) => 3,
            Self::Warehouse(_) => 6,
            Self::Serialization(_) => 4,
            Self::Io(_) => 10,
        }
    }
}
