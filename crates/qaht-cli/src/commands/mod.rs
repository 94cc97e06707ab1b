mod cache;
mod config;
mod probe;

use std::path::PathBuf;

use qaht_core::{ResilienceConfig, WarehouseBackend};
use qaht_warehouse::WarehouseConfig;
use serde_json::{json, Value};

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub struct CommandResult {
    pub data: Value,
    pub warnings: Vec<String>,
    /// Set when the command ran but every probed source failed.
    pub all_failed: bool,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            warnings: Vec::new(),
            all_failed: false,
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn with_all_failed(mut self, all_failed: bool) -> Self {
        self.all_failed = all_failed;
        self
    }

    pub fn to_output(&self) -> Value {
        json!({
            "data": self.data,
            "warnings": self.warnings,
        })
    }
}

pub async fn run(cli: &Cli) -> Result<CommandResult, CliError> {
    match &cli.command {
        Command::Probe(args) => probe::run(args, cli).await,
        Command::Cache(args) => cache::run(args, cli),
        Command::Config => config::run(cli),
    }
}

fn load_config(cli: &Cli) -> Result<ResilienceConfig, CliError> {
    Ok(ResilienceConfig::load(cli.config.as_deref())?)
}

fn cache_db_path(cli: &Cli) -> PathBuf {
    cli.cache_db
        .clone()
        .unwrap_or_else(|| WarehouseConfig::default().db_path)
}

fn open_backend(cli: &Cli) -> Result<WarehouseBackend, CliError> {
    if cli.no_persist {
        return Err(CliError::Usage(String::from(
            "--no-persist leaves no durable cache to operate on",
        )));
    }
    Ok(WarehouseBackend::open(cache_db_path(cli))?)
}
