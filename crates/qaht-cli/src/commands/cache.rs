use serde_json::json;

use crate::cli::{CacheArgs, CacheCommand, Cli};
use crate::error::CliError;

use super::CommandResult;

pub fn run(args: &CacheArgs, cli: &Cli) -> Result<CommandResult, CliError> {
    let backend = super::open_backend(cli)?;
    let db_path = backend.warehouse().db_path().display().to_string();

    let data = match &args.command {
        CacheCommand::Stats => json!({
            "db_path": db_path,
            "stats": serde_json::to_value(backend.stats()?)?,
        }),
        CacheCommand::Cleanup => {
            let removed = backend.purge_expired_now()?;
            tracing::info!(removed, "purged expired cache entries");
            json!({ "db_path": db_path, "removed": removed })
        }
        CacheCommand::Clear => {
            let removed = backend.warehouse().clear()?;
            tracing::info!(removed, "cleared durable cache");
            json!({ "db_path": db_path, "removed": removed })
        }
        CacheCommand::Invalidate(invalidate) => {
            let removed = if invalidate.operation {
                backend.invalidate_operation(&invalidate.key)?
            } else {
                usize::from(backend.warehouse().remove(&invalidate.key)?)
            };
            json!({
                "db_path": db_path,
                "key": invalidate.key,
                "operation": invalidate.operation,
                "removed": removed,
            })
        }
    };

    Ok(CommandResult::ok(data))
}
