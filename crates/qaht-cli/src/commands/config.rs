use serde_json::{json, Value};

use crate::cli::Cli;
use crate::error::CliError;

use super::CommandResult;

pub fn run(cli: &Cli) -> Result<CommandResult, CliError> {
    let config = super::load_config(cli)?;
    let cache_db = if cli.no_persist {
        Value::Null
    } else {
        Value::String(super::cache_db_path(cli).display().to_string())
    };
    let config_file = cli
        .config
        .as_ref()
        .map(|path| Value::String(path.display().to_string()))
        .unwrap_or(Value::Null);

    Ok(CommandResult::ok(json!({
        "config_file": config_file,
        "cache_db": cache_db,
        "resilience": serde_json::to_value(&config)?,
    })))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn prints_file_values_over_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("qaht.json");
        std::fs::write(&path, r#"{"failure_threshold": 7, "cache_ttl_secs": 120}"#)
            .expect("write config");

        let cli = Cli::try_parse_from([
            "qaht",
            "--no-persist",
            "--config",
            path.to_str().expect("utf-8 path"),
            "config",
        ])
        .expect("arguments parse");
        let result = run(&cli).expect("config");

        assert_eq!(result.data["resilience"]["failure_threshold"], 7);
        assert_eq!(result.data["resilience"]["cache_ttl_secs"], 120);
        assert_eq!(result.data["resilience"]["success_threshold"], 10);
        assert!(result.data["cache_db"].is_null());
    }

    #[test]
    fn unreadable_config_is_a_usage_error() {
        let cli = Cli::try_parse_from([
            "qaht",
            "--config",
            "/nonexistent/qaht.json",
            "config",
        ])
        .expect("arguments parse");
        let error = run(&cli).err().expect("config error");
        assert_eq!(error.exit_code(), 2);
    }
}
