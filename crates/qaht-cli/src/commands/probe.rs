use std::collections::BTreeSet;
use std::sync::Arc;

use qaht_core::{
    CacheMode, CacheStore, CallError, HttpClient, HttpRequest, ReqwestHttpClient, ResilienceError,
    ResilienceRegistry,
};
use serde_json::{json, Value};

use crate::cli::{Cli, ProbeArgs};
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceSpec {
    name: String,
    url: String,
}

pub async fn run(args: &ProbeArgs, cli: &Cli) -> Result<CommandResult, CliError> {
    let sources = parse_sources(&args.sources)?;
    let headers = Arc::new(parse_headers(&args.headers)?);
    let config = super::load_config(cli)?;

    let mut warnings = Vec::new();
    let cache = if cli.no_persist {
        CacheStore::new(config.cache_ttl())
    } else {
        match super::open_backend(cli) {
            Ok(backend) => CacheStore::with_backend(config.cache_ttl(), Arc::new(backend)),
            Err(error) => {
                tracing::warn!(error = %error, "durable cache unavailable, caching in memory only");
                warnings.push(format!("durable cache unavailable: {error}"));
                CacheStore::new(config.cache_ttl())
            }
        }
    };
    let registry = ResilienceRegistry::with_cache(config, cache);

    let client = Arc::new(ReqwestHttpClient::new());
    let timeout_ms = args.timeout_ms;
    let probes = sources
        .into_iter()
        .map(|source| {
            registry.register_dependency(&source.name, false, false);
            let client = Arc::clone(&client);
            let headers = Arc::clone(&headers);
            let fetch = registry.wrap(
                &source.name,
                &format!("{}.get", source.name),
                move |url: String| {
                    let client = Arc::clone(&client);
                    let request = headers
                        .iter()
                        .fold(HttpRequest::get(url), |request, (name, value)| {
                            request.with_header(name.as_str(), value.as_str())
                        })
                        .with_timeout_ms(timeout_ms);
                    async move { fetch_json(&*client, request).await }
                },
            );
            (source.name, source.url, fetch)
        })
        .collect::<Vec<_>>();

    let mode = CacheMode::from(args.mode);
    let mut rounds = Vec::new();
    let mut all_failed = false;
    for round in 1..=args.rounds {
        let calls = probes
            .iter()
            .map(|(name, url, fetch)| (name.clone(), move || fetch.call_with_mode(url.clone(), mode)));

        let outcome = if args.first {
            match registry.fetch_first(calls).await {
                Ok(success) => serde_json::to_value(success)?,
                Err(error) => {
                    all_failed = true;
                    failure_value(&error)?
                }
            }
        } else {
            match registry.fetch_multi(calls).await {
                Ok(result) => serde_json::to_value(result)?,
                Err(error) => {
                    all_failed = true;
                    failure_value(&error)?
                }
            }
        };
        tracing::debug!(round, all_failed, "probe round finished");
        rounds.push(json!({ "round": round, "outcome": outcome }));
    }

    let data = json!({
        "strategy": if args.first { "first" } else { "multi" },
        "durable_cache": registry.cache().is_durable(),
        "rounds": rounds,
        "status": serde_json::to_value(registry.status_report())?,
    });
    Ok(CommandResult::ok(data)
        .with_warnings(warnings)
        .with_all_failed(all_failed))
}

async fn fetch_json(client: &dyn HttpClient, request: HttpRequest) -> Result<Value, CallError> {
    let response = client.execute(request).await?;
    match serde_json::from_str(&response.body) {
        Ok(value) => Ok(value),
        Err(_) => Ok(Value::String(response.body)),
    }
}

fn failure_value(error: &ResilienceError) -> Result<Value, CliError> {
    let failures = match error {
        ResilienceError::AllSourcesFailed { failures } => serde_json::to_value(failures)?,
        _ => Value::Null,
    };
    Ok(json!({
        "error": error.to_string(),
        "code": error.code(),
        "failures": failures,
    }))
}

fn parse_sources(raw: &[String]) -> Result<Vec<SourceSpec>, CliError> {
    let mut seen = BTreeSet::new();
    raw.iter()
        .map(|entry| {
            let source = parse_source(entry)?;
            if !seen.insert(source.name.clone()) {
                return Err(CliError::Usage(format!(
                    "source '{}' is given more than once",
                    source.name
                )));
            }
            Ok(source)
        })
        .collect()
}

fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>, CliError> {
    raw.iter()
        .map(|entry| {
            let Some((name, value)) = entry.split_once(':') else {
                return Err(CliError::Usage(format!(
                    "header '{entry}' must be given as 'name: value'"
                )));
            };
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(CliError::Usage(format!(
                    "header '{entry}' has an invalid name"
                )));
            }
            Ok((name.to_owned(), value.trim().to_owned()))
        })
        .collect()
}

fn parse_source(raw: &str) -> Result<SourceSpec, CliError> {
    let Some((name, url)) = raw.split_once('=') else {
        return Err(CliError::Usage(format!(
            "source '{raw}' must be given as name=url"
        )));
    };
    let name = name.trim();
    let url = url.trim();
    if name.is_empty() || url.is_empty() {
        return Err(CliError::Usage(format!(
            "source '{raw}' needs both a name and a url"
        )));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(CliError::Usage(format!(
            "source '{name}' url must start with http:// or https://"
        )));
    }
    Ok(SourceSpec {
        name: name.to_owned(),
        url: url.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn splits_name_from_url_at_first_equals() {
        let source = parse_source("yahoo=https://q.example/quote?symbols=AAPL").expect("valid");
        assert_eq!(source.name, "yahoo");
        assert_eq!(source.url, "https://q.example/quote?symbols=AAPL");
    }

    #[test]
    fn rejects_malformed_and_duplicate_sources() {
        assert!(matches!(parse_source("yahoo"), Err(CliError::Usage(_))));
        assert!(matches!(parse_source("=https://x.example"), Err(CliError::Usage(_))));
        assert!(matches!(parse_source("ftp=ftp://x.example"), Err(CliError::Usage(_))));

        let duplicated = vec![
            String::from("a=https://one.example"),
            String::from("a=https://two.example"),
        ];
        assert!(matches!(parse_sources(&duplicated), Err(CliError::Usage(_))));
    }

    #[test]
    fn headers_split_at_the_first_colon() {
        let headers = parse_headers(&[
            String::from("x-api-key: abc:def"),
            String::from("Accept:application/json"),
        ])
        .expect("valid headers");
        assert_eq!(
            headers,
            vec![
                (String::from("x-api-key"), String::from("abc:def")),
                (String::from("Accept"), String::from("application/json")),
            ]
        );

        assert!(matches!(parse_headers(&[String::from("no-colon")]), Err(CliError::Usage(_))));
        assert!(matches!(parse_headers(&[String::from(": value")]), Err(CliError::Usage(_))));
    }

    #[tokio::test]
    async fn bad_source_fails_before_any_request() {
        let cli = Cli::try_parse_from(["qaht", "--no-persist", "probe", "not-a-source"])
            .expect("arguments parse");
        let crate::cli::Command::Probe(args) = &cli.command else {
            panic!("expected probe");
        };

        let error = run(args, &cli).await.err().expect("usage error");
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn all_sources_failed_lists_each_failure() {
        let error = ResilienceError::AllSourcesFailed {
            failures: [(String::from("a"), String::from("timeout"))]
                .into_iter()
                .collect(),
        };
        let value = failure_value(&error).expect("serializable");
        assert_eq!(value["code"], "resilience.all_sources_failed");
        assert_eq!(value["failures"]["a"], "timeout");
    }
}
