//! CLI argument definitions for qaht.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `probe` | Fetch `name=url` sources through the resilience layer |
//! | `cache` | Inspect and maintain the durable response cache |
//! | `config` | Print the effective resilience configuration |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | none | JSON configuration file |
//! | `--log-level` | `RUST_LOG` or `warn` | Tracing filter for stderr logs |
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--cache-db` | `$QAHT_HOME/cache/responses.duckdb` | Durable cache database |
//! | `--no-persist` | `false` | Keep the cache in memory only |
//!
//! # Examples
//!
//! ```bash
//! # Fan out to two sources, tolerating partial failure
//! qaht probe coingecko=https://api.coingecko.com/api/v3/ping yahoo=https://query1.finance.yahoo.com/v1/test/getcrumb
//!
//! # Ordered fallback, repeated to show cache hits in the stats
//! qaht probe primary=https://a.example/q backup=https://b.example/q --first --rounds 3 --pretty
//!
//! # Keyed API
//! qaht probe newsapi=https://newsapi.org/v2/top-headlines?country=us --header "x-api-key: $NEWSAPI_KEY"
//!
//! # Durable cache maintenance
//! qaht cache stats
//! qaht cache invalidate coingecko.get --operation
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use qaht_core::CacheMode;

/// qaht - resilient market data probing
#[derive(Debug, Parser)]
#[command(
    name = "qaht",
    author,
    version,
    about = "Probe market data sources through circuit breaking, pacing, caching and retries"
)]
pub struct Cli {
    /// JSON configuration file; `QAHT_*` environment variables override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `qaht_core=info`. Defaults to `RUST_LOG`.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Durable cache database path.
    #[arg(long, global = true)]
    pub cache_db: Option<PathBuf>,

    /// Do not open the durable cache; responses are cached in memory only.
    #[arg(long, global = true, default_value_t = false)]
    pub no_persist: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch one or more sources through the full resilience chain.
    ///
    /// Each source is `name=url`; the name is the dependency its breaker,
    /// pacing and health are tracked under.
    ///
    /// # Examples
    ///
    ///   qaht probe coingecko=https://api.coingecko.com/api/v3/ping
    ///   qaht probe a=https://a.example b=https://b.example --first
    Probe(ProbeArgs),

    /// Durable cache management commands.
    Cache(CacheArgs),

    /// Print the effective configuration after file and environment layers.
    Config,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Sources as `name=url`.
    #[arg(required = true, num_args = 1..)]
    pub sources: Vec<String>,

    /// Try sources in order and stop at the first success.
    #[arg(long, default_value_t = false)]
    pub first: bool,

    /// How each call uses the response cache.
    #[arg(long, value_enum, default_value_t = ModeArg::Use)]
    pub mode: ModeArg,

    /// Per-request timeout in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,

    /// Extra request header as `name: value`, sent to every source. Repeatable.
    #[arg(long = "header", value_name = "NAME: VALUE")]
    pub headers: Vec<String>,

    /// Repeat the probe this many times.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub rounds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Serve live cache entries, store fresh results.
    Use,
    /// Skip the cache read, store fresh results.
    Refresh,
    /// Neither read nor write the cache.
    Bypass,
}

impl From<ModeArg> for CacheMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Use => Self::Use,
            ModeArg::Refresh => Self::Refresh,
            ModeArg::Bypass => Self::Bypass,
        }
    }
}

#[derive(Debug, Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Entry counts and age range of the durable cache.
    Stats,
    /// Delete expired entries.
    Cleanup,
    /// Delete every entry.
    Clear,
    /// Delete one entry, or every entry of an operation.
    Invalidate(InvalidateArgs),
}

#[derive(Debug, Args)]
pub struct InvalidateArgs {
    /// Cache key, or operation name with `--operation`.
    pub key: String,

    /// Treat `key` as an operation name and remove all of its entries.
    #[arg(long, default_value_t = false)]
    pub operation: bool,
}
