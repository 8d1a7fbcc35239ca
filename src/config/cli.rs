use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the vitae binary.
#[derive(Debug, Parser)]
#[command(name = "vitae", version, about = "CV data service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "VITAE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the CV HTTP API.
    Serve(Box<ServeArgs>),
    /// Resolve the CV document once and write it to a file or stdout.
    Resolve(ResolveArgs),
    /// Read the CV document from a running API through the value cache.
    Fetch(FetchArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SourceOverrides {
    /// Override the execution context (auto|runtime|build).
    #[arg(long = "source-context", value_name = "CONTEXT")]
    pub context: Option<String>,

    /// Override the KV CLI executable used in build context.
    #[arg(long = "source-cli-path", value_name = "PATH")]
    pub cli_path: Option<PathBuf>,

    /// Override the CLI timeout.
    #[arg(long = "source-cli-timeout-seconds", value_name = "SECONDS")]
    pub cli_timeout_seconds: Option<u64>,

    /// Override the bundled fallback document.
    #[arg(long = "source-fallback-file", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub fallback_file: Option<PathBuf>,

    /// Override the KV namespace id.
    #[arg(long = "kv-namespace-id", value_name = "ID")]
    pub kv_namespace_id: Option<String>,

    /// Override the KV key holding the document.
    #[arg(long = "kv-key", value_name = "KEY")]
    pub kv_key: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub source: SourceOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the value cache freshness window.
    #[arg(long = "cache-ttl-seconds", value_name = "SECONDS")]
    pub cache_ttl_seconds: Option<u64>,

    /// Override the value cache stale window.
    #[arg(long = "cache-stale-ttl-seconds", value_name = "SECONDS")]
    pub cache_stale_ttl_seconds: Option<u64>,

    /// Directory for persisted cache entries; memory-only when unset.
    #[arg(long = "cache-persist-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub cache_persist_dir: Option<PathBuf>,

    /// Toggle the API response cache.
    #[arg(
        long = "response-cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub response_cache_enabled: Option<bool>,

    /// Override the bearer token required for write endpoints.
    #[arg(long = "api-admin-token", env = "VITAE_ADMIN_TOKEN", value_name = "TOKEN")]
    pub api_admin_token: Option<String>,

    /// Override the request body limit in bytes.
    #[arg(long = "api-max-body-bytes", value_name = "BYTES")]
    pub api_max_body_bytes: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct ResolveArgs {
    #[command(flatten)]
    pub source: SourceOverrides,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Pretty-print the resolved document.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub pretty: bool,

    /// File to write; stdout when omitted.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct FetchArgs {
    /// Override the API base URL.
    #[arg(long = "api-base-url", value_name = "URL")]
    pub api_base_url: Option<String>,

    /// Directory for persisted cache entries; memory-only when unset.
    #[arg(long = "cache-persist-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub cache_persist_dir: Option<PathBuf>,

    /// Bypass cached entries and fetch again.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub refresh: bool,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Pretty-print the document.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub pretty: bool,
}
