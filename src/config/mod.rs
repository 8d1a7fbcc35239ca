//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{
    CliArgs, Command, FetchArgs, ResolveArgs, ServeArgs, ServeOverrides, SourceOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "vitae";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8787;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_KV_API_BASE_URL: &str = "https://api.cloudflare.com/client/v4";
const DEFAULT_KV_KEY: &str = "cv-data";
const DEFAULT_KV_REQUEST_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_CLI_PATH: &str = "wrangler";
const DEFAULT_CLI_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_FALLBACK_FILE: &str = "data/cv-data.json";
const DEFAULT_CACHE_TTL_SECS: u64 = 5 * 60;
const DEFAULT_CACHE_STALE_TTL_SECS: u64 = 60 * 60;
const DEFAULT_CACHE_MAX_SIZE_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_CACHE_CLEANUP_INTERVAL_SECS: u64 = 60;
const DEFAULT_RESPONSE_CACHE_PREFIX: &str = "vitae";
const DEFAULT_RESPONSE_CACHE_TTL_SECS: u64 = 5 * 60;
const DEFAULT_RESPONSE_CACHE_STALE_WINDOW_SECS: u64 = 60;
const DEFAULT_RESPONSE_CACHE_LIMIT: u64 = 64;
const DEFAULT_API_MAX_BODY_BYTES: u64 = 1024 * 1024;
const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8787";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub kv: KvSettings,
    pub source: SourceSettings,
    pub cache: CacheSettings,
    pub response_cache: ResponseCacheSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Workers KV REST access. The three credentials are optional so a missing
/// binding can be reported instead of failing startup.
#[derive(Debug, Clone)]
pub struct KvSettings {
    pub account_id: Option<String>,
    pub namespace_id: Option<String>,
    pub api_token: Option<String>,
    pub api_base_url: Url,
    pub key: String,
    pub request_timeout: Duration,
}

/// How the execution context is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    Auto,
    Runtime,
    Build,
}

impl FromStr for ContextMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "runtime" => Ok(Self::Runtime),
            "build" => Ok(Self::Build),
            other => Err(format!(
                "unknown context `{other}`; expected auto, runtime, or build"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub context: ContextMode,
    pub cli_path: PathBuf,
    pub cli_timeout: Duration,
    pub fallback_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub stale_ttl: Duration,
    pub max_size_bytes: usize,
    pub cleanup_interval: Duration,
    pub persist_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResponseCacheSettings {
    pub enabled: bool,
    pub prefix: String,
    pub ttl: Duration,
    pub stale_window: Duration,
    pub limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub admin_token: Option<String>,
    pub max_body_bytes: usize,
    pub base_url: Url,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    load_with_env(cli, None)
}

/// `env` replaces the process environment as the `VITAE__*` source when given.
fn load_with_env(
    cli: &CliArgs,
    env: Option<config::Map<String, String>>,
) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("VITAE")
            .separator("__")
            .source(env),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Resolve(args)) => raw.apply_resolve_overrides(args),
        Some(Command::Fetch(args)) => raw.apply_fetch_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    kv: RawKvSettings,
    source: RawSourceSettings,
    cache: RawCacheSettings,
    response_cache: RawResponseCacheSettings,
    api: RawApiSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(ttl) = overrides.cache_ttl_seconds {
            self.cache.ttl_seconds = Some(ttl);
        }
        if let Some(stale) = overrides.cache_stale_ttl_seconds {
            self.cache.stale_ttl_seconds = Some(stale);
        }
        if let Some(dir) = overrides.cache_persist_dir.as_ref() {
            self.cache.persist_dir = Some(dir.clone());
        }
        if let Some(enabled) = overrides.response_cache_enabled {
            self.response_cache.enabled = Some(enabled);
        }
        if let Some(token) = overrides.api_admin_token.as_ref() {
            self.api.admin_token = Some(token.clone());
        }
        if let Some(limit) = overrides.api_max_body_bytes {
            self.api.max_body_bytes = Some(limit);
        }

        self.apply_source_overrides(&overrides.source);
    }

    fn apply_resolve_overrides(&mut self, args: &ResolveArgs) {
        if let Some(level) = args.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        self.apply_source_overrides(&args.source);
    }

    fn apply_fetch_overrides(&mut self, args: &FetchArgs) {
        if let Some(level) = args.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(url) = args.api_base_url.as_ref() {
            self.api.base_url = Some(url.clone());
        }
        if let Some(dir) = args.cache_persist_dir.as_ref() {
            self.cache.persist_dir = Some(dir.clone());
        }
    }

    fn apply_source_overrides(&mut self, overrides: &SourceOverrides) {
        if let Some(context) = overrides.context.as_ref() {
            self.source.context = Some(context.clone());
        }
        if let Some(path) = overrides.cli_path.as_ref() {
            self.source.cli_path = Some(path.clone());
        }
        if let Some(seconds) = overrides.cli_timeout_seconds {
            self.source.cli_timeout_seconds = Some(seconds);
        }
        if let Some(path) = overrides.fallback_file.as_ref() {
            self.source.fallback_file = Some(path.clone());
        }
        if let Some(id) = overrides.kv_namespace_id.as_ref() {
            self.kv.namespace_id = Some(id.clone());
        }
        if let Some(key) = overrides.kv_key.as_ref() {
            self.kv.key = Some(key.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            kv,
            source,
            cache,
            response_cache,
            api,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            kv: build_kv_settings(kv)?,
            source: build_source_settings(source)?,
            cache: build_cache_settings(cache)?,
            response_cache: build_response_cache_settings(response_cache)?,
            api: build_api_settings(api)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    let graceful_shutdown = positive_secs(graceful_secs, "server.graceful_shutdown_seconds")?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_kv_settings(kv: RawKvSettings) -> Result<KvSettings, LoadError> {
    let api_base_url = parse_url(
        kv.api_base_url.as_deref().unwrap_or(DEFAULT_KV_API_BASE_URL),
        "kv.api_base_url",
    )?;

    let key = kv.key.unwrap_or_else(|| DEFAULT_KV_KEY.to_string());
    if key.trim().is_empty() {
        return Err(LoadError::invalid("kv.key", "key must not be empty"));
    }

    let timeout_secs = kv
        .request_timeout_seconds
        .unwrap_or(DEFAULT_KV_REQUEST_TIMEOUT_SECS);

    Ok(KvSettings {
        account_id: non_blank(kv.account_id),
        namespace_id: non_blank(kv.namespace_id),
        api_token: non_blank(kv.api_token),
        api_base_url,
        key,
        request_timeout: positive_secs(timeout_secs, "kv.request_timeout_seconds")?,
    })
}

fn build_source_settings(source: RawSourceSettings) -> Result<SourceSettings, LoadError> {
    let context = match source.context {
        Some(value) => ContextMode::from_str(&value)
            .map_err(|reason| LoadError::invalid("source.context", reason))?,
        None => ContextMode::Auto,
    };

    let cli_path = source
        .cli_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CLI_PATH));
    if cli_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "source.cli_path",
            "path must not be empty",
        ));
    }

    let fallback_file = source
        .fallback_file
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FALLBACK_FILE));
    if fallback_file.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "source.fallback_file",
            "path must not be empty",
        ));
    }

    let timeout_secs = source
        .cli_timeout_seconds
        .unwrap_or(DEFAULT_CLI_TIMEOUT_SECS);

    Ok(SourceSettings {
        context,
        cli_path,
        cli_timeout: positive_secs(timeout_secs, "source.cli_timeout_seconds")?,
        fallback_file,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let ttl = positive_secs(
        cache.ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        "cache.ttl_seconds",
    )?;
    let stale_ttl = positive_secs(
        cache
            .stale_ttl_seconds
            .unwrap_or(DEFAULT_CACHE_STALE_TTL_SECS),
        "cache.stale_ttl_seconds",
    )?;
    let cleanup_interval = positive_secs(
        cache
            .cleanup_interval_seconds
            .unwrap_or(DEFAULT_CACHE_CLEANUP_INTERVAL_SECS),
        "cache.cleanup_interval_seconds",
    )?;
    let max_size_bytes = positive_usize(
        cache
            .max_size_bytes
            .unwrap_or(DEFAULT_CACHE_MAX_SIZE_BYTES),
        "cache.max_size_bytes",
    )?;

    let persist_dir = cache
        .persist_dir
        .filter(|dir| !dir.as_os_str().is_empty());

    Ok(CacheSettings {
        ttl,
        stale_ttl,
        max_size_bytes,
        cleanup_interval,
        persist_dir,
    })
}

fn build_response_cache_settings(
    cache: RawResponseCacheSettings,
) -> Result<ResponseCacheSettings, LoadError> {
    let prefix = cache
        .prefix
        .unwrap_or_else(|| DEFAULT_RESPONSE_CACHE_PREFIX.to_string());
    if prefix.trim().is_empty() {
        return Err(LoadError::invalid(
            "response_cache.prefix",
            "prefix must not be empty",
        ));
    }

    let ttl = positive_secs(
        cache.ttl_seconds.unwrap_or(DEFAULT_RESPONSE_CACHE_TTL_SECS),
        "response_cache.ttl_seconds",
    )?;
    let stale_window = Duration::from_secs(
        cache
            .stale_window_seconds
            .unwrap_or(DEFAULT_RESPONSE_CACHE_STALE_WINDOW_SECS),
    );
    let limit = positive_usize(
        cache.limit.unwrap_or(DEFAULT_RESPONSE_CACHE_LIMIT),
        "response_cache.limit",
    )?;
    let limit = NonZeroUsize::new(limit)
        .ok_or_else(|| LoadError::invalid("response_cache.limit", "must be greater than zero"))?;

    Ok(ResponseCacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        prefix,
        ttl,
        stale_window,
        limit,
    })
}

fn build_api_settings(api: RawApiSettings) -> Result<ApiSettings, LoadError> {
    let max_body_bytes = positive_usize(
        api.max_body_bytes.unwrap_or(DEFAULT_API_MAX_BODY_BYTES),
        "api.max_body_bytes",
    )?;
    let base_url = parse_url(
        api.base_url.as_deref().unwrap_or(DEFAULT_API_BASE_URL),
        "api.base_url",
    )?;

    Ok(ApiSettings {
        admin_token: non_blank(api.admin_token),
        max_body_bytes,
        base_url,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawKvSettings {
    account_id: Option<String>,
    namespace_id: Option<String>,
    api_token: Option<String>,
    api_base_url: Option<String>,
    key: Option<String>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSourceSettings {
    context: Option<String>,
    cli_path: Option<PathBuf>,
    cli_timeout_seconds: Option<u64>,
    fallback_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    ttl_seconds: Option<u64>,
    stale_ttl_seconds: Option<u64>,
    max_size_bytes: Option<u64>,
    cleanup_interval_seconds: Option<u64>,
    persist_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawResponseCacheSettings {
    enabled: Option<bool>,
    prefix: Option<String>,
    ttl_seconds: Option<u64>,
    stale_window_seconds: Option<u64>,
    limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawApiSettings {
    admin_token: Option<String>,
    max_body_bytes: Option<u64>,
    base_url: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_url(value: &str, key: &'static str) -> Result<Url, LoadError> {
    Url::parse(value).map_err(|err| LoadError::invalid(key, format!("invalid url `{value}`: {err}")))
}

fn positive_secs(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn positive_usize(value: u64, key: &'static str) -> Result<usize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    usize::try_from(value)
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
