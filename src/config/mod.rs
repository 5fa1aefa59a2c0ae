//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "turbine";
const ENV_PREFIX: &str = "TURBINE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_BODY_LIMIT_BYTES: u64 = 2 * 1024 * 1024;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_CACHE_SWEEP_SECS: u64 = 60;
const DEFAULT_CACHE_DATA_FILE: &str = "data/cache.json";
const DEFAULT_CACHE_AUTO_SAVE_SECS: u64 = 30;
const DEFAULT_PUBSUB_LOG_FILE: &str = "data/pubsub.log";
const DEFAULT_QUEUE_LOG_FILE: &str = "data/queue.log";
const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;
const DEFAULT_COMPACT_INTERVAL_SECS: u64 = 600;
const DEFAULT_RETENTION_SECS: u64 = 86_400;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_CONTEXT_POOL_CAPACITY: usize = 1024;

/// Command-line arguments for the turbine binary.
#[derive(Debug, Parser)]
#[command(name = "turbine", version, about = "turbine demo server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TURBINE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the demo HTTP server.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
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

    /// Toggle the per-request access log.
    #[arg(
        long = "access-log",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub access_log: Option<bool>,

    /// Toggle the response cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the default response cache TTL.
    #[arg(long = "cache-default-ttl-seconds", value_name = "SECONDS")]
    pub cache_default_ttl_seconds: Option<u64>,

    /// Snapshot the response cache to disk.
    #[arg(
        long = "cache-persist",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_persist: Option<bool>,

    /// Use the durable, log-backed event bus.
    #[arg(
        long = "pubsub-durable",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub pubsub_durable: Option<bool>,

    /// Use the durable, log-backed task queue.
    #[arg(
        long = "queue-durable",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub queue_durable: Option<bool>,

    /// Allow more than one worker per queue.
    #[arg(
        long = "queue-allow-multiple-workers",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub queue_allow_multiple_workers: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub pubsub: PubSubSettings,
    pub queue: QueueSettings,
    pub context: ContextSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub body_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
    pub access_log: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
    pub persist: bool,
    pub data_file: PathBuf,
    pub auto_save: bool,
    pub auto_save_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct PubSubSettings {
    pub enabled: bool,
    pub durable: bool,
    pub log_file: PathBuf,
    pub subscriber_capacity: NonZeroUsize,
    pub compact_interval: Duration,
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub enabled: bool,
    pub durable: bool,
    pub log_file: PathBuf,
    pub capacity: NonZeroUsize,
    pub allow_multiple_workers: bool,
    pub max_retries: u32,
    pub cleanup_interval: Duration,
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub pool_capacity: usize,
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

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
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
    cache: RawCacheSettings,
    pubsub: RawPubSubSettings,
    queue: RawQueueSettings,
    context: RawContextSettings,
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
        if let Some(access_log) = overrides.access_log {
            self.logging.access_log = Some(access_log);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(ttl) = overrides.cache_default_ttl_seconds {
            self.cache.default_ttl_seconds = Some(ttl);
        }
        if let Some(persist) = overrides.cache_persist {
            self.cache.persist = Some(persist);
        }
        if let Some(durable) = overrides.pubsub_durable {
            self.pubsub.durable = Some(durable);
        }
        if let Some(durable) = overrides.queue_durable {
            self.queue.durable = Some(durable);
        }
        if let Some(allow) = overrides.queue_allow_multiple_workers {
            self.queue.allow_multiple_workers = Some(allow);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            pubsub,
            queue,
            context,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            pubsub: build_pubsub_settings(pubsub)?,
            queue: build_queue_settings(queue)?,
            context: build_context_settings(context),
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
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    let body_limit = non_zero_usize(
        server.body_limit_bytes.unwrap_or(DEFAULT_BODY_LIMIT_BYTES),
        "server.body_limit_bytes",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        body_limit,
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

    Ok(LoggingSettings {
        level,
        format,
        access_log: logging.access_log.unwrap_or(true),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let default_ttl = cache.default_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS);
    if default_ttl == 0 {
        return Err(LoadError::invalid(
            "cache.default_ttl_seconds",
            "must be greater than zero",
        ));
    }

    let data_file = non_empty_path(
        cache.data_file,
        DEFAULT_CACHE_DATA_FILE,
        "cache.data_file",
    )?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        default_ttl: Duration::from_secs(default_ttl),
        sweep_interval: positive_secs(
            cache.sweep_interval_seconds,
            DEFAULT_CACHE_SWEEP_SECS,
            "cache.sweep_interval_seconds",
        )?,
        persist: cache.persist.unwrap_or(false),
        data_file,
        auto_save: cache.auto_save.unwrap_or(false),
        auto_save_interval: positive_secs(
            cache.auto_save_interval_seconds,
            DEFAULT_CACHE_AUTO_SAVE_SECS,
            "cache.auto_save_interval_seconds",
        )?,
    })
}

fn build_pubsub_settings(pubsub: RawPubSubSettings) -> Result<PubSubSettings, LoadError> {
    Ok(PubSubSettings {
        enabled: pubsub.enabled.unwrap_or(true),
        durable: pubsub.durable.unwrap_or(false),
        log_file: non_empty_path(pubsub.log_file, DEFAULT_PUBSUB_LOG_FILE, "pubsub.log_file")?,
        subscriber_capacity: non_zero_usize(
            pubsub
                .subscriber_capacity
                .unwrap_or(DEFAULT_CHANNEL_CAPACITY as u64),
            "pubsub.subscriber_capacity",
        )?,
        compact_interval: positive_secs(
            pubsub.compact_interval_seconds,
            DEFAULT_COMPACT_INTERVAL_SECS,
            "pubsub.compact_interval_seconds",
        )?,
        retention: positive_secs(
            pubsub.retention_seconds,
            DEFAULT_RETENTION_SECS,
            "pubsub.retention_seconds",
        )?,
    })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    Ok(QueueSettings {
        enabled: queue.enabled.unwrap_or(true),
        durable: queue.durable.unwrap_or(false),
        log_file: non_empty_path(queue.log_file, DEFAULT_QUEUE_LOG_FILE, "queue.log_file")?,
        capacity: non_zero_usize(
            queue.capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY as u64),
            "queue.capacity",
        )?,
        allow_multiple_workers: queue.allow_multiple_workers.unwrap_or(false),
        max_retries: queue.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        cleanup_interval: positive_secs(
            queue.cleanup_interval_seconds,
            DEFAULT_COMPACT_INTERVAL_SECS,
            "queue.cleanup_interval_seconds",
        )?,
        retention: positive_secs(
            queue.retention_seconds,
            DEFAULT_RETENTION_SECS,
            "queue.retention_seconds",
        )?,
    })
}

fn build_context_settings(context: RawContextSettings) -> ContextSettings {
    ContextSettings {
        pool_capacity: context
            .pool_capacity
            .unwrap_or(DEFAULT_CONTEXT_POOL_CAPACITY),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    body_limit_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
    access_log: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    default_ttl_seconds: Option<u64>,
    sweep_interval_seconds: Option<u64>,
    persist: Option<bool>,
    data_file: Option<PathBuf>,
    auto_save: Option<bool>,
    auto_save_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPubSubSettings {
    enabled: Option<bool>,
    durable: Option<bool>,
    log_file: Option<PathBuf>,
    subscriber_capacity: Option<u64>,
    compact_interval_seconds: Option<u64>,
    retention_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    enabled: Option<bool>,
    durable: Option<bool>,
    log_file: Option<PathBuf>,
    capacity: Option<u64>,
    allow_multiple_workers: Option<bool>,
    max_retries: Option<u32>,
    cleanup_interval_seconds: Option<u64>,
    retention_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawContextSettings {
    pool_capacity: Option<usize>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_secs(
    value: Option<u64>,
    default: u64,
    key: &'static str,
) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn non_empty_path(
    value: Option<PathBuf>,
    default: &str,
    key: &'static str,
) -> Result<PathBuf, LoadError> {
    let path = value.unwrap_or_else(|| PathBuf::from(default));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid(key, "path must not be empty"));
    }
    Ok(path)
}

#[cfg(test)]
impl Settings {
    /// Built-in defaults, ignoring config files and the environment.
    pub(crate) fn test_defaults() -> Self {
        Self::from_raw(RawSettings::default()).expect("default settings are valid")
    }
}
