use crate::poll::PollIntervals;
use crate::push::PushConfig;
use clap::Args;
use serde::Deserialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use taskdeck_core::stomp::DEFAULT_MAX_FRAME_BYTES;
use taskdeck_engine::{AuthContext, ReconcilerConfig};
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_LOG_DIR: &str = ".taskdeck/logs";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_TASKS_POLL_MS: u64 = 2_000;
pub const DEFAULT_PROCESS_METRICS_POLL_MS: u64 = 5_000;
pub const DEFAULT_METRICS_POLL_MS: u64 = 5_000;
pub const DEFAULT_PUSH_BACKOFF_INITIAL_MS: u64 = 1_000;
pub const DEFAULT_PUSH_BACKOFF_MAX_MS: u64 = 10_000;

/// Flags shared by every subcommand. Unset flags fall through to the
/// environment, then the config file, then defaults.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Base URL of the scheduler REST API.
    #[arg(long, global = true)]
    pub api_url: Option<String>,
    /// Base URL of the websocket endpoints; derived from the API URL when unset.
    #[arg(long, global = true)]
    pub push_url: Option<String>,
    #[arg(long, global = true)]
    pub token_file: Option<PathBuf>,
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
    /// Rely on polling only.
    #[arg(long, global = true)]
    pub no_push: bool,
    #[arg(long, global = true)]
    pub tasks_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub api_url: Option<String>,
    pub push_url: Option<String>,
    pub push_enabled: Option<bool>,
    pub token_file: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub push_backoff_max_ms: Option<u64>,
    pub eviction_misses: Option<u32>,
    pub local_authority_window_ms: Option<u64>,
    pub poll: PollSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PollSection {
    pub tasks_ms: Option<u64>,
    pub process_metrics_ms: Option<u64>,
    pub metrics_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid {field} '{value}': {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        source: url::ParseError,
    },
    #[error("unsupported scheme '{scheme}' for {field}")]
    UnsupportedScheme { field: &'static str, scheme: String },
    #[error("invalid {field} '{value}'")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_url: Url,
    pub push_url: Url,
    pub push_enabled: bool,
    /// Token taken from `TASKDECK_TOKEN`; wins over the token file.
    pub token: Option<String>,
    pub token_file: PathBuf,
    pub poll: PollIntervals,
    pub push_backoff_initial: Duration,
    pub push_backoff_max: Duration,
    pub reconciler: ReconcilerConfig,
    pub log_dir: PathBuf,
    pub log_stdout: bool,
    pub log_level: String,
}

impl Settings {
    pub fn load(args: &ConfigArgs) -> Result<Self, ConfigError> {
        Self::resolve(args, |key| std::env::var(key).ok())
    }

    /// Resolves settings with an injected environment lookup.
    pub fn resolve<F>(args: &ConfigArgs, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let file = load_file_config(args.config.clone(), &lookup)?;

        let api_raw = args
            .api_url
            .clone()
            .or_else(|| lookup("TASKDECK_API_URL"))
            .or(file.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let api_url = parse_url("api_url", &api_raw)?;
        if !matches!(api_url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme {
                field: "api_url",
                scheme: api_url.scheme().to_string(),
            });
        }

        let push_url = match args
            .push_url
            .clone()
            .or_else(|| lookup("TASKDECK_PUSH_URL"))
            .or(file.push_url)
        {
            Some(raw) => websocket_url("push_url", &parse_url("push_url", &raw)?)?,
            None => websocket_url("push_url", &api_url)?,
        };

        let push_enabled = if args.no_push {
            false
        } else {
            match lookup("TASKDECK_PUSH_ENABLED") {
                Some(raw) => parse_bool_flag(&raw).ok_or(ConfigError::InvalidValue {
                    field: "TASKDECK_PUSH_ENABLED",
                    value: raw,
                })?,
                None => file.push_enabled.unwrap_or(true),
            }
        };

        let token_file = args
            .token_file
            .clone()
            .or_else(|| lookup("TASKDECK_TOKEN_FILE").map(PathBuf::from))
            .or(file.token_file)
            .unwrap_or_else(|| state_dir(&lookup).join("taskdeck/auth-token"));

        let poll = PollIntervals {
            tasks: millis(
                args.tasks_interval_ms,
                env_number(&lookup, "TASKDECK_TASKS_POLL_MS")?,
                file.poll.tasks_ms,
                DEFAULT_TASKS_POLL_MS,
            ),
            process_metrics: millis(
                None,
                env_number(&lookup, "TASKDECK_PROCESS_METRICS_POLL_MS")?,
                file.poll.process_metrics_ms,
                DEFAULT_PROCESS_METRICS_POLL_MS,
            ),
            metrics: millis(
                None,
                env_number(&lookup, "TASKDECK_METRICS_POLL_MS")?,
                file.poll.metrics_ms,
                DEFAULT_METRICS_POLL_MS,
            ),
        };

        let push_backoff_initial = Duration::from_millis(DEFAULT_PUSH_BACKOFF_INITIAL_MS);
        let push_backoff_max = millis(
            None,
            env_number(&lookup, "TASKDECK_PUSH_BACKOFF_MAX_MS")?,
            file.push_backoff_max_ms,
            DEFAULT_PUSH_BACKOFF_MAX_MS,
        )
        .max(push_backoff_initial);

        let mut reconciler = ReconcilerConfig::default();
        if let Some(misses) = env_number(&lookup, "TASKDECK_EVICTION_MISSES")?
            .map(|value| value as u32)
            .or(file.eviction_misses)
        {
            reconciler.eviction_misses = misses.max(1);
        }
        if let Some(window_ms) =
            env_number(&lookup, "TASKDECK_LOCAL_AUTHORITY_MS")?.or(file.local_authority_window_ms)
        {
            reconciler.local_authority_window = chrono::Duration::milliseconds(window_ms as i64);
        }

        let log_dir = args
            .log_dir
            .clone()
            .or_else(|| lookup("TASKDECK_LOG_DIR").map(PathBuf::from))
            .or(file.log_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
        let log_stdout = lookup("TASKDECK_LOG_STDOUT")
            .and_then(|value| parse_bool_flag(&value))
            .unwrap_or(false);
        let log_level = lookup("TASKDECK_LOG_LEVEL")
            .or(file.log_level)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Ok(Self {
            api_url,
            push_url,
            push_enabled,
            token: lookup("TASKDECK_TOKEN"),
            token_file,
            poll,
            push_backoff_initial,
            push_backoff_max,
            reconciler,
            log_dir,
            log_stdout,
            log_level,
        })
    }

    pub fn auth_context(&self) -> io::Result<AuthContext> {
        match &self.token {
            Some(token) => Ok(AuthContext::with_token(token.clone())),
            None => AuthContext::from_token_file(&self.token_file),
        }
    }

    pub fn push_config(&self) -> PushConfig {
        PushConfig {
            base_url: self.push_url.clone(),
            initial_backoff: self.push_backoff_initial,
            max_backoff: self.push_backoff_max,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Maps an http(s) base onto its websocket counterpart; ws(s) passes through.
pub fn websocket_url(field: &'static str, base: &Url) -> Result<Url, ConfigError> {
    let scheme = match base.scheme() {
        "ws" | "wss" => return Ok(base.clone()),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ConfigError::UnsupportedScheme {
                field,
                scheme: other.to_string(),
            })
        }
    };
    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme {
            field,
            scheme: base.scheme().to_string(),
        })?;
    Ok(url)
}

fn load_file_config<F>(explicit: Option<PathBuf>, lookup: &F) -> Result<FileConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let (path, required) = match explicit.or_else(|| lookup("TASKDECK_CONFIG").map(PathBuf::from)) {
        Some(path) => (path, true),
        None => (config_dir(lookup).join("taskdeck/config.toml"), false),
    };
    if !required && !path.exists() {
        return Ok(FileConfig::default());
    }
    read_file_config(&path)
}

pub fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        field,
        value: raw.to_string(),
        source,
    })
}

fn env_number<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: key,
                value: raw,
            }),
        None => Ok(None),
    }
}

fn millis(cli: Option<u64>, env: Option<u64>, file: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(cli.or(env).or(file).unwrap_or(default).max(1))
}

fn config_dir<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir(lookup).join(".config"))
}

fn state_dir<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir(lookup).join(".local/state"))
}

fn home_dir<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
