use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::PixyStreamError;
use crate::types::{RetryPolicy, StreamMode};

pub const MAX_RETRIES_ENV: &str = "PIXY_STREAM_MAX_RETRIES";
pub const INITIAL_DELAY_ENV: &str = "PIXY_STREAM_INITIAL_DELAY_MS";

const DEFAULT_CONF_DIR_NAME: &str = ".pixy";
const DEFAULT_CONFIG_FILE_NAME: &str = "stream.toml";
const DEFAULT_LOG_FILE_NAME: &str = "stream.log";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq)]
pub struct PixyStreamConfig {
    pub mode: StreamMode,
    pub retry: RetryPolicy,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub file_path: PathBuf,
    pub stdout: bool,
}

impl Default for PixyStreamConfig {
    fn default() -> Self {
        Self {
            mode: StreamMode::default(),
            retry: RetryPolicy::default(),
            log: LogConfig {
                level: DEFAULT_LOG_LEVEL.to_string(),
                file_path: default_conf_dir().join(DEFAULT_LOG_FILE_NAME),
                stdout: false,
            },
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamTomlFile {
    #[serde(default)]
    mode: Option<StreamMode>,
    #[serde(default)]
    retry: StreamTomlRetry,
    #[serde(default)]
    log: StreamTomlLog,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamTomlRetry {
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    initial_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamTomlLog {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    stdout: Option<bool>,
}

pub fn default_config_path() -> PathBuf {
    default_conf_dir().join(DEFAULT_CONFIG_FILE_NAME)
}

/// Loads a config file, applying overrides from the process environment.
/// A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<PixyStreamConfig, PixyStreamError> {
    let content = if path.exists() {
        std::fs::read_to_string(path).map_err(|error| PixyStreamError::ConfigFile {
            path: path.to_path_buf(),
            message: format!("read failed: {error}"),
        })?
    } else {
        String::new()
    };
    let env = std::env::vars().collect::<HashMap<_, _>>();
    parse_config_with_env(&content, &env).map_err(|error| match error {
        PixyStreamError::Config(message) => PixyStreamError::ConfigFile {
            path: path.to_path_buf(),
            message,
        },
        other => other,
    })
}

pub fn parse_config(content: &str) -> Result<PixyStreamConfig, PixyStreamError> {
    parse_config_with_env(content, &HashMap::new())
}

pub fn parse_config_with_env(
    content: &str,
    env: &HashMap<String, String>,
) -> Result<PixyStreamConfig, PixyStreamError> {
    let parsed = toml::from_str::<StreamTomlFile>(content)
        .map_err(|error| PixyStreamError::Config(format!("invalid stream config: {error}")))?;
    resolve_config(parsed, env)
}

fn resolve_config(
    file: StreamTomlFile,
    env: &HashMap<String, String>,
) -> Result<PixyStreamConfig, PixyStreamError> {
    let defaults = RetryPolicy::default();
    let max_retries = match env_override::<u32>(env, MAX_RETRIES_ENV)? {
        Some(value) => value,
        None => file.retry.max_retries.unwrap_or(defaults.max_retries),
    };
    let initial_delay_ms = match env_override::<u64>(env, INITIAL_DELAY_ENV)? {
        Some(value) => value,
        None => file
            .retry
            .initial_delay_ms
            .unwrap_or(defaults.initial_delay_ms),
    };

    let file_path = file
        .log
        .file
        .as_deref()
        .map(|raw| expand_path_with_home(Path::new(raw.trim())))
        .unwrap_or_else(|| default_conf_dir().join(DEFAULT_LOG_FILE_NAME));

    Ok(PixyStreamConfig {
        mode: file.mode.unwrap_or_default(),
        retry: RetryPolicy::new(max_retries, initial_delay_ms),
        log: LogConfig {
            level: file
                .log
                .level
                .map(|level| level.trim().to_string())
                .filter(|level| !level.is_empty())
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            file_path,
            stdout: file.log.stdout.unwrap_or(false),
        },
    })
}

fn env_override<T: std::str::FromStr>(
    env: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, PixyStreamError> {
    let Some(raw) = env.get(key).map(|value| value.trim()) else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| PixyStreamError::Config(format!("{key} must be a non-negative integer")))
}

fn default_conf_dir() -> PathBuf {
    home_dir().join(DEFAULT_CONF_DIR_NAME)
}

fn expand_path_with_home(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw == "~" {
        return home_dir();
    }
    if let Some(suffix) = raw.strip_prefix("~/") {
        return home_dir().join(suffix);
    }
    path.to_path_buf()
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config("").expect("empty config parses");
        assert_eq!(config.mode, StreamMode::Tokens);
        assert_eq!(config.retry, RetryPolicy::new(7, 500));
        assert_eq!(config.log.level, "info");
        assert!(!config.log.stdout);
    }

    #[test]
    fn file_values_are_applied() {
        let config = parse_config(
            r#"
mode = "raw"

[retry]
max_retries = 2
initial_delay_ms = 10

[log]
level = "debug"
file = "/tmp/pixy-stream.log"
stdout = true
"#,
        )
        .expect("config parses");

        assert_eq!(config.mode, StreamMode::Raw);
        assert_eq!(config.retry, RetryPolicy::new(2, 10));
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.file_path, PathBuf::from("/tmp/pixy-stream.log"));
        assert!(config.log.stdout);
    }

    #[test]
    fn env_overrides_file_retry_values() {
        let env = HashMap::from([
            (MAX_RETRIES_ENV.to_string(), "3".to_string()),
            (INITIAL_DELAY_ENV.to_string(), " 250 ".to_string()),
        ]);
        let config = parse_config_with_env("[retry]\nmax_retries = 9\n", &env)
            .expect("config parses");

        assert_eq!(config.retry, RetryPolicy::new(3, 250));
    }

    #[test]
    fn invalid_env_override_is_rejected() {
        let env = HashMap::from([(MAX_RETRIES_ENV.to_string(), "-1".to_string())]);
        let error = parse_config_with_env("", &env).expect_err("negative retries rejected");
        assert!(error.to_string().contains(MAX_RETRIES_ENV));
    }

    #[test]
    fn unknown_mode_and_fields_are_rejected() {
        assert!(parse_config("mode = \"verbose\"").is_err());
        assert!(parse_config("[retry]\nmax_attempts = 3\n").is_err());
    }

    #[test]
    fn home_prefixed_log_path_is_expanded() {
        let config = parse_config("[log]\nfile = \"~/logs/stream.log\"\n").expect("parses");
        assert_eq!(config.log.file_path, home_dir().join("logs/stream.log"));
    }

    #[test]
    fn load_config_reads_file_and_reports_path_on_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("stream.toml");
        std::fs::write(&path, "mode = \"raw\"\n").expect("write config");
        assert_eq!(load_config(&path).expect("loads").mode, StreamMode::Raw);

        std::fs::write(&path, "mode = [").expect("write config");
        let error = load_config(&path).expect_err("broken toml");
        assert!(matches!(error, PixyStreamError::ConfigFile { .. }));
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(&dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(config.mode, StreamMode::Tokens);
    }
}
