use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_STATIC_DIR: &str = "apps/gateway/static";
const DEFAULT_WORKER_COMMAND: &str = "workbench-worker";
const DEFAULT_AUTH_MODE: &str = "password";
const DEFAULT_HANDSHAKE_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_COMMIT: &str = "development";

/// How requests outside the root page are gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Password,
    None,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    /// Root for the page template and other local assets.
    pub static_dir: PathBuf,
    /// The worker's web-view preload bundle.
    pub webview_dir: PathBuf,
    pub worker_command: PathBuf,
    pub worker_args: Vec<String>,
    /// Directory for the per-launch session handoff sockets.
    pub session_sock_dir: PathBuf,
    pub settings_path: PathBuf,
    pub auth_mode: AuthMode,
    pub password: Option<String>,
    pub handshake_timeout: Duration,
    /// Build identifier; `development` enables the compile-in-progress hint
    /// and keeps PROD_ONLY template sections stripped out.
    pub commit: String,
    /// Trailing command-line path argument, absolutized by the binary.
    pub start_path_arg: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid auth mode '{0}' (expected 'password' or 'none')")]
    InvalidAuthMode(String),
    #[error("auth mode is 'password' but WB_PASSWORD is not set")]
    MissingPassword,
    #[error("invalid handshake timeout '{0}'")]
    InvalidHandshakeTimeout(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = env::var("WB_BIND_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr_raw
            .parse::<SocketAddr>()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter = env::var("WB_LOG_FILTER")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let static_dir = env::var("WB_STATIC_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_DIR));

        let webview_dir = env::var("WB_WEBVIEW_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| static_dir.join("webview"));

        let worker_command = env::var("WB_WORKER_COMMAND")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_COMMAND));

        let worker_args = env::var("WB_WORKER_ARGS")
            .ok()
            .map(|value| {
                value
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let session_sock_dir = env::var("WB_SESSION_SOCK_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("workbench-gateway"));

        let settings_path = env::var("WB_SETTINGS_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("workbench-gateway/settings.json"));

        let auth_mode_raw = env::var("WB_AUTH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_AUTH_MODE.to_string())
            .trim()
            .to_lowercase();
        let auth_mode = match auth_mode_raw.as_str() {
            "password" => AuthMode::Password,
            "none" => AuthMode::None,
            other => return Err(ConfigError::InvalidAuthMode(other.to_string())),
        };

        let password = env::var("WB_PASSWORD")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if auth_mode == AuthMode::Password && password.is_none() {
            return Err(ConfigError::MissingPassword);
        }

        let handshake_timeout = match env::var("WB_HANDSHAKE_TIMEOUT_SECS").ok() {
            Some(raw) => {
                let seconds = raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidHandshakeTimeout(raw.clone()))?;
                Duration::from_secs(seconds)
            }
            None => Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECONDS),
        };

        let commit = env::var("WB_COMMIT")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_COMMIT.to_string());

        Ok(Self {
            bind_addr,
            log_filter,
            static_dir,
            webview_dir,
            worker_command,
            worker_args,
            session_sock_dir,
            settings_path,
            auth_mode,
            password,
            handshake_timeout,
            commit,
            start_path_arg: None,
        })
    }
}
