use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

use crate::secret::Secret;

pub const DEFAULT_CONFIG_PATH: &str = "hookgate.toml";

/// Startup configuration failures. All of them are fatal.
///
/// Messages name the offending key but never echo its value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// A full queue refuses the incoming event; the platform redelivers it.
    #[default]
    RejectNewest,
    /// A full queue evicts its oldest event to make room.
    DropOldest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::RejectNewest => write!(f, "reject_newest"),
            OverflowPolicy::DropOldest => write!(f, "drop_oldest"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl DispatchConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            overflow: OverflowPolicy::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// `[webapp]` section as written in the TOML file.
#[derive(Debug, Deserialize, Clone)]
struct WebAppFileConfig {
    #[serde(default = "default_serve_page")]
    serve_page: bool,
    #[serde(default)]
    url: Option<String>,
}

impl Default for WebAppFileConfig {
    fn default() -> Self {
        Self {
            serve_page: default_serve_page(),
            url: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
struct FileConfig {
    #[serde(default)]
    dispatch: DispatchConfig,
    #[serde(default)]
    webapp: WebAppFileConfig,
}

#[derive(Debug, Clone)]
pub struct WebAppConfig {
    /// Serve the embedded Web App page at `/`.
    pub serve_page: bool,
    /// URL the `/openweb` button opens.
    pub url: Url,
}

/// Webhook endpoint settings. Every secret here is masked in `Debug`.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub token: Secret,
    pub public_url: Url,
    pub port: u16,
    pub path_secret: Secret,
    /// `WEBHOOK_SECRET` was unset and the path secret only lives as long as
    /// this process.
    pub path_secret_generated: bool,
    pub header_secret: Option<Secret>,
}

impl WebhookConfig {
    /// Route path the receiver listens on, relative to the server root.
    pub fn route_path(&self) -> String {
        format!("/webhook/{}", self.path_secret.expose())
    }

    /// Full URL registered with Telegram. Contains the path secret: never log it.
    pub fn callback_url(&self) -> Result<Url, ConfigError> {
        let base = self.public_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{}{}", base, self.route_path())).map_err(|e| ConfigError::Invalid {
            key: "WEBHOOK_URL",
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub webhook: WebhookConfig,
    pub dispatch: DispatchConfig,
    pub webapp: WebAppConfig,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_workers() -> usize {
    4
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_serve_page() -> bool {
    true
}

fn default_port() -> u16 {
    8000
}

impl Config {
    /// Load from the process environment plus an optional TOML file.
    ///
    /// An explicitly given file must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => read_file_config(p)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    read_file_config(default)?
                } else {
                    FileConfig::default()
                }
            }
        };
        Self::from_lookup(|key| std::env::var(key).ok(), file)
    }

    fn from_lookup<F>(lookup: F, file: FileConfig) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset.
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let token = get("BOT_TOKEN").ok_or(ConfigError::Missing("BOT_TOKEN"))?;

        let public_url = match (get("WEBHOOK_URL"), get("RAILWAY_STATIC_URL")) {
            (Some(url), _) => url,
            (None, Some(host)) => format!("https://{}", host),
            (None, None) => return Err(ConfigError::Missing("WEBHOOK_URL")),
        };
        let public_url = parse_https_url("WEBHOOK_URL", &public_url)?;

        let port = match get("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                reason: "not a valid port number".to_string(),
            })?,
            None => default_port(),
        };

        let (path_secret, path_secret_generated) = match get("WEBHOOK_SECRET") {
            Some(s) => (validate_secret("WEBHOOK_SECRET", s)?, false),
            None => (uuid::Uuid::new_v4().simple().to_string(), true),
        };
        let header_secret = get("WEBHOOK_HEADER_SECRET")
            .map(|s| validate_secret("WEBHOOK_HEADER_SECRET", s))
            .transpose()?;

        let webapp_url = match get("WEBAPP_URL").or(file.webapp.url) {
            Some(url) => parse_https_url("WEBAPP_URL", &url)?,
            None => public_url.clone(),
        };

        let dispatch = file.dispatch;
        if dispatch.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "dispatch.queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if dispatch.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "dispatch.workers",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Config {
            webhook: WebhookConfig {
                token: Secret::new(token),
                public_url,
                port,
                path_secret: Secret::new(path_secret),
                path_secret_generated,
                header_secret: header_secret.map(Secret::new),
            },
            dispatch,
            webapp: WebAppConfig {
                serve_page: file.webapp.serve_page,
                url: webapp_url,
            },
        })
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_https_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })?;
    if url.scheme() != "https" {
        return Err(ConfigError::Invalid {
            key,
            reason: "Telegram only delivers to https URLs".to_string(),
        });
    }
    Ok(url)
}

/// Telegram accepts 1-256 characters from `A-Z a-z 0-9 _ -` for secret tokens;
/// the same set keeps the path segment URL-safe.
fn validate_secret(key: &'static str, value: String) -> Result<String, ConfigError> {
    let valid = (1..=256).contains(&value.len())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            reason: "expected 1-256 characters from A-Z, a-z, 0-9, '_' and '-'".to_string(),
        })
    }
}
