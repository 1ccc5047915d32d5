use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

pub const ENV_URL: &str = "LAB_CONSOLE_URL";
pub const ENV_PILOT: &str = "LAB_CONSOLE_PILOT";
pub const ENV_TOKEN: &str = "LAB_API_TOKEN";
pub const ENV_TOKEN_FILE: &str = "LAB_API_TOKEN_FILE";

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("api token file {0} is empty")]
    EmptyToken(PathBuf),
    #[error("max_in_flight must be at least 1")]
    ZeroInFlight,
}

/// Settings shared by every page of the console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub pilot: Option<String>,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: None,
            pilot: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            token_file: None,
            token: None,
        }
    }
}

/// Values given on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub base_url: Option<String>,
    pub ws_url: Option<String>,
    pub pilot: Option<String>,
    pub max_in_flight: Option<usize>,
    pub token_file: Option<PathBuf>,
}

impl ConsoleConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File, then environment, then command line; the token is resolved last.
    pub fn load(
        file: Option<&Path>,
        overrides: ConfigOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut cfg = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(url) = env(ENV_URL).filter(|v| !v.trim().is_empty()) {
            cfg.base_url = url;
        }
        if let Some(pilot) = env(ENV_PILOT).filter(|v| !v.trim().is_empty()) {
            cfg.pilot = Some(pilot);
        }
        if let Some(url) = overrides.base_url {
            cfg.base_url = url;
        }
        if let Some(url) = overrides.ws_url {
            cfg.ws_url = Some(url);
        }
        if let Some(pilot) = overrides.pilot {
            cfg.pilot = Some(pilot);
        }
        if let Some(n) = overrides.max_in_flight {
            cfg.max_in_flight = n;
        }
        if overrides.token_file.is_some() {
            cfg.token_file = overrides.token_file;
        }
        if cfg.max_in_flight == 0 {
            return Err(ConfigError::ZeroInFlight);
        }
        parse_http_url(&cfg.base_url)?;
        cfg.token = resolve_token(cfg.token_file.as_deref(), &env)?;
        Ok(cfg)
    }

    /// Push-channel address: explicit, or the base url with a websocket scheme.
    pub fn pilots_ws_url(&self) -> Result<String, ConfigError> {
        if let Some(url) = &self.ws_url {
            return Ok(url.clone());
        }
        let mut url = parse_http_url(&self.base_url)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| ConfigError::InvalidUrl {
            url: self.base_url.clone(),
            reason: format!("cannot switch scheme to {}", scheme),
        })?;
        url.set_path("/ws/pilots");
        url.set_query(None);
        Ok(url.to_string())
    }
}

fn parse_http_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}

/// A secret file wins over the plain environment variable.
fn resolve_token(
    configured_file: Option<&Path>,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<Option<String>, ConfigError> {
    let file = configured_file
        .map(Path::to_path_buf)
        .or_else(|| env(ENV_TOKEN_FILE).filter(|v| !v.trim().is_empty()).map(PathBuf::from));
    if let Some(path) = file {
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(ConfigError::EmptyToken(path));
        }
        return Ok(Some(token.to_string()));
    }
    Ok(env(ENV_TOKEN)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty()))
}
