use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,

    #[error("invalid value for {name}: {value}")]
    InvalidEnvValue { name: &'static str, value: String },
}

impl Config {
    /// Load configuration from a YAML file. A missing file yields defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_saphyr::from_str(&expanded)?)
    }

    /// Apply `PORT` and `BASE_URL` environment overrides on top of the file.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var("PORT") {
            self.server.port =
                port.parse()
                    .map_err(|_| ConfigError::InvalidEnvValue {
                        name: "PORT",
                        value: port,
                    })?;
        }
        if let Ok(base_url) = std::env::var("BASE_URL") {
            self.server.base_url = base_url;
        }
        Ok(())
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: default_base_url(),
            request_timeout_seconds: default_request_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Overall session watchdog, in seconds.
    #[serde(default = "default_session_timeout")]
    pub timeout_seconds: u64,
    /// Bound on agent acquisition, in seconds.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,
    /// How long terminal sessions stay in diagnostics.
    #[serde(default = "default_retention")]
    pub retention_seconds: u64,
    /// Interval between registry retention sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_session_timeout(),
            acquire_timeout_seconds: default_acquire_timeout(),
            retention_seconds: default_retention(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// One external command-line agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_base_url() -> String {
    "/gm".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    256
}

fn default_store_path() -> PathBuf {
    PathBuf::from("parlor.db")
}

fn default_session_timeout() -> u64 {
    120
}

fn default_acquire_timeout() -> u64 {
    60
}

fn default_retention() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    600
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports shell-compatible syntax:
/// - `${VAR}` - Required variable, errors if not set
/// - `${VAR:-default}` - Optional variable with default value
/// - `$$` - Escaped `$` (only needed before `{` to prevent expansion)
///
/// No nested expansion; an unclosed `${` is an error.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some('$') => {
                let _ = chars.next();
                out.push('$');
            }
            Some('{') => {
                let _ = chars.next();
                let mut reference = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    reference.push(c);
                }
                if !closed {
                    return Err(ConfigError::UnclosedVarReference);
                }

                let (name, default) = match reference.split_once(":-") {
                    Some((name, default)) => (name, Some(default)),
                    None => (reference.as_str(), None),
                };

                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => match default {
                        Some(default) => out.push_str(default),
                        None => return Err(ConfigError::MissingEnvVar(name.to_string())),
                    },
                }
            }
            _ => out.push('$'),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.base_url, "/gm");
        assert_eq!(config.session.timeout_seconds, 120);
        assert_eq!(config.session.acquire_timeout_seconds, 60);
    }

    #[test]
    fn expand_plain_text_unchanged() {
        assert_eq!(expand_env_vars("host: 0.0.0.0").unwrap(), "host: 0.0.0.0");
    }

    #[test]
    fn expand_with_default() {
        assert_eq!(
            expand_env_vars("port: ${PARLOR_TEST_UNSET_VAR:-3000}").unwrap(),
            "port: 3000"
        );
    }

    #[test]
    fn expand_missing_required_errors() {
        let err = expand_env_vars("token: ${PARLOR_TEST_UNSET_VAR}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn expand_escaped_dollar() {
        assert_eq!(expand_env_vars("cost: $$100").unwrap(), "cost: $100");
    }

    #[test]
    fn expand_unclosed_reference_errors() {
        let err = expand_env_vars("oops: ${NEVER_CLOSED").unwrap_err();
        assert!(matches!(err, ConfigError::UnclosedVarReference));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let config = Config::load("/nonexistent/parlor.yaml").await.unwrap();
        assert_eq!(config.server.port, 3000);
        assert!(config.agents.is_empty());
    }

    #[tokio::test]
    async fn parses_agent_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parlor.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 8080\nagents:\n  - id: claude-code\n    command: claude\n    args: [\"-p\"]\n",
        )
        .unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].id, "claude-code");
        assert_eq!(config.agents[0].args, vec!["-p"]);
    }
}
