//! Relay configuration loading and validation.
//!
//! Reads `toolrelay.yaml` and resolves environment variables. Every section
//! has defaults, so an absent file yields a working configuration that talks
//! to a backend on `localhost:1234`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema_bridge::ConfiguredDialects;

/// Conventional config file name.
pub const CONFIG_FILE_NAME: &str = "toolrelay.yaml";

/// Environment variable holding an explicit config path.
pub const CONFIG_ENV_VAR: &str = "TOOLRELAY_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// How conversation state travels between rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// Full message history is resent every round.
    #[default]
    Stateless,
    /// Only a continuation token is kept; the backend holds the history.
    Stateful,
}

impl std::str::FromStr for ConversationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stateless" => Ok(Self::Stateless),
            "stateful" => Ok(Self::Stateful),
            other => Err(ConfigError::Invalid {
                reason: format!("unknown mode '{other}' (expected stateless or stateful)"),
            }),
        }
    }
}

/// Backend endpoint and transport timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Path of the model listing, relative to `base_url`.
    pub models_path: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Outer limit imposed by whatever hosts the relay. Request timeouts are
    /// kept strictly below it.
    pub hard_ceiling_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234/v1".into(),
            api_key: None,
            models_path: "/models".into(),
            connect_timeout_secs: 5,
            request_timeout_secs: 120,
            hard_ceiling_secs: 300,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn hard_ceiling(&self) -> Duration {
        Duration::from_secs(self.hard_ceiling_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before the circuit opens.
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 30,
        }
    }
}

/// Model cache and load-confirmation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsSettings {
    pub cache_ttl_secs: u64,
    /// Idle TTL handed to the accelerator when loading a model.
    pub load_ttl_secs: u64,
    pub confirm_attempts: u32,
    pub confirm_interval_ms: u64,
}

impl Default for ModelsSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            load_ttl_secs: 3_600,
            confirm_attempts: 5,
            confirm_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub default_model: Option<String>,
    pub max_rounds: u32,
    pub max_tokens: u32,
    /// Upper bound on tool calls dispatched at once within a round.
    pub tool_concurrency: usize,
    pub tool_timeout_secs: u64,
    pub system_prompt: Option<String>,
    /// Stateful mode sends the tool schemas on the first round only unless set.
    pub resend_tools_each_round: bool,
    pub mode: ConversationMode,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_model: None,
            max_rounds: 10,
            max_tokens: 2048,
            tool_concurrency: 4,
            tool_timeout_secs: 30,
            system_prompt: None,
            resend_tools_each_round: false,
            mode: ConversationMode::Stateless,
        }
    }
}

/// Top-level config (mirrors `toolrelay.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub backend: BackendConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub models: ModelsSettings,
    pub engine: EngineSettings,
    pub dialects: ConfiguredDialects,
}

impl RelayConfig {
    /// Reject values the rest of the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError::Invalid {
                reason: reason.to_string(),
            })
        };
        if self.backend.base_url.trim().is_empty() {
            return invalid("backend.base_url must not be empty");
        }
        if self.backend.hard_ceiling_secs == 0 {
            return invalid("backend.hard_ceiling_secs must be positive");
        }
        if self.engine.max_rounds == 0 {
            return invalid("engine.max_rounds must be at least 1");
        }
        if self.engine.tool_concurrency == 0 {
            return invalid("engine.tool_concurrency must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks the explicit path, then `TOOLRELAY_CONFIG`, then walks upward from
/// `start` for `toolrelay.yaml`.
pub fn find_config_path(explicit: Option<&Path>, start: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(path));
    }

    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load the config, falling back to defaults when no file exists.
///
/// An explicit or env-provided path that cannot be read is an error.
pub fn load_config(explicit: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match find_config_path(explicit, &cwd) {
        Some(path) => load_config_file(&path),
        None => {
            tracing::debug!("no {CONFIG_FILE_NAME} found, using defaults");
            Ok(RelayConfig::default())
        }
    }
}

/// Load and parse one config file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config_file(path: &Path) -> Result<RelayConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    // An empty file is a valid "all defaults" config.
    let config: RelayConfig = if interpolated.trim().is_empty() {
        RelayConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };

    config.validate()?;
    tracing::info!(path = %path.display(), "loaded relay config");
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{}", home.display(), &path[1..]);
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_bridge::Dialect;
    use tempfile::TempDir;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLRELAY_TEST_NONEXISTENT__");
        let result = interpolate_env_vars("${__TOOLRELAY_TEST_NONEXISTENT__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLRELAY_TEST_SET_VAR__", "/custom/path");
        let result = interpolate_env_vars("root: ${__TOOLRELAY_TEST_SET_VAR__:-/fallback}");
        assert_eq!(result, "root: /custom/path");
        std::env::remove_var("__TOOLRELAY_TEST_SET_VAR__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with $dollar but no braces";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/Documents");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/Documents"));
        assert_eq!(expand_tilde("~user/x"), "~user/x");
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.engine.max_rounds, 10);
        assert_eq!(config.engine.max_tokens, 2048);
        assert_eq!(config.engine.tool_concurrency, 4);
        assert_eq!(config.engine.tool_timeout_secs, 30);
        assert_eq!(config.dialects.stateless, Dialect::Nested);
        assert_eq!(config.dialects.stateful, Dialect::Flattened);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
backend:
  base_url: "http://gpu-box:8080/v1"
engine:
  max_rounds: 3
  mode: stateful
dialects:
  stateful: nested
"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.backend.base_url, "http://gpu-box:8080/v1");
        assert_eq!(config.backend.models_path, "/models");
        assert_eq!(config.engine.max_rounds, 3);
        assert_eq!(config.engine.max_tokens, 2048);
        assert_eq!(config.engine.mode, ConversationMode::Stateful);
        assert_eq!(config.dialects.stateful, Dialect::Nested);
        assert_eq!(config.dialects.stateless, Dialect::Nested);
    }

    #[test]
    fn test_empty_file_is_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "").unwrap();
        assert_eq!(load_config_file(&path).unwrap().engine.max_rounds, 10);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "engine:\n  max_rounds: 0\n").unwrap();
        assert!(matches!(
            load_config_file(&path).unwrap_err(),
            ConfigError::Invalid { .. }
        ));
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "engine: [unclosed").unwrap();
        assert!(matches!(
            load_config_file(&path).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }

    #[test]
    fn test_find_config_walks_upward() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE_NAME), "").unwrap();

        let found = find_config_path(None, &nested);
        // TOOLRELAY_CONFIG may be set in the environment running the tests.
        if std::env::var_os(CONFIG_ENV_VAR).is_none() {
            assert_eq!(found, Some(tmp.path().join(CONFIG_FILE_NAME)));
        }
    }

    #[test]
    fn test_find_config_explicit_wins() {
        let explicit = PathBuf::from("/etc/relay/custom.yaml");
        assert_eq!(
            find_config_path(Some(&explicit), Path::new("/")),
            Some(explicit)
        );
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("stateful".parse::<ConversationMode>().unwrap(), ConversationMode::Stateful);
        assert!("chatty".parse::<ConversationMode>().is_err());
    }
}
