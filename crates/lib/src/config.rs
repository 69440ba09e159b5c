//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.tri-assist/config.json`) and environment.
//! The assistant section is resolved into [`AssistantSettings`] and checked before any
//! network call is made.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Value shipped in sample env files; treated the same as a missing key.
pub const PLACEHOLDER_API_KEY: &str = "your-dify-api-key";

const DEFAULT_BASE_URL: &str = "https://api.dify.ai/v1";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Assistant backend credentials, endpoint and request defaults.
    #[serde(default)]
    pub assistant: AssistantConfig,

    /// Connection diagnostics settings.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// In-process log buffer settings.
    #[serde(default)]
    pub log: LogConfig,
}

/// Assistant backend settings. `apiKey` and `baseUrl` are overridden by DIFY_API_KEY / DIFY_BASE_URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantConfig {
    pub api_key: Option<String>,

    /// API root including the version segment (default "https://api.dify.ai/v1").
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Logical user id sent with every request.
    #[serde(default = "default_user")]
    pub user: String,

    /// Bound on waiting for response headers and for each body read (default 15).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Context inputs sent with every message.
    #[serde(default)]
    pub inputs: ContextInputs,
}

/// Shopper context passed to the assistant app as `inputs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInputs {
    #[serde(default = "default_user_level")]
    pub user_level: String,
    #[serde(default = "default_budget_range")]
    pub budget_range: String,
    #[serde(default = "default_sport_focus")]
    pub sport_focus: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsConfig {
    /// Origin advertised in the preflight probe.
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Pause after each probe so progress is visible; 0 disables it.
    #[serde(default = "default_probe_delay_ms")]
    pub probe_delay_ms: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_user() -> String {
    "triathlon-user".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_user_level() -> String {
    "beginner".to_string()
}

fn default_budget_range() -> String {
    "medium".to_string()
}

fn default_sport_focus() -> String {
    "triathlon".to_string()
}

fn default_origin() -> String {
    "http://localhost:5173".to_string()
}

fn default_probe_delay_ms() -> u64 {
    500
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_max_entries() -> usize {
    crate::logger::DEFAULT_MAX_ENTRIES
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            user: default_user(),
            timeout_secs: default_timeout_secs(),
            inputs: ContextInputs::default(),
        }
    }
}

impl Default for ContextInputs {
    fn default() -> Self {
        Self {
            user_level: default_user_level(),
            budget_range: default_budget_range(),
            sport_focus: default_sport_focus(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            probe_delay_ms: default_probe_delay_ms(),
            timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

impl DiagnosticsConfig {
    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolved assistant settings: env overrides applied, base URL normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub user: String,
    pub timeout: Duration,
    pub inputs: ContextInputs,
}

/// Outcome of checking assistant settings before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigCheck {
    pub is_configured: bool,
    pub has_api_key: bool,
    /// One line per problem found, with what to fix.
    pub problems: Vec<String>,
}

impl AssistantSettings {
    /// Build settings straight from values (tests, embedding); no env lookup.
    pub fn new(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        let defaults = AssistantConfig::default();
        Self {
            api_key: api_key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            user: defaults.user,
            timeout: Duration::from_secs(defaults.timeout_secs),
            inputs: defaults.inputs,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// True when a key is present and is not the sample placeholder.
    pub fn has_api_key(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|k| !k.is_empty() && k != PLACEHOLDER_API_KEY)
            .unwrap_or(false)
    }

    /// Key to send, only when it is a real key.
    pub fn api_key(&self) -> Option<&str> {
        if self.has_api_key() {
            self.api_key.as_deref()
        } else {
            None
        }
    }

    pub fn check(&self) -> ConfigCheck {
        let has_api_key = self.has_api_key();
        let mut problems = Vec::new();
        if !has_api_key {
            problems.push(
                "API key is not configured: set DIFY_API_KEY or assistant.apiKey in the config file"
                    .to_string(),
            );
        }
        if let Err(reason) = validate_base_url(&self.base_url) {
            problems.push(format!(
                "base URL is invalid ({}): set DIFY_BASE_URL or assistant.baseUrl to an absolute http(s) URL, current value: {:?}",
                reason, self.base_url
            ));
        }
        ConfigCheck {
            is_configured: problems.is_empty(),
            has_api_key,
            problems,
        }
    }
}

/// Base URL must be an absolute http or https URL with a host.
pub fn validate_base_url(url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| e.to_string())?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme {}", other)),
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err("missing host".to_string());
    }
    Ok(())
}

/// Resolve assistant settings: env DIFY_API_KEY / DIFY_BASE_URL override config.
pub fn resolve_assistant(config: &Config) -> AssistantSettings {
    let a = &config.assistant;
    let api_key = env_override("DIFY_API_KEY").or_else(|| {
        a.api_key
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    });
    let base_url = env_override("DIFY_BASE_URL").unwrap_or_else(|| a.base_url.clone());
    AssistantSettings {
        api_key,
        base_url: base_url.trim().trim_end_matches('/').to_string(),
        user: a.user.clone(),
        timeout: Duration::from_secs(a.timeout_secs.max(1)),
        inputs: a.inputs.clone(),
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("TRI_ASSIST_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".tri-assist").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, TRI_ASSIST_CONFIG_PATH, or the default. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_storefront_context() {
        let a = AssistantConfig::default();
        assert_eq!(a.base_url, "https://api.dify.ai/v1");
        assert_eq!(a.user, "triathlon-user");
        assert_eq!(a.timeout_secs, 15);
        assert_eq!(a.inputs.user_level, "beginner");
        assert_eq!(a.inputs.budget_range, "medium");
        assert_eq!(a.inputs.sport_focus, "triathlon");
        assert_eq!(DiagnosticsConfig::default().probe_delay_ms, 500);
    }

    #[test]
    fn parses_partial_camel_case_file() {
        let config: Config = serde_json::from_str(
            r#"{ "assistant": { "apiKey": "app-123", "inputs": { "budgetRange": "high" } }, "log": { "maxEntries": 50 } }"#,
        )
        .unwrap();
        assert_eq!(config.assistant.api_key.as_deref(), Some("app-123"));
        assert_eq!(config.assistant.inputs.budget_range, "high");
        assert_eq!(config.assistant.inputs.user_level, "beginner");
        assert_eq!(config.log.max_entries, 50);
        assert_eq!(config.diagnostics.origin, "http://localhost:5173");
    }

    #[test]
    fn placeholder_key_is_not_configured() {
        let s = AssistantSettings::new(Some(PLACEHOLDER_API_KEY.to_string()), DEFAULT_BASE_URL);
        let check = s.check();
        assert!(!check.has_api_key);
        assert!(!check.is_configured);
        assert_eq!(check.problems.len(), 1);
        assert_eq!(s.api_key(), None);
    }

    #[test]
    fn blank_key_is_dropped() {
        let s = AssistantSettings::new(Some("   ".to_string()), DEFAULT_BASE_URL);
        assert_eq!(s.api_key, None);
        assert!(!s.has_api_key());
    }

    #[test]
    fn base_url_must_be_absolute_http() {
        assert!(validate_base_url("https://api.dify.ai/v1").is_ok());
        assert!(validate_base_url("http://127.0.0.1:8080").is_ok());
        assert!(validate_base_url("api.dify.ai/v1").is_err());
        assert!(validate_base_url("ftp://example.com").is_err());

        let s = AssistantSettings::new(Some("app-1".to_string()), "not a url");
        let check = s.check();
        assert!(check.has_api_key);
        assert!(!check.is_configured);
        assert!(check.problems[0].contains("base URL"));
    }

    #[test]
    fn configured_settings_pass_and_trim_slash() {
        let s = AssistantSettings::new(Some("app-1".to_string()), "https://example.com/v1/");
        assert_eq!(s.base_url, "https://example.com/v1");
        let check = s.check();
        assert!(check.is_configured);
        assert!(check.problems.is_empty());
    }

    #[test]
    fn load_config_missing_file_uses_defaults() {
        let path = std::env::temp_dir().join(format!("tri-assist-missing-{}.json", uuid::Uuid::new_v4()));
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.assistant.timeout_secs, 15);
    }
}
