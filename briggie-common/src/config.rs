//! Configuration management for Briggie services.
//!
//! Configuration is read once at startup from an optional JSON file at
//! `~/.briggie/config.json` (or the path in `BRIGGIE_CONFIG`), then
//! overridden by a `.env` file in the working directory and then by the
//! process environment.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. `.env` file entries
//! 3. Explicit config file values
//! 4. Default values
//!
//! # Environment Variable Mapping
//!
//! ## Server
//! - `BRIGGIE_HOST` → server.host
//! - `BRIGGIE_PORT` → server.port
//! - `FRONTEND_ORIGIN` → server.allowed_origins (prepended)
//!
//! ## Provider
//! - `BRIGGIE_PROVIDER` → provider.kind (`openai` | `mistral`)
//! - `BRIGGIE_SYSTEM_PROMPT` → provider.system_prompt
//! - `OPENAI_MODEL` / `MISTRAL_MODEL` → provider.model
//! - `OPENAI_API_KEY` / `MISTRAL_API_KEY` → provider.api_key
//! - `OPENAI_BASE_URL` / `MISTRAL_BASE_URL` → provider.base_url
//!
//! Provider-specific variables are only read for the selected provider kind.
//!
//! ## Storage and logging
//! - `BRIGGIE_HISTORY_PATH` → storage.history_path
//! - `BRIGGIE_LOG_LEVEL` → observability.log_level
//! - `BRIGGIE_LOG_FORMAT` → observability.log_format

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default system directive for the assistant persona.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Briggie, a warm, empathetic English-speaking medical companion. \
Always be concise, kind, and explain health information in simple terms. \
Never give diagnoses; instead, suggest possible explanations and encourage \
users to consult a healthcare professional when appropriate.";

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".briggie"),
        |dirs| dirs.home_dir().join(".briggie"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    std::env::var("BRIGGIE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("config.json"))
}

// ============================================================================
// Server Configuration
// ============================================================================

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    /// Default: "127.0.0.1" (local only)
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Cross-origin callers allowed by CORS. `"*"` allows any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8000
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://127.0.0.1:5500".into(),
        "http://localhost:5500".into(),
    ]
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// Upstream LLM provider family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI chat completions, batch delivery by default
    #[default]
    OpenAI,
    /// Mistral chat completions, streaming delivery by default
    Mistral,
}

impl ProviderKind {
    /// Provider name as used in health output and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Mistral => "mistral",
        }
    }

    /// Model used when none is configured.
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::OpenAI => "gpt-4o-mini",
            Self::Mistral => "mistral-small-latest",
        }
    }

    /// API base URL used when none is configured.
    pub const fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAI => "https://api.openai.com/v1",
            Self::Mistral => "https://api.mistral.ai/v1",
        }
    }

    /// Prefix of the provider-specific environment variables.
    const fn env_prefix(self) -> &'static str {
        match self {
            Self::OpenAI => "OPENAI",
            Self::Mistral => "MISTRAL",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "mistral" => Ok(Self::Mistral),
            other => Err(format!("Unknown provider: {other}")),
        }
    }
}

/// Which part of the conversation the batch variant forwards upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchContext {
    /// System directive, prior history and the new turn
    #[default]
    Full,
    /// System directive and the new turn only
    LatestTurn,
}

/// Upstream provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,

    /// Model identifier (defaults per provider kind)
    #[serde(default)]
    pub model: Option<String>,

    /// Upstream API key. Required.
    #[serde(default)]
    pub api_key: Option<String>,

    /// API base URL including the version segment (defaults per provider kind)
    #[serde(default)]
    pub base_url: Option<String>,

    /// System directive. An empty string disables it.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Force streaming or batch delivery (defaults per provider kind)
    #[serde(default)]
    pub streaming: Option<bool>,

    #[serde(default)]
    pub batch_context: BatchContext,

    /// Connection establishment timeout in seconds
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,

    /// Whole-request timeout for batch calls in seconds.
    /// Streaming calls have no overall timeout.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl ProviderConfig {
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.kind.default_model())
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| self.kind.default_base_url())
    }

    pub fn system_prompt(&self) -> Option<&str> {
        match self.system_prompt.as_deref() {
            Some("") => None,
            Some(prompt) => Some(prompt),
            None => Some(DEFAULT_SYSTEM_PROMPT),
        }
    }

    pub fn streaming(&self) -> bool {
        self.streaming.unwrap_or(self.kind == ProviderKind::Mistral)
    }

    pub fn connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs.unwrap_or(10)
    }

    pub fn request_timeout_secs(&self) -> u64 {
        self.request_timeout_secs.unwrap_or(300)
    }

    /// `<kind>:<model>` label reported by the health probe.
    pub fn label(&self) -> String {
        format!("{}:{}", self.kind, self.model())
    }
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Conversation history persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON file holding every user's conversation
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            history_path: default_history_path(),
        }
    }
}

fn default_history_path() -> PathBuf {
    PathBuf::from("data").join("chat_history.json")
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets clamped to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Complete service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Environment overrides that could not be applied, as `(variable, reason)`.
    /// `Config::validate` rejects a configuration that has any.
    #[serde(skip)]
    pub rejected_overrides: Vec<(String, String)>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with `.env` and environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_dotenv_overrides(Path::new(".env"))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply overrides from a dotenv file. A missing file is not an error.
    ///
    /// Returns whether the file was found.
    pub fn apply_dotenv_overrides(&mut self, path: &Path) -> Result<bool> {
        let entries = match dotenvy::from_path_iter(path) {
            Ok(iter) => iter
                .collect::<std::result::Result<HashMap<String, String>, _>>()
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Err(e) if e.not_found() => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        self.apply_overrides_from(|key| entries.get(key).cloned());
        Ok(true)
    }

    /// Apply process environment overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("BRIGGIE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("BRIGGIE_PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(e) => self.reject_override("BRIGGIE_PORT", format!("'{port}': {e}")),
            }
        }
        if let Some(origin) = lookup("FRONTEND_ORIGIN") {
            if !self.server.allowed_origins.contains(&origin) {
                self.server.allowed_origins.insert(0, origin);
            }
        }

        if let Some(kind) = lookup("BRIGGIE_PROVIDER") {
            match kind.parse() {
                Ok(k) => self.provider.kind = k,
                Err(e) => self.reject_override("BRIGGIE_PROVIDER", e),
            }
        }
        if let Some(prompt) = lookup("BRIGGIE_SYSTEM_PROMPT") {
            self.provider.system_prompt = Some(prompt);
        }

        let prefix = self.provider.kind.env_prefix();
        if let Some(model) = lookup(&format!("{prefix}_MODEL")) {
            self.provider.model = Some(model);
        }
        if let Some(key) = lookup(&format!("{prefix}_API_KEY")) {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = lookup(&format!("{prefix}_BASE_URL")) {
            self.provider.base_url = Some(url);
        }

        if let Some(path) = lookup("BRIGGIE_HISTORY_PATH") {
            self.storage.history_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("BRIGGIE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("BRIGGIE_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    fn reject_override(&mut self, variable: &str, reason: String) {
        self.rejected_overrides.push((variable.to_string(), reason));
    }
}
