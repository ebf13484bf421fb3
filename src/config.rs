use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::dispatch::registry::ProviderKind;
use crate::error::MirageError;

/// Default sampling temperature for page generation.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Default output ceiling. A full HTML page with inline CSS fits comfortably.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

pub const DEFAULT_CACHE_CAPACITY: usize = 100;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Upper bound on a whole generation, streaming included.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// API keys for the three backends, looked up by well-known variable names.
#[derive(Clone, Default)]
pub struct Credentials {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    pub google: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build credentials from any key/value source. Blank values count as absent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let find = |kind: ProviderKind| {
            kind.env_vars()
                .iter()
                .find_map(|name| lookup(name).filter(|v| !v.trim().is_empty()))
        };
        Self {
            openai: find(ProviderKind::OpenAi),
            anthropic: find(ProviderKind::Anthropic),
            google: find(ProviderKind::Google),
        }
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&str> {
        match kind {
            ProviderKind::OpenAi => self.openai.as_deref(),
            ProviderKind::Anthropic => self.anthropic.as_deref(),
            ProviderKind::Google => self.google.as_deref(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mark = |v: &Option<String>| if v.is_some() { "[REDACTED]" } else { "none" };
        f.debug_struct("Credentials")
            .field("openai", &mark(&self.openai))
            .field("anthropic", &mark(&self.anthropic))
            .field("google", &mark(&self.google))
            .finish()
    }
}

/// Which view of a provider stream to consume first.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Typed events when the backend supports them, text-only otherwise.
    #[default]
    Auto,
    /// Typed events only; a decode failure is an error.
    Full,
    /// Text deltas only; usage totals are never reported.
    Text,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationSettings {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default)]
    pub stream_mode: StreamMode,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            stream_mode: StreamMode::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u64 {
    DEFAULT_MAX_TOKENS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistorySettings {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
        }
    }
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

/// Per-provider overrides from `[providers.<id>]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderOverride {
    pub model: Option<String>,
    pub base_url: Option<String>,
}

/// Settings read from the optional TOML file. Every section may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub history: HistorySettings,
    #[serde(default)]
    pub providers: HashMap<String, ProviderOverride>,
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self, MirageError> {
        toml::from_str(text).map_err(|e| MirageError::Config(e.to_string()))
    }

    pub fn provider_override(&self, kind: ProviderKind) -> Option<&ProviderOverride> {
        self.providers.get(kind.id())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub credentials: Credentials,
    pub settings: Settings,
}

impl Config {
    /// Credentials from the environment, settings from `$MIRAGE_CONFIG` or
    /// `./mirage.toml`. A missing file means defaults; an unreadable or
    /// invalid one is logged and ignored.
    pub fn load() -> Self {
        let credentials = Credentials::from_env();
        let path = env::var("MIRAGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("mirage.toml"));
        let settings = load_settings(&path);
        Config {
            credentials,
            settings,
        }
    }
}

fn load_settings(path: &Path) -> Settings {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Settings::default();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "failed to read settings: {e}");
            return Settings::default();
        }
    };

    match Settings::from_toml(&text) {
        Ok(settings) => {
            tracing::info!(path = %path.display(), "loaded settings");
            settings
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "ignoring invalid settings: {e}");
            Settings::default()
        }
    }
}
