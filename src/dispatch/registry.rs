use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::{Config, Credentials, Settings};
use crate::dispatch::LanguageModel;
use crate::dispatch::anthropic::AnthropicModel;
use crate::dispatch::google::GoogleModel;
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::openai::OpenAiModel;
use crate::error::MirageError;

/// The three supported backends, in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
}

impl ProviderKind {
    /// Registration order. The first registered provider is the default.
    pub const ALL: [ProviderKind; 3] = [Self::OpenAi, Self::Anthropic, Self::Google];

    pub fn id(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.id() == id)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Anthropic => "Anthropic",
            Self::Google => "Google Gemini",
        }
    }

    /// Environment variables holding the API key, most specific first.
    pub fn env_vars(self) -> &'static [&'static str] {
        match self {
            Self::OpenAi => &["OPENAI_API_KEY"],
            Self::Anthropic => &["ANTHROPIC_API_KEY"],
            Self::Google => &["GOOGLE_GENERATIVE_AI_API_KEY", "GEMINI_API_KEY"],
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Anthropic => "claude-3-5-haiku-latest",
            Self::Google => "gemini-2.0-flash",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::Google => "https://generativelanguage.googleapis.com/v1beta",
        }
    }
}

#[derive(Clone)]
pub struct ProviderEntry {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub api_key: String,
    pub model_id: String,
    pub base_url: String,
    pub enabled: bool,
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("model_id", &self.model_id)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Per-backend configuration status, including backends that were left out.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProviderStatus {
    pub configured: bool,
    pub has_credential: bool,
}

/// Enabled providers, fixed at startup. Shared read-only after construction.
pub struct ProviderRegistry {
    providers: Vec<ProviderEntry>,
    http: HttpDispatch,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self::from_credentials(&config.credentials, &config.settings)
    }

    pub fn from_credentials(credentials: &Credentials, settings: &Settings) -> Self {
        let mut providers = Vec::new();

        for kind in ProviderKind::ALL {
            let Some(key) = credentials.get(kind) else {
                tracing::warn!(
                    "{} not set — {} unavailable",
                    kind.env_vars()[0],
                    kind.id()
                );
                continue;
            };

            let overrides = settings.provider_override(kind);
            let model_id = overrides
                .and_then(|o| o.model.clone())
                .unwrap_or_else(|| kind.default_model().to_string());
            let base_url = overrides
                .and_then(|o| o.base_url.clone())
                .unwrap_or_else(|| kind.default_base_url().to_string());

            tracing::info!(provider = kind.id(), model = %model_id, "provider registered");
            providers.push(ProviderEntry {
                id: kind.id().to_string(),
                name: kind.display_name().to_string(),
                kind,
                api_key: key.to_string(),
                model_id,
                base_url,
                enabled: true,
            });
        }

        if providers.is_empty() {
            tracing::error!("no provider credentials configured, no providers available");
        }

        let timeout = Duration::from_secs(settings.generation.request_timeout_secs.max(1));
        Self {
            providers,
            http: HttpDispatch::with_timeout(timeout),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// All registered providers, in registration order.
    pub fn providers(&self) -> &[ProviderEntry] {
        &self.providers
    }

    pub fn resolve(&self, id: &str) -> Result<&ProviderEntry, MirageError> {
        let entry = self.get(id).ok_or_else(|| MirageError::ProviderNotFound {
            provider: id.to_string(),
            suggestions: self.suggest_providers(id),
        })?;

        if entry.api_key.trim().is_empty() {
            return Err(MirageError::CredentialMissing {
                provider: id.to_string(),
            });
        }

        Ok(entry)
    }

    /// First registered provider. Registration order is fixed, not alphabetical.
    pub fn default_provider(&self) -> Result<&str, MirageError> {
        self.providers
            .first()
            .map(|p| p.id.as_str())
            .ok_or(MirageError::NoProvidersAvailable)
    }

    /// Construct a callable handle for `model_id` on `provider_id`.
    pub fn model_handle(
        &self,
        provider_id: &str,
        model_id: &str,
    ) -> Result<Arc<dyn LanguageModel>, MirageError> {
        if ProviderKind::from_id(provider_id).is_none() {
            return Err(MirageError::UnsupportedProvider {
                provider: provider_id.to_string(),
            });
        }
        let entry = self.resolve(provider_id)?;
        let http = self.http.clone();

        let handle: Arc<dyn LanguageModel> = match entry.kind {
            ProviderKind::OpenAi => Arc::new(OpenAiModel::new(
                http,
                &entry.id,
                model_id,
                &entry.base_url,
                &entry.api_key,
            )),
            ProviderKind::Anthropic => Arc::new(AnthropicModel::new(
                http,
                &entry.id,
                model_id,
                &entry.base_url,
                &entry.api_key,
            )),
            ProviderKind::Google => Arc::new(GoogleModel::new(
                http,
                &entry.id,
                model_id,
                &entry.base_url,
                &entry.api_key,
            )),
        };
        Ok(handle)
    }

    /// Status of every known backend, whether or not it was registered.
    pub fn provider_status(&self) -> BTreeMap<String, ProviderStatus> {
        ProviderKind::ALL
            .into_iter()
            .map(|kind| {
                let entry = self.get(kind.id());
                let status = ProviderStatus {
                    configured: entry.is_some_and(|e| e.enabled),
                    has_credential: entry.is_some_and(|e| !e.api_key.trim().is_empty()),
                };
                (kind.id().to_string(), status)
            })
            .collect()
    }

    /// Suggest similar provider ids for a failed lookup (substring match).
    pub fn suggest_providers(&self, query: &str) -> Vec<String> {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return vec![];
        }
        self.providers
            .iter()
            .map(|p| p.id.clone())
            .filter(|id| id.contains(&q) || q.contains(id.as_str()))
            .collect()
    }
}
