use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirageError {
    #[error("no providers available")]
    NoProvidersAvailable,

    #[error("provider not found: {provider}")]
    ProviderNotFound {
        provider: String,
        suggestions: Vec<String>,
    },

    #[error("credential missing for {provider}")]
    CredentialMissing { provider: String },

    #[error("unsupported provider: {provider}")]
    UnsupportedProvider { provider: String },

    #[error("content generation failed for {provider}: {message}")]
    ContentGenerationFailed { provider: String, message: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl MirageError {
    /// Wrap any backend failure as a generation failure for `provider`.
    /// Errors that already carry generation context pass through unchanged.
    pub fn generation_failed(provider: &str, err: MirageError) -> Self {
        match err {
            Self::ContentGenerationFailed { .. } => err,
            other => Self::ContentGenerationFailed {
                provider: provider.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::ProviderNotFound { provider, .. } => Some(provider),
            Self::CredentialMissing { provider } => Some(provider),
            Self::UnsupportedProvider { provider } => Some(provider),
            Self::ContentGenerationFailed { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Produce a sanitized error message safe for returning to MCP clients.
    /// Does not leak connection details or credentials.
    pub fn user_message(&self) -> String {
        match self {
            Self::NoProvidersAvailable => "no providers available: set OPENAI_API_KEY, \
                 ANTHROPIC_API_KEY or GOOGLE_GENERATIVE_AI_API_KEY"
                .to_string(),
            Self::ProviderNotFound {
                provider,
                suggestions,
            } => {
                if suggestions.is_empty() {
                    format!("provider not found: {provider}")
                } else {
                    format!(
                        "provider not found: {provider}. Did you mean: {}?",
                        suggestions.join(", ")
                    )
                }
            }
            Self::CredentialMissing { provider } => {
                format!("no API key configured for {provider}")
            }
            Self::UnsupportedProvider { provider } => {
                format!("unsupported provider: {provider}")
            }
            Self::ContentGenerationFailed { provider, message } => {
                format!("generation failed for {provider}: {message}")
            }
            Self::InvalidUrl(url) => format!("invalid url: {url}"),
            Self::Config(msg) => format!("configuration error: {msg}"),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Other(msg) => msg.clone(),
        }
    }
}
