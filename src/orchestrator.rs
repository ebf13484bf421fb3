//! Request lifecycle: cache check, provider validation, backend call.
//!
//! `generate` walks CacheCheck → (hit: done) | (miss → validate → invoke →
//! store → done). `stream` skips the cache entirely and hands the backend
//! stream to a [`StreamMultiplexer`].

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cache::ResponseCache;
use crate::config::GenerationSettings;
use crate::dispatch::registry::ProviderRegistry;
use crate::dispatch::{CompletionRequest, LanguageModel};
use crate::error::MirageError;
use crate::prompt::PromptBuilder;
use crate::stream::{ChunkStream, StreamMultiplexer, estimate_tokens};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub url: String,
    /// Provider id. First registered provider when absent.
    pub provider: Option<String>,
    pub options: Option<GenerationOptions>,
}

impl GenerationRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = Some(options);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub tokens_used: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    /// RFC 3339, UTC.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
}

/// Everything a backend call needs once the provider is settled.
struct Prepared {
    provider: String,
    model: Arc<dyn LanguageModel>,
    request: CompletionRequest,
}

pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    cache: Arc<ResponseCache>,
    prompts: Arc<dyn PromptBuilder>,
    settings: GenerationSettings,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: Arc<ResponseCache>,
        prompts: Arc<dyn PromptBuilder>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            registry,
            cache,
            prompts,
            settings,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Provider id a request will run against.
    pub fn provider_for(&self, request: &GenerationRequest) -> Result<String, MirageError> {
        match &request.provider {
            Some(id) => Ok(id.clone()),
            None => self.registry.default_provider().map(str::to_string),
        }
    }

    fn prepare(&self, request: &GenerationRequest) -> Result<Prepared, MirageError> {
        let provider = self.provider_for(request)?;
        tracing::debug!(provider = %provider, "validating provider");
        let entry = self.registry.resolve(&provider)?;
        let model = self.registry.model_handle(&provider, &entry.model_id)?;

        let options = request.options.clone().unwrap_or_default();
        let request = CompletionRequest {
            prompt: self.prompts.build(&request.url),
            model: entry.model_id.clone(),
            temperature: options.temperature.unwrap_or(self.settings.temperature),
            max_tokens: options.max_tokens.unwrap_or(self.settings.max_tokens),
        };

        Ok(Prepared {
            provider,
            model,
            request,
        })
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, MirageError> {
        let provider = self.provider_for(request)?;
        let key = ResponseCache::key(&request.url, &provider, request.options.as_ref());

        tracing::debug!(url = %request.url, provider = %provider, "cache check");
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(url = %request.url, provider = %provider, "cache hit");
            return Ok(hit);
        }
        tracing::debug!(url = %request.url, provider = %provider, "cache miss");

        let prepared = self.prepare(request)?;
        let started = Instant::now();

        tracing::debug!(
            provider = %prepared.provider,
            model = %prepared.request.model,
            "invoking backend"
        );
        let completion = match prepared.model.generate(&prepared.request).await {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(provider = %prepared.provider, "generation errored: {e}");
                return Err(MirageError::generation_failed(&prepared.provider, e));
            }
        };

        let response_time_ms = started.elapsed().as_millis() as u64;
        // Missing usage falls back to estimates; the timing is always real.
        let usage = completion.usage.unwrap_or_default();
        let input_tokens = usage
            .input_tokens
            .unwrap_or_else(|| estimate_tokens(&prepared.request.prompt));
        let output_tokens = usage
            .output_tokens
            .unwrap_or_else(|| estimate_tokens(&completion.text));
        let metadata = ResponseMetadata {
            tokens_used: usage.total_tokens.unwrap_or(input_tokens + output_tokens),
            input_tokens,
            output_tokens,
            response_time_ms,
        };

        let response = GenerationResponse {
            content: completion.text,
            provider: prepared.provider.clone(),
            model: prepared.request.model.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            metadata: Some(metadata),
        };

        tracing::debug!(provider = %prepared.provider, "storing in cache");
        self.cache.put(key, response.clone());
        tracing::info!(
            url = %request.url,
            provider = %prepared.provider,
            latency_ms = response_time_ms,
            "page generated"
        );
        Ok(response)
    }

    pub async fn stream(&self, request: &GenerationRequest) -> Result<ChunkStream, MirageError> {
        self.open_stream(request, None).await
    }

    /// Like [`stream`](Self::stream), but reading stops when `token` fires.
    /// The returned stream still ends with its terminal chunk.
    pub async fn stream_with_cancel(
        &self,
        request: &GenerationRequest,
        token: CancellationToken,
    ) -> Result<ChunkStream, MirageError> {
        self.open_stream(request, Some(token)).await
    }

    async fn open_stream(
        &self,
        request: &GenerationRequest,
        token: Option<CancellationToken>,
    ) -> Result<ChunkStream, MirageError> {
        if self.registry.is_empty() {
            return Err(MirageError::NoProvidersAvailable);
        }
        let prepared = self.prepare(request)?;

        tracing::debug!(
            provider = %prepared.provider,
            model = %prepared.request.model,
            "opening stream"
        );
        let source = prepared
            .model
            .stream(&prepared.request)
            .await
            .map_err(|e| MirageError::generation_failed(&prepared.provider, e))?;

        let mut multiplexer = StreamMultiplexer::new(self.settings.stream_mode);
        if let Some(token) = token {
            multiplexer = multiplexer.with_cancellation(token);
        }
        Ok(multiplexer.run(&prepared.request.prompt, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, Settings};
    use crate::prompt::PagePromptBuilder;

    fn orchestrator(credentials: Credentials) -> Orchestrator {
        Orchestrator::new(
            Arc::new(ProviderRegistry::from_credentials(
                &credentials,
                &Settings::default(),
            )),
            Arc::new(ResponseCache::default()),
            Arc::new(PagePromptBuilder),
            GenerationSettings::default(),
        )
    }

    fn cached(provider: &str) -> GenerationResponse {
        GenerationResponse {
            content: "<html></html>".to_string(),
            provider: provider.to_string(),
            model: "m".to_string(),
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn cache_hit_returns_without_validation() {
        // No credentials at all: any backend call would fail.
        let orch = orchestrator(Credentials::default());
        let request = GenerationRequest::new("https://a.example/").with_provider("openai");
        let key = ResponseCache::key(&request.url, "openai", None);
        orch.cache().put(key, cached("openai"));

        let response = orch.generate(&request).await.unwrap();
        assert_eq!(response.provider, "openai");
        assert_eq!(orch.cache().size(), 1);
    }

    #[tokio::test]
    async fn generate_without_providers_fails() {
        let orch = orchestrator(Credentials::default());
        let err = orch
            .generate(&GenerationRequest::new("https://a.example/"))
            .await
            .unwrap_err();
        assert!(matches!(err, MirageError::NoProvidersAvailable));
    }

    #[tokio::test]
    async fn stream_rejects_unknown_provider_before_yielding() {
        let orch = orchestrator(Credentials {
            google: Some("g".to_string()),
            ..Default::default()
        });
        let request = GenerationRequest::new("https://a.example/").with_provider("openai");
        match orch.stream(&request).await {
            Err(MirageError::ProviderNotFound { provider, .. }) => assert_eq!(provider, "openai"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("stream should not open"),
        }
    }

    #[tokio::test]
    async fn stream_without_providers_fails() {
        let orch = orchestrator(Credentials::default());
        let result = orch.stream(&GenerationRequest::new("https://a.example/")).await;
        assert!(matches!(result, Err(MirageError::NoProvidersAvailable)));
    }

    #[test]
    fn default_provider_follows_registration_order() {
        let orch = orchestrator(Credentials {
            anthropic: Some("a".to_string()),
            google: Some("g".to_string()),
            ..Default::default()
        });
        let request = GenerationRequest::new("u");
        assert_eq!(orch.provider_for(&request).unwrap(), "anthropic");
    }
}
