use futures_util::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::MirageError;
use crate::extract::{self, ExtractionState, MatchSource};
use crate::orchestrator::{GenerationOptions, GenerationResponse, ResponseMetadata};
use crate::stream::{ChunkMetadata, ChunkStream};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BrowseRequest {
    /// Address to visit. A missing scheme means https (e.g. "example.com/about").
    pub url: String,
    /// Provider id from `list_providers` (defaults to the first configured provider).
    pub provider: Option<String>,
    /// Sampling temperature, 0.0 to 2.0. Higher values invent stranger pages.
    pub temperature: Option<f64>,
    /// Maximum tokens to generate for the page.
    pub max_tokens: Option<u64>,
    /// Stream the generation instead of one blocking call. Streamed pages are not cached.
    pub stream: Option<bool>,
}

impl BrowseRequest {
    pub fn options(&self) -> Option<GenerationOptions> {
        if self.temperature.is_none() && self.max_tokens.is_none() {
            return None;
        }
        Some(GenerationOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        })
    }

    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

pub fn validate_temperature(temp: Option<f64>) -> Result<(), String> {
    if let Some(t) = temp
        && (t.is_nan() || t.is_infinite() || !(0.0..=2.0).contains(&t))
    {
        return Err(format!("temperature must be between 0.0 and 2.0, got {t}"));
    }
    Ok(())
}

/// Token accounting shared by the blocking and streaming paths.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrowseMetadata {
    pub tokens_used: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_speed: Option<f64>,
}

impl From<ResponseMetadata> for BrowseMetadata {
    fn from(m: ResponseMetadata) -> Self {
        Self {
            tokens_used: m.tokens_used,
            input_tokens: m.input_tokens,
            output_tokens: m.output_tokens,
            response_time_ms: m.response_time_ms,
            token_speed: None,
        }
    }
}

impl From<ChunkMetadata> for BrowseMetadata {
    fn from(m: ChunkMetadata) -> Self {
        Self {
            tokens_used: m.tokens_used,
            input_tokens: m.input_tokens,
            output_tokens: m.output_tokens,
            response_time_ms: m.response_time_ms,
            token_speed: Some(m.token_speed),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BrowseResult {
    pub url: String,
    pub provider: String,
    pub model: String,
    pub document: Option<String>,
    pub reasoning: Option<String>,
    pub source: MatchSource,
    pub renderable: bool,
    pub streamed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BrowseMetadata>,
}

impl BrowseResult {
    pub fn from_response(url: &str, response: GenerationResponse) -> Self {
        let extraction = extract::extract(&response.content);
        let document = (!extraction.document.is_empty()).then_some(extraction.document);
        Self {
            url: url.to_string(),
            renderable: document.as_deref().is_some_and(extract::is_renderable),
            document,
            reasoning: extraction.reasoning,
            source: extraction.source,
            provider: response.provider,
            model: response.model,
            streamed: false,
            timestamp: Some(response.timestamp),
            metadata: response.metadata.map(BrowseMetadata::from),
        }
    }
}

/// What a drained stream produced.
#[derive(Debug)]
pub struct StreamOutcome {
    pub state: ExtractionState,
    pub metadata: Option<ChunkMetadata>,
    /// Renderable document updates seen along the way.
    pub updates: usize,
}

/// Feed every chunk through an `ExtractionState` until the terminal chunk.
pub async fn drain_stream(
    url: &str,
    mut chunks: ChunkStream,
) -> Result<StreamOutcome, MirageError> {
    let mut state = ExtractionState::new();
    let mut metadata = None;
    let mut updates = 0;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if chunk.done {
            metadata = chunk.metadata;
            break;
        }
        if state.push(&chunk.content) {
            updates += 1;
            tracing::debug!(
                url = %url,
                source = ?state.source(),
                bytes = state.document().map_or(0, str::len),
                "renderable page update"
            );
        }
    }

    Ok(StreamOutcome {
        state,
        metadata,
        updates,
    })
}

impl StreamOutcome {
    pub fn into_result(self, url: &str, provider: &str, model: &str) -> BrowseResult {
        let document = self.state.document().filter(|d| !d.is_empty()).map(str::to_string);
        BrowseResult {
            url: url.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            renderable: document.as_deref().is_some_and(extract::is_renderable),
            document,
            reasoning: self.state.reasoning().map(str::to_string),
            source: self.state.source(),
            streamed: true,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
            metadata: self.metadata.map(BrowseMetadata::from),
        }
    }
}
