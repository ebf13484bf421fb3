pub mod anthropic;
pub mod google;
pub mod http;
pub mod openai;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::MirageError;

/// Internal request type. Every backend accepts this.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Provider-side model id (e.g. "gpt-4o-mini").
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u64,
}

/// Token counts as reported by a provider. Any field may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none() && self.total_tokens.is_none()
    }
}

/// Result of a non-streaming completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Option<Usage>,
}

/// One typed event from a provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    /// Usage report, usually at the end of generation. Reported fields are
    /// authoritative and may arrive across several events.
    Finish { usage: Option<Usage> },
    /// Provider-reported failure. Terminal.
    Error(String),
    /// Anything else (pings, block boundaries). Ignored by consumers.
    Other(String),
}

/// Decodes raw SSE `data:` payloads from one backend.
///
/// A codec exposes two views of the same payloads: a strict typed view and a
/// lenient text-only view. Consumers pick one up front and may drop to the
/// text view if the typed decode breaks before any content arrives.
pub trait StreamCodec: Send + Sync {
    /// Whether `full_events` is worth trying for this backend.
    fn supports_full_events(&self) -> bool {
        true
    }

    /// Strict decode. Malformed payloads are an error; unrecognized event
    /// tags come back as `Other`.
    fn full_events(&self, data: &str) -> Result<Vec<StreamEvent>, String>;

    /// Lenient decode. `Ok(None)` for payloads with no text,
    /// `Err` only for payloads that are themselves provider errors.
    fn text_delta(&self, data: &str) -> Result<Option<String>, String>;
}

/// An open streaming generation: raw SSE payloads plus the codec for them.
/// Dropping it releases the underlying HTTP connection.
pub struct ProviderStream {
    pub provider: String,
    pub frames: BoxStream<'static, Result<String, MirageError>>,
    pub codec: Arc<dyn StreamCodec>,
}

/// Opaque handle to one provider model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider(&self) -> &str;

    fn model_id(&self) -> &str;

    async fn generate(&self, req: &CompletionRequest) -> Result<Completion, MirageError>;

    async fn stream(&self, req: &CompletionRequest) -> Result<ProviderStream, MirageError>;
}
