//! Google Gemini (Generative Language API) backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::dispatch::http::{HttpDispatch, endpoint, sse_frames};
use crate::dispatch::{
    Completion, CompletionRequest, LanguageModel, ProviderStream, StreamCodec, StreamEvent, Usage,
};
use crate::error::MirageError;

pub struct GoogleModel {
    http: HttpDispatch,
    provider: String,
    model_id: String,
    base_url: String,
    api_key: String,
}

impl GoogleModel {
    pub fn new(
        http: HttpDispatch,
        provider: &str,
        model_id: &str,
        base_url: &str,
        api_key: &str,
    ) -> Self {
        Self {
            http,
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn body(&self, req: &CompletionRequest) -> serde_json::Value {
        serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": req.prompt}]}],
            "generationConfig": {
                "temperature": req.temperature,
                "maxOutputTokens": req.max_tokens,
            },
        })
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![("x-goog-api-key", self.api_key.clone())]
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    total_token_count: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl From<UsageMetadata> for Usage {
    fn from(u: UsageMetadata) -> Self {
        Usage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }
    }
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
            .filter_map(|p| p.text.as_deref())
            .collect()
    }
}

#[async_trait]
impl LanguageModel for GoogleModel {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, req: &CompletionRequest) -> Result<Completion, MirageError> {
        let url = endpoint(&self.base_url, &format!("models/{}:generateContent", req.model));
        let response = self
            .http
            .post_json(&self.provider, &url, &self.headers(), &self.body(req))
            .await?;
        let parsed: GenerateResponse = self.http.read_json(&self.provider, response).await?;

        let text = parsed.text();
        if text.is_empty() {
            return Err(MirageError::ContentGenerationFailed {
                provider: self.provider.clone(),
                message: "response contained no candidate text".to_string(),
            });
        }

        Ok(Completion {
            text,
            usage: parsed.usage_metadata.map(Usage::from),
        })
    }

    async fn stream(&self, req: &CompletionRequest) -> Result<ProviderStream, MirageError> {
        let url = endpoint(
            &self.base_url,
            &format!("models/{}:streamGenerateContent?alt=sse", req.model),
        );
        let response = self
            .http
            .post_json(&self.provider, &url, &self.headers(), &self.body(req))
            .await?;

        Ok(ProviderStream {
            provider: self.provider.clone(),
            frames: sse_frames(&self.provider, response),
            codec: Arc::new(GoogleCodec),
        })
    }
}

/// Decodes `streamGenerateContent?alt=sse` payloads. Each payload is a
/// complete `GenerateContentResponse` fragment.
pub struct GoogleCodec;

impl StreamCodec for GoogleCodec {
    fn full_events(&self, data: &str) -> Result<Vec<StreamEvent>, String> {
        let parsed: GenerateResponse =
            serde_json::from_str(data).map_err(|e| format!("bad gemini chunk: {e}"))?;

        if let Some(err) = &parsed.error {
            return Ok(vec![StreamEvent::Error(err.message.clone())]);
        }

        let mut events = Vec::new();
        let text = parsed.text();
        if !text.is_empty() {
            events.push(StreamEvent::TextDelta(text));
        }

        // Usage metadata rides along on most chunks; only the one with a
        // finish reason has the final totals.
        let finished = parsed.candidates.iter().any(|c| c.finish_reason.is_some());
        if finished {
            events.push(StreamEvent::Finish {
                usage: parsed.usage_metadata.map(Usage::from),
            });
        }
        Ok(events)
    }

    fn text_delta(&self, data: &str) -> Result<Option<String>, String> {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
            return Ok(None);
        };
        if let Some(message) = value["error"]["message"].as_str() {
            return Err(message.to_string());
        }
        let text: String = value["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
            .unwrap_or_default();
        Ok(Some(text).filter(|t| !t.is_empty()))
    }
}
