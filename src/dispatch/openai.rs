//! OpenAI chat completions backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::dispatch::http::{HttpDispatch, endpoint, sse_frames};
use crate::dispatch::{
    Completion, CompletionRequest, LanguageModel, ProviderStream, StreamCodec, StreamEvent, Usage,
};
use crate::error::MirageError;

pub struct OpenAiModel {
    http: HttpDispatch,
    provider: String,
    model_id: String,
    base_url: String,
    api_key: String,
}

impl OpenAiModel {
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

    fn body(&self, req: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": req.model,
            "messages": [{"role": "user", "content": req.prompt}],
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });
        if stream {
            body["stream"] = serde_json::json!(true);
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![("Authorization", format!("Bearer {}", self.api_key))]
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

impl From<OpenAiUsage> for Usage {
    fn from(u: OpenAiUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, req: &CompletionRequest) -> Result<Completion, MirageError> {
        let url = endpoint(&self.base_url, "chat/completions");
        let response = self
            .http
            .post_json(&self.provider, &url, &self.headers(), &self.body(req, false))
            .await?;
        let completion: ChatCompletion = self.http.read_json(&self.provider, response).await?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| MirageError::ContentGenerationFailed {
                provider: self.provider.clone(),
                message: "empty choices or null content".to_string(),
            })?;

        Ok(Completion {
            text,
            usage: completion.usage.map(Usage::from),
        })
    }

    async fn stream(&self, req: &CompletionRequest) -> Result<ProviderStream, MirageError> {
        let url = endpoint(&self.base_url, "chat/completions");
        let response = self
            .http
            .post_json(&self.provider, &url, &self.headers(), &self.body(req, true))
            .await?;

        Ok(ProviderStream {
            provider: self.provider.clone(),
            frames: sse_frames(&self.provider, response),
            codec: Arc::new(OpenAiCodec),
        })
    }
}

/// Decodes `chat.completion.chunk` payloads.
pub struct OpenAiCodec;

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<OpenAiUsage>,
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl StreamCodec for OpenAiCodec {
    fn full_events(&self, data: &str) -> Result<Vec<StreamEvent>, String> {
        let chunk: ChunkPayload =
            serde_json::from_str(data).map_err(|e| format!("bad openai chunk: {e}"))?;

        if let Some(err) = chunk.error {
            return Ok(vec![StreamEvent::Error(err.message)]);
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                events.push(StreamEvent::TextDelta(text));
            }
            if let Some(reason) = choice.finish_reason {
                events.push(StreamEvent::Other(format!("finish_reason:{reason}")));
            }
        }
        // With include_usage, the last chunk has empty choices and the totals.
        if let Some(usage) = chunk.usage {
            events.push(StreamEvent::Finish {
                usage: Some(usage.into()),
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
        Ok(value["choices"][0]["delta"]["content"]
            .as_str()
            .map(str::to_string))
    }
}
