//! Anthropic Messages API backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::dispatch::http::{HttpDispatch, endpoint, sse_frames};
use crate::dispatch::{
    Completion, CompletionRequest, LanguageModel, ProviderStream, StreamCodec, StreamEvent, Usage,
};
use crate::error::MirageError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicModel {
    http: HttpDispatch,
    provider: String,
    model_id: String,
    base_url: String,
    api_key: String,
}

impl AnthropicModel {
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
        serde_json::json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "messages": [{"role": "user", "content": req.prompt}],
            "stream": stream,
        })
    }

    // Anthropic uses x-api-key, not a Bearer token.
    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-api-key", self.api_key.clone()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ]
    }
}

#[derive(Deserialize)]
struct MessageResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize, Default)]
struct AnthropicUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl From<AnthropicUsage> for Usage {
    fn from(u: AnthropicUsage) -> Self {
        let total_tokens = match (u.input_tokens, u.output_tokens) {
            (Some(i), Some(o)) => Some(i + o),
            _ => None,
        };
        Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            total_tokens,
        }
    }
}

fn partial_usage(u: AnthropicUsage) -> Usage {
    Usage {
        input_tokens: u.input_tokens,
        output_tokens: u.output_tokens,
        total_tokens: None,
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, req: &CompletionRequest) -> Result<Completion, MirageError> {
        let url = endpoint(&self.base_url, "messages");
        let response = self
            .http
            .post_json(&self.provider, &url, &self.headers(), &self.body(req, false))
            .await?;
        let message: MessageResponse = self.http.read_json(&self.provider, response).await?;

        let text: String = message
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect();

        if text.is_empty() {
            return Err(MirageError::ContentGenerationFailed {
                provider: self.provider.clone(),
                message: "response contained no text blocks".to_string(),
            });
        }

        Ok(Completion {
            text,
            usage: message.usage.map(Usage::from),
        })
    }

    async fn stream(&self, req: &CompletionRequest) -> Result<ProviderStream, MirageError> {
        let url = endpoint(&self.base_url, "messages");
        let response = self
            .http
            .post_json(&self.provider, &url, &self.headers(), &self.body(req, true))
            .await?;

        Ok(ProviderStream {
            provider: self.provider.clone(),
            frames: sse_frames(&self.provider, response),
            codec: Arc::new(AnthropicCodec),
        })
    }
}

/// Decodes Messages API stream events.
pub struct AnthropicCodec;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    MessageStart {
        #[serde(default)]
        message: StartMessage,
    },
    ContentBlockStart,
    ContentBlockDelta { delta: BlockDelta },
    ContentBlockStop,
    MessageDelta {
        #[serde(default)]
        usage: AnthropicUsage,
    },
    MessageStop,
    Ping,
    Error { error: ErrorBody },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Default)]
struct StartMessage {
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta,
    SignatureDelta,
    InputJsonDelta,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl StreamCodec for AnthropicCodec {
    fn full_events(&self, data: &str) -> Result<Vec<StreamEvent>, String> {
        let event: AnthropicEvent =
            serde_json::from_str(data).map_err(|e| format!("bad anthropic event: {e}"))?;

        let event = match event {
            AnthropicEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
            } => StreamEvent::TextDelta(text),
            AnthropicEvent::ContentBlockDelta { .. } => StreamEvent::Other("non_text_delta".into()),
            // Input count arrives in message_start (its output count is a
            // placeholder), output in message_delta. No total is derived.
            AnthropicEvent::MessageStart { message } => StreamEvent::Finish {
                usage: message.usage.input_tokens.map(|input| Usage {
                    input_tokens: Some(input),
                    ..Default::default()
                }),
            },
            AnthropicEvent::MessageDelta { usage } => StreamEvent::Finish {
                usage: Some(partial_usage(usage)).filter(|u| !u.is_empty()),
            },
            AnthropicEvent::Error { error } => StreamEvent::Error(error.message),
            AnthropicEvent::ContentBlockStart => StreamEvent::Other("content_block_start".into()),
            AnthropicEvent::ContentBlockStop => StreamEvent::Other("content_block_stop".into()),
            AnthropicEvent::MessageStop => StreamEvent::Other("message_stop".into()),
            AnthropicEvent::Ping => StreamEvent::Other("ping".into()),
            AnthropicEvent::Unknown => StreamEvent::Other("unknown".into()),
        };
        Ok(vec![event])
    }

    fn text_delta(&self, data: &str) -> Result<Option<String>, String> {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
            return Ok(None);
        };
        if value["type"] == "error" {
            let message = value["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(message.to_string());
        }
        Ok(value["delta"]["text"].as_str().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_events_reads_text_delta() {
        let events = AnthropicCodec
            .full_events(
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
            )
            .unwrap();
        assert_eq!(events, vec![StreamEvent::TextDelta("Hello".to_string())]);
    }

    #[test]
    fn full_events_maps_message_delta_usage() {
        let events = AnthropicCodec
            .full_events(
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":42}}"#,
            )
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Finish {
                usage: Some(Usage {
                    input_tokens: None,
                    output_tokens: Some(42),
                    total_tokens: None,
                })
            }]
        );
    }

    #[test]
    fn full_events_reports_error_event() {
        let events = AnthropicCodec
            .full_events(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .unwrap();
        assert_eq!(events, vec![StreamEvent::Error("Overloaded".to_string())]);
    }

    #[test]
    fn full_events_ignores_ping_and_stop() {
        assert_eq!(
            AnthropicCodec.full_events(r#"{"type":"ping"}"#).unwrap(),
            vec![StreamEvent::Other("ping".to_string())]
        );
        assert_eq!(
            AnthropicCodec.full_events(r#"{"type":"message_stop"}"#).unwrap(),
            vec![StreamEvent::Other("message_stop".to_string())]
        );
    }

    #[test]
    fn full_events_reads_message_start_input_usage() {
        let events = AnthropicCodec
            .full_events(
                r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":25,"output_tokens":1}}}"#,
            )
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Finish {
                usage: Some(Usage {
                    input_tokens: Some(25),
                    output_tokens: None,
                    total_tokens: None,
                })
            }]
        );

        assert_eq!(
            AnthropicCodec.full_events(r#"{"type":"message_start"}"#).unwrap(),
            vec![StreamEvent::Finish { usage: None }]
        );
    }

    #[test]
    fn full_events_passes_over_unknown_tags() {
        assert_eq!(
            AnthropicCodec.full_events(r#"{"type":"brand_new_event","index":3}"#).unwrap(),
            vec![StreamEvent::Other("unknown".to_string())]
        );
        assert_eq!(
            AnthropicCodec
                .full_events(
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"citations_delta","citation":{"cited_text":"x"}}}"#,
                )
                .unwrap(),
            vec![StreamEvent::Other("non_text_delta".to_string())]
        );
    }

    #[test]
    fn full_events_rejects_malformed_known_event() {
        assert!(AnthropicCodec.full_events("{not json").is_err());
        assert!(
            AnthropicCodec
                .full_events(r#"{"type":"content_block_delta","delta":{"type":"text_delta"}}"#)
                .is_err()
        );
    }

    #[test]
    fn text_delta_surfaces_errors() {
        let result = AnthropicCodec
            .text_delta(r#"{"type":"error","error":{"message":"Overloaded"}}"#);
        assert_eq!(result, Err("Overloaded".to_string()));
    }
}
