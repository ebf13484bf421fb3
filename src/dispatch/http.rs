use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use futures_util::future;
use futures_util::stream::BoxStream;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use crate::config::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::error::MirageError;

pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Shared HTTP plumbing for all backends. Cheap to clone (the client is
/// reference-counted internally).
#[derive(Clone)]
pub struct HttpDispatch {
    client: Client,
}

impl Default for HttpDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDispatch {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    /// `request_timeout` bounds a whole generation, streaming included.
    pub fn with_timeout(request_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("failed to build tuned HTTP client, using defaults: {e}");
                Client::new()
            });

        Self { client }
    }

    /// POST a JSON body and return the response once the status is known good.
    pub async fn post_json(
        &self,
        provider: &str,
        url: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> Result<Response, MirageError> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let response = request.send().await.map_err(|e| {
            MirageError::generation_failed(provider, MirageError::Request(e))
        })?;

        let status = response.status();

        // Cap error body reads to MAX_RESPONSE_BYTES to prevent memory exhaustion
        if !status.is_success() {
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(MAX_RESPONSE_BYTES)];
            let text = String::from_utf8_lossy(truncated);
            tracing::warn!(provider, status = status.as_u16(), "provider rejected request");
            return Err(MirageError::ContentGenerationFailed {
                provider: provider.to_string(),
                message: format!("{status}: {text}"),
            });
        }

        Ok(response)
    }

    /// Read a bounded JSON body.
    pub async fn read_json<T: DeserializeOwned>(
        &self,
        provider: &str,
        response: Response,
    ) -> Result<T, MirageError> {
        let bytes = response.bytes().await.map_err(|e| {
            MirageError::ContentGenerationFailed {
                provider: provider.to_string(),
                message: format!("failed to read response body: {e}"),
            }
        })?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(MirageError::ContentGenerationFailed {
                provider: provider.to_string(),
                message: format!(
                    "response too large: {} bytes (max {})",
                    bytes.len(),
                    MAX_RESPONSE_BYTES
                ),
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| MirageError::ContentGenerationFailed {
            provider: provider.to_string(),
            message: format!("failed to parse response: {e}"),
        })
    }
}

/// Turn an SSE response body into a stream of `data:` payloads.
/// Empty payloads are skipped and an OpenAI-style `[DONE]` sentinel ends the stream.
pub fn sse_frames(
    provider: &str,
    response: Response,
) -> BoxStream<'static, Result<String, MirageError>> {
    let provider = provider.to_string();
    response
        .bytes_stream()
        .eventsource()
        .take_while(|item| {
            let done = matches!(item, Ok(event) if event.data.trim() == "[DONE]");
            future::ready(!done)
        })
        .filter_map(move |item| {
            let result = match item {
                Ok(event) if event.data.trim().is_empty() => None,
                Ok(event) => Some(Ok(event.data)),
                Err(e) => Some(Err(MirageError::ContentGenerationFailed {
                    provider: provider.clone(),
                    message: format!("stream read failed: {e}"),
                })),
            };
            future::ready(result)
        })
        .boxed()
}

/// Join a configured base URL and an endpoint path with exactly one slash.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
