//! Provider stream → application chunk stream.
//!
//! One backend call yields one `ProviderStream`. The multiplexer decodes its
//! payloads with the strict typed view when it can, drops to the text-only
//! view if that breaks before any content arrives, keeps token/throughput
//! accounting, and always closes with a single `done` chunk.

use std::time::Instant;

use async_stream::try_stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::StreamMode;
use crate::dispatch::{ProviderStream, StreamCodec, StreamEvent, Usage};
use crate::error::MirageError;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChunkMetadata {
    pub tokens_used: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub response_time_ms: u64,
    /// Tokens/sec: instantaneous on content chunks, session mean on the terminal chunk.
    pub token_speed: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
    pub metadata: Option<ChunkMetadata>,
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk, MirageError>>;

/// Rough 4-characters-per-token estimate, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Token and throughput accounting for one stream.
#[derive(Debug, Clone)]
pub struct TokenMeter {
    started: Instant,
    last_delta: Instant,
    estimated_input: u64,
    estimated_output: u64,
    /// Tokens from deltas that arrived with no measurable time gap.
    pending_tokens: u64,
    reported: Usage,
    speed_sum: f64,
    speed_count: u32,
}

impl TokenMeter {
    pub fn new(prompt: &str, started: Instant) -> Self {
        Self {
            started,
            last_delta: started,
            estimated_input: estimate_tokens(prompt),
            estimated_output: 0,
            pending_tokens: 0,
            reported: Usage::default(),
            speed_sum: 0.0,
            speed_count: 0,
        }
    }

    /// Account for one delta arriving at `at`. Returns the instantaneous
    /// speed, or None for empty deltas and zero-length intervals.
    pub fn record_delta(&mut self, text: &str, at: Instant) -> Option<f64> {
        if text.is_empty() {
            return None;
        }
        let added = estimate_tokens(text);
        self.estimated_output += added;
        self.pending_tokens += added;

        let secs = at.saturating_duration_since(self.last_delta).as_secs_f64();
        if secs <= 0.0 {
            return None;
        }

        let speed = self.pending_tokens as f64 / secs;
        self.pending_tokens = 0;
        self.last_delta = at;
        if speed.is_finite() && speed > 0.0 {
            self.speed_sum += speed;
            self.speed_count += 1;
            Some(speed)
        } else {
            None
        }
    }

    /// Provider-reported totals replace the estimates, field by field.
    pub fn apply_usage(&mut self, usage: &Usage) {
        if usage.input_tokens.is_some() {
            self.reported.input_tokens = usage.input_tokens;
        }
        if usage.output_tokens.is_some() {
            self.reported.output_tokens = usage.output_tokens;
        }
        if usage.total_tokens.is_some() {
            self.reported.total_tokens = usage.total_tokens;
        }
    }

    pub fn input_tokens(&self) -> u64 {
        self.reported.input_tokens.unwrap_or(self.estimated_input)
    }

    pub fn output_tokens(&self) -> u64 {
        self.reported.output_tokens.unwrap_or(self.estimated_output)
    }

    pub fn tokens_used(&self) -> u64 {
        self.reported
            .total_tokens
            .unwrap_or_else(|| self.input_tokens() + self.output_tokens())
    }

    /// Arithmetic mean of all positive instantaneous speeds; 0 if none.
    pub fn average_speed(&self) -> f64 {
        if self.speed_count == 0 {
            0.0
        } else {
            self.speed_sum / f64::from(self.speed_count)
        }
    }

    pub fn metadata(&self, at: Instant, token_speed: f64) -> ChunkMetadata {
        ChunkMetadata {
            tokens_used: self.tokens_used(),
            input_tokens: self.input_tokens(),
            output_tokens: self.output_tokens(),
            response_time_ms: at.saturating_duration_since(self.started).as_millis() as u64,
            token_speed,
        }
    }
}

/// Which view of the provider payloads is being consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFlavor {
    FullEvents,
    TextOnly,
}

enum Step {
    Text(String),
    Usage(Usage),
    Fail(String),
}

/// Decode one payload. `Err` only for a strict decode failure in the typed view.
fn decode_frame(
    codec: &dyn StreamCodec,
    flavor: StreamFlavor,
    data: &str,
) -> Result<Vec<Step>, String> {
    match flavor {
        StreamFlavor::TextOnly => Ok(match codec.text_delta(data) {
            Ok(Some(text)) => vec![Step::Text(text)],
            Ok(None) => vec![],
            Err(message) => vec![Step::Fail(message)],
        }),
        StreamFlavor::FullEvents => {
            let events = codec.full_events(data)?;
            Ok(events
                .into_iter()
                .filter_map(|event| match event {
                    StreamEvent::TextDelta(text) => Some(Step::Text(text)),
                    StreamEvent::Finish { usage } => usage.map(Step::Usage),
                    StreamEvent::Error(message) => Some(Step::Fail(message)),
                    StreamEvent::Other(tag) => {
                        tracing::trace!(tag = %tag, "ignoring stream event");
                        None
                    }
                })
                .collect())
        }
    }
}

pub struct StreamMultiplexer {
    mode: StreamMode,
    cancellation_token: Option<CancellationToken>,
}

impl StreamMultiplexer {
    pub fn new(mode: StreamMode) -> Self {
        Self {
            mode,
            cancellation_token: None,
        }
    }

    /// Stop reading when `token` is cancelled. The stream still ends with a
    /// terminal chunk carrying whatever was accounted so far.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Pick the starting flavor from config plus the codec's capability probe.
    pub fn initial_flavor(&self, codec: &dyn StreamCodec) -> StreamFlavor {
        match self.mode {
            StreamMode::Text => StreamFlavor::TextOnly,
            StreamMode::Full => StreamFlavor::FullEvents,
            StreamMode::Auto if codec.supports_full_events() => StreamFlavor::FullEvents,
            StreamMode::Auto => StreamFlavor::TextOnly,
        }
    }

    pub fn run(self, prompt: &str, source: ProviderStream) -> ChunkStream {
        let started = Instant::now();
        let mut meter = TokenMeter::new(prompt, started);
        let mut flavor = self.initial_flavor(source.codec.as_ref());
        let allow_fallback = self.mode == StreamMode::Auto;
        let cancel = self.cancellation_token;
        let ProviderStream {
            provider,
            mut frames,
            codec,
        } = source;

        tracing::debug!(provider = %provider, ?flavor, "stream started");

        Box::pin(try_stream! {
            let mut saw_content = false;
            let mut events = 0usize;

            loop {
                let next = match &cancel {
                    Some(token) => tokio::select! {
                        _ = token.cancelled() => {
                            tracing::info!(provider = %provider, "stream cancelled by caller");
                            None
                        }
                        item = frames.next() => item,
                    },
                    None => frames.next().await,
                };
                let Some(frame) = next else { break };
                let data = frame.map_err(|e| MirageError::generation_failed(&provider, e))?;
                events += 1;

                let steps = match decode_frame(codec.as_ref(), flavor, &data) {
                    Ok(steps) => steps,
                    Err(reason) if allow_fallback && !saw_content => {
                        tracing::warn!(
                            provider = %provider,
                            "typed stream decode failed, falling back to text-only: {reason}"
                        );
                        flavor = StreamFlavor::TextOnly;
                        decode_frame(codec.as_ref(), flavor, &data).unwrap_or_default()
                    }
                    Err(reason) => Err(MirageError::ContentGenerationFailed {
                        provider: provider.clone(),
                        message: format!("stream decode failed: {reason}"),
                    })?,
                };

                for step in steps {
                    match step {
                        Step::Text(text) => {
                            if text.is_empty() {
                                continue;
                            }
                            saw_content = true;
                            let now = Instant::now();
                            let speed = meter.record_delta(&text, now).unwrap_or(0.0);
                            yield StreamChunk {
                                content: text,
                                done: false,
                                metadata: Some(meter.metadata(now, speed)),
                            };
                        }
                        Step::Usage(usage) => meter.apply_usage(&usage),
                        Step::Fail(message) => {
                            tracing::warn!(
                                provider = %provider,
                                "provider reported stream error: {message}"
                            );
                            Err::<(), _>(MirageError::ContentGenerationFailed {
                                provider: provider.clone(),
                                message,
                            })?;
                        }
                    }
                }
            }

            if !saw_content {
                tracing::warn!(provider = %provider, events, "stream ended without content");
            }

            let metadata = meter.metadata(Instant::now(), meter.average_speed());
            tracing::info!(
                provider = %provider,
                tokens = metadata.tokens_used,
                speed = metadata.token_speed,
                "stream complete"
            );
            yield StreamChunk {
                content: String::new(),
                done: true,
                metadata: Some(metadata),
            };
        })
    }
}
