//! End-to-end generation through the orchestrator against mock provider servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use mirage::cache::ResponseCache;
use mirage::config::{Credentials, GenerationSettings, ProviderOverride, Settings, StreamMode};
use mirage::dispatch::registry::ProviderRegistry;
use mirage::error::MirageError;
use mirage::extract;
use mirage::orchestrator::{GenerationRequest, Orchestrator};
use mirage::prompt::{PagePromptBuilder, PromptBuilder};
use mirage::stream::{StreamChunk, estimate_tokens};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Helper: bind a TCP listener on localhost and return (listener, port).
async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Helper: read one full HTTP request (headers plus Content-Length body).
async fn read_request(socket: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&data);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}

/// Helper: format an SSE data event from a JSON payload.
fn sse(payload: &serde_json::Value) -> String {
    format!("data: {payload}\n\n")
}

fn openai_delta(text: &str) -> String {
    sse(&serde_json::json!({"choices": [{"index": 0, "delta": {"content": text}}]}))
}

const SSE_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Connection: close\r\n\r\n";

const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

const PAGE: &str = "<!DOCTYPE html><html><head><title>Moon Bakery</title></head>\
    <body><h1>Fresh craters daily</h1><p>Open every lunar cycle.</p></body></html>";

fn orchestrator_for(provider: &str, port: u16) -> Orchestrator {
    let key = Some("test-key".to_string());
    let credentials = match provider {
        "openai" => Credentials {
            openai: key,
            ..Default::default()
        },
        "anthropic" => Credentials {
            anthropic: key,
            ..Default::default()
        },
        _ => Credentials {
            google: key,
            ..Default::default()
        },
    };
    let mut providers = HashMap::new();
    providers.insert(
        provider.to_string(),
        ProviderOverride {
            model: None,
            base_url: Some(format!("http://127.0.0.1:{port}/v1")),
        },
    );
    let settings = Settings {
        providers,
        ..Default::default()
    };
    Orchestrator::new(
        Arc::new(ProviderRegistry::from_credentials(&credentials, &settings)),
        Arc::new(ResponseCache::default()),
        Arc::new(PagePromptBuilder),
        GenerationSettings {
            stream_mode: StreamMode::Auto,
            ..Default::default()
        },
    )
}

async fn collect(orch: &Orchestrator, url: &str) -> Vec<Result<StreamChunk, MirageError>> {
    orch.stream(&GenerationRequest::new(url))
        .await
        .unwrap()
        .collect()
        .await
}

// ---------------------------------------------------------------------------
// Blocking generate: a backend that reports no usage still gets metadata
// ---------------------------------------------------------------------------

#[tokio::test]
async fn generate_without_reported_usage_estimates_tokens() {
    let (listener, port) = mock_listener().await;
    let content = format!("<code>{PAGE}</code>");
    let reply = content.clone();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        let body = serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": reply}}]
        })
        .to_string();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
    });

    let url = "https://moon.example/";
    let orch = orchestrator_for("openai", port);
    let response = orch.generate(&GenerationRequest::new(url)).await.unwrap();
    assert_eq!(response.content, content);

    let meta = response.metadata.expect("metadata even without usage");
    let input = estimate_tokens(&PagePromptBuilder.build(url));
    let output = estimate_tokens(&content);
    assert!(input > 0 && output > 0);
    assert_eq!(meta.input_tokens, input);
    assert_eq!(meta.output_tokens, output);
    assert_eq!(meta.tokens_used, input + output);
    assert!(meta.response_time_ms >= 20, "measured {}ms", meta.response_time_ms);
}

// ---------------------------------------------------------------------------
// OpenAI: one tagged page chunk, then the usage chunk
// ---------------------------------------------------------------------------

#[tokio::test]
async fn openai_stream_yields_page_and_reported_usage() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket
            .write_all(openai_delta(&format!("<code>{PAGE}</code>")).as_bytes())
            .await
            .unwrap();
        let usage = serde_json::json!({
            "choices": [],
            "usage": {"prompt_tokens": 20, "completion_tokens": 35, "total_tokens": 55}
        });
        socket.write_all(sse(&usage).as_bytes()).await.unwrap();
        socket.write_all(SSE_DONE).await.unwrap();
        request
    });

    let orch = orchestrator_for("openai", port);
    let chunks: Vec<StreamChunk> = collect(&orch, "https://moon.example/")
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(chunks.len(), 2, "one content chunk plus the terminal chunk");
    assert!(!chunks[0].done);
    let extraction = extract::extract(&chunks[0].content);
    assert_eq!(extraction.document, PAGE);
    assert_eq!(extraction.source, extract::MatchSource::Tagged);

    let terminal = &chunks[1];
    assert!(terminal.done);
    assert!(terminal.content.is_empty());
    let meta = terminal.metadata.as_ref().unwrap();
    assert_eq!(meta.tokens_used, 55);
    assert_eq!(meta.input_tokens, 20);
    assert_eq!(meta.output_tokens, 35);

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /v1/chat/completions"));
    assert!(request.contains("Bearer test-key"));
    assert!(request.contains("\"stream\":true"));
    assert!(request.contains("https://moon.example/"));
}

#[tokio::test]
async fn explicit_provider_minimal_page_round_trip() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        let content = "<code><!DOCTYPE html><html><body>Hi</body></html></code>";
        socket.write_all(openai_delta(content).as_bytes()).await.unwrap();
        let finish = serde_json::json!({"choices": [], "usage": {"total_tokens": 55}});
        socket.write_all(sse(&finish).as_bytes()).await.unwrap();
        socket.write_all(SSE_DONE).await.unwrap();
    });

    let orch = orchestrator_for("openai", port);
    let request = GenerationRequest::new("example.com").with_provider("openai");
    let chunks: Vec<StreamChunk> = orch
        .stream(&request)
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;

    let content: Vec<&StreamChunk> = chunks.iter().filter(|c| !c.done).collect();
    assert_eq!(content.len(), 1);
    assert_eq!(
        extract::extract(&content[0].content).document,
        "<!DOCTYPE html><html><body>Hi</body></html>"
    );
    let terminal = chunks.last().unwrap();
    assert!(terminal.done);
    assert_eq!(terminal.metadata.as_ref().unwrap().tokens_used, 55);

    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Anthropic: typed events, input usage from message_start, output from message_delta
// ---------------------------------------------------------------------------

#[tokio::test]
async fn anthropic_stream_reads_text_deltas_and_reported_usage() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;

        let events = [
            ("message_start", serde_json::json!({"type": "message_start", "message": {"usage": {"input_tokens": 9}}})),
            ("content_block_start", serde_json::json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
            ("ping", serde_json::json!({"type": "ping"})),
            ("content_block_delta", serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "<thinking>bakery</thinking>"}})),
            ("content_block_delta", serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "<code><html></html></code>"}})),
            ("content_block_stop", serde_json::json!({"type": "content_block_stop", "index": 0})),
            ("message_delta", serde_json::json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 12}})),
            ("message_stop", serde_json::json!({"type": "message_stop"})),
        ];

        socket.write_all(SSE_HEADERS).await.unwrap();
        for (name, payload) in events {
            let frame = format!("event: {name}\ndata: {payload}\n\n");
            socket.write_all(frame.as_bytes()).await.unwrap();
        }
        request
    });

    let orch = orchestrator_for("anthropic", port);
    let chunks: Vec<StreamChunk> = collect(&orch, "https://moon.example/")
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(text, "<thinking>bakery</thinking><code><html></html></code>");
    assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);

    let meta = chunks.last().unwrap().metadata.clone().unwrap();
    assert_eq!(meta.input_tokens, 9);
    assert_eq!(meta.output_tokens, 12);
    assert_eq!(meta.tokens_used, 21);

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /v1/messages"));
    assert!(request.to_lowercase().contains("x-api-key: test-key"));
    assert!(request.to_lowercase().contains("anthropic-version: 2023-06-01"));
}

// ---------------------------------------------------------------------------
// Google: usage only on the chunk with a finish reason
// ---------------------------------------------------------------------------

#[tokio::test]
async fn google_stream_uses_final_usage_metadata() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        let first = serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hello "}]}}],
            "usageMetadata": {"promptTokenCount": 5}
        });
        let last = serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "moon"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 37, "totalTokenCount": 42}
        });
        socket.write_all(sse(&first).as_bytes()).await.unwrap();
        socket.write_all(sse(&last).as_bytes()).await.unwrap();
        request
    });

    let orch = orchestrator_for("google", port);
    let chunks: Vec<StreamChunk> = collect(&orch, "https://moon.example/")
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].content, "Hello ");
    assert_eq!(chunks[1].content, "moon");
    let meta = chunks[2].metadata.clone().unwrap();
    assert_eq!(meta.tokens_used, 42);
    assert_eq!(meta.output_tokens, 37);

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /v1/models/gemini-2.0-flash:streamGenerateContent?alt=sse"));
    assert!(request.to_lowercase().contains("x-goog-api-key: test-key"));
}

// ---------------------------------------------------------------------------
// Mid-stream error event
// ---------------------------------------------------------------------------

#[tokio::test]
async fn error_event_aborts_stream_without_terminal_chunk() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket.write_all(openai_delta("<thinking>").as_bytes()).await.unwrap();
        let error = serde_json::json!({"error": {"message": "rate limited", "type": "rate_limit"}});
        socket.write_all(sse(&error).as_bytes()).await.unwrap();
        // The client may already be gone.
        let _ = socket.write_all(openai_delta("never seen").as_bytes()).await;
    });

    let orch = orchestrator_for("openai", port);
    let results = collect(&orch, "https://moon.example/").await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap().content, "<thinking>");
    match &results[1] {
        Err(MirageError::ContentGenerationFailed { provider, message }) => {
            assert_eq!(provider, "openai");
            assert!(message.contains("rate limited"));
        }
        other => panic!("expected ContentGenerationFailed, got {other:?}"),
    }

    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Typed decode breaks on the first payload: same stream, text-only view
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_first_payload_falls_back_to_text() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        // A numeric finish_reason is not a valid typed chunk.
        let odd = serde_json::json!({"choices": [{"delta": {"content": "Hello "}, "finish_reason": 0}]});
        socket.write_all(sse(&odd).as_bytes()).await.unwrap();
        socket.write_all(openai_delta("again").as_bytes()).await.unwrap();
        socket.write_all(SSE_DONE).await.unwrap();
    });

    let orch = orchestrator_for("openai", port);
    let chunks: Vec<StreamChunk> = collect(&orch, "https://moon.example/")
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(text, "Hello again");
    assert!(chunks.last().unwrap().done);

    // Only one connection was ever made.
    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Non-2xx status fails before any chunk
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_error_status_fails_stream_open() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        let body = r#"{"error":{"message":"slow down"}}"#;
        let response = format!(
            "HTTP/1.1 429 Too Many Requests\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
    });

    let orch = orchestrator_for("openai", port);
    let result = orch.stream(&GenerationRequest::new("https://moon.example/")).await;
    match result {
        Err(MirageError::ContentGenerationFailed { provider, message }) => {
            assert_eq!(provider, "openai");
            assert!(message.contains("429"), "status missing from: {message}");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("stream should not open on 429"),
    }

    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Cancellation: terminal chunk still emitted, connection released
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_emits_terminal_chunk_and_releases_connection() {
    let (listener, port) = mock_listener().await;
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket.write_all(openai_delta("first").as_bytes()).await.unwrap();

        // Hold the stream open until the client has gone away.
        let _ = release_rx.await;
        let mut buf = [0u8; 64];
        let closed = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf)).await;
        matches!(closed, Ok(Ok(0)) | Ok(Err(_)))
    });

    let orch = orchestrator_for("openai", port);
    let token = CancellationToken::new();
    let mut chunks = orch
        .stream_with_cancel(&GenerationRequest::new("https://moon.example/"), token.clone())
        .await
        .unwrap();

    let first = chunks.next().await.unwrap().unwrap();
    assert_eq!(first.content, "first");

    token.cancel();
    let terminal = chunks.next().await.unwrap().unwrap();
    assert!(terminal.done);
    assert_eq!(terminal.metadata.unwrap().output_tokens, 2);
    assert!(chunks.next().await.is_none());

    drop(chunks);
    release_tx.send(()).unwrap();
    assert!(server.await.unwrap(), "connection should be closed after cancel");
}
