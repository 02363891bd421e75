//! OpenAI-compatible streaming provider client.
//!
//! Speaks the `chat/completions` SSE protocol: one `data:`-prefixed JSON
//! payload per line, `[DONE]` as the terminator. The response body is read in
//! a spawned task that forwards chunks over an unbounded channel, so the
//! returned stream stays lazy and the cancellation token is honored between
//! network reads.

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api::{ChatMessage, ChatRequest, ChatResponse};
use crate::core::config::{Config, GenerationConfig};
use crate::provider::{ChunkStream, GenerationError, ModelProvider};
use crate::utils::url::construct_api_url;

pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    generation: GenerationConfig,
}

impl HttpProvider {
    pub fn new(config: &Config) -> Self {
        HttpProvider {
            client: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            generation: config.generation.clone(),
        }
    }

    fn build_request(&self, prompt: &str) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream: true,
            temperature: Some(self.generation.temperature),
            top_p: Some(self.generation.top_p),
            max_tokens: Some(self.generation.max_output_tokens),
        }
    }
}

#[async_trait::async_trait]
impl ModelProvider for HttpProvider {
    async fn stream_reply(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, GenerationError> {
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        let url = construct_api_url(&self.base_url, "chat/completions");
        let send = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(prompt))
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            response = send => {
                response.map_err(|err| GenerationError::Provider(err.to_string()))?
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Provider(format!(
                "provider request failed with {status}: {}",
                describe_api_error(&body)
            )));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(read_stream(response, cancel, tx));
        Ok(Box::pin(futures_util::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }
}

async fn read_stream(
    response: reqwest::Response,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Result<String, GenerationError>>,
) {
    let mut body = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(Err(GenerationError::Cancelled));
                return;
            }
            chunk = body.next() => chunk,
        };

        // Body exhausted without an explicit [DONE]; treat as completion.
        let Some(chunk) = chunk else { return };

        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tx.send(Err(GenerationError::Provider(err.to_string())));
                return;
            }
        };
        buffer.extend_from_slice(&bytes);

        while let Some(newline) = memchr(b'\n', &buffer) {
            let line = match std::str::from_utf8(&buffer[..newline]) {
                Ok(line) => line.trim().to_string(),
                Err(err) => {
                    warn!(error = %err, "invalid UTF-8 in provider stream, skipping line");
                    buffer.drain(..=newline);
                    continue;
                }
            };
            buffer.drain(..=newline);

            match parse_sse_line(&line) {
                SseLine::Chunk(text) => {
                    // Receiver dropped means the handler is gone; stop reading.
                    if tx.send(Ok(text)).is_err() {
                        return;
                    }
                }
                SseLine::Done => return,
                SseLine::Skip => {}
                SseLine::Invalid(payload) => {
                    let _ = tx.send(Err(GenerationError::Provider(describe_api_error(
                        &payload,
                    ))));
                    return;
                }
            }
        }
    }
}

enum SseLine {
    Chunk(String),
    Done,
    Skip,
    Invalid(String),
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
        return SseLine::Skip;
    };
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    if payload.is_empty() {
        return SseLine::Skip;
    }
    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => match response
            .choices
            .first()
            .and_then(|choice| choice.delta.content.clone())
        {
            Some(content) if !content.is_empty() => SseLine::Chunk(content),
            _ => SseLine::Skip,
        },
        Err(_) => SseLine::Invalid(payload.to_string()),
    }
}

/// Reduce a provider error body to a single human-readable line.
fn describe_api_error(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "provider returned an empty error body".to_string();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&value) {
            return summary;
        }
    }
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        })
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|summary| !summary.is_empty())
}
