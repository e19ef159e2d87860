mod client;
pub(crate) mod types;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::{build_prompt, SummarizeError, Summarizer, SYSTEM_PROMPT};
use client::ClaudeClient;
use types::*;

pub const DEFAULT_MODEL: &str = "claude-3-7-sonnet-20250219";

// =============================================================================
// Claude Summarizer
// =============================================================================

#[derive(Clone)]
pub struct ClaudeSummarizer {
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    base_url: Option<String>,
    http: reqwest::Client,
}

impl ClaudeSummarizer {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 1000,
            temperature: 0.0,
            base_url: None,
            http: reqwest::Client::new(),
        }
    }

    /// Build from `ANTHROPIC_API_KEY`.
    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        Self::from_key(std::env::var("ANTHROPIC_API_KEY").ok(), model)
    }

    /// A missing or blank key is an error.
    pub fn from_key(api_key: Option<String>, model: impl Into<String>) -> Result<Self> {
        let api_key = api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("ANTHROPIC_API_KEY is not set"))?;
        Ok(Self::new(api_key, model))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn client(&self) -> ClaudeClient {
        let client = ClaudeClient::new(&self.api_key, self.http.clone());
        if let Some(ref url) = self.base_url {
            client.with_base_url(url)
        } else {
            client
        }
    }

    fn request(&self, text: &str, title: &str, date: &str) -> ChatRequest {
        ChatRequest::new(&self.model)
            .system(SYSTEM_PROMPT)
            .message(WireMessage::user(build_prompt(text, title, date)))
            .max_tokens(self.max_tokens)
            .temperature(self.temperature)
    }
}

#[async_trait]
impl Summarizer for ClaudeSummarizer {
    async fn summarize(&self, text: &str, title: &str, date: &str) -> Result<String, SummarizeError> {
        if text.trim().is_empty() {
            return Err(SummarizeError::Malformed("no content to summarize".to_string()));
        }

        let response = self.client().chat(&self.request(text, title, date)).await?;
        if let Some(usage) = &response.usage {
            debug!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Claude usage"
            );
        }

        response
            .text()
            .ok_or_else(|| SummarizeError::Malformed("no text block in Claude response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::client::classify_failure;
    use super::*;
    use reqwest::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one canned HTTP response on an ephemeral port and return its base URL.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.expect("read");
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .and_then(|v| v.trim().parse::<usize>().ok())
                        })
                        .unwrap_or(0);
                    if buf.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
        });
        format!("http://{addr}/v1")
    }

    #[test]
    fn test_claude_new() {
        let ai = ClaudeSummarizer::new("sk-ant-test", DEFAULT_MODEL);
        assert_eq!(ai.model(), DEFAULT_MODEL);
        assert_eq!(ai.api_key, "sk-ant-test");
        assert_eq!(ai.max_tokens, 1000);
    }

    #[test]
    fn missing_or_blank_key_is_rejected() {
        assert!(ClaudeSummarizer::from_key(None, DEFAULT_MODEL).is_err());
        assert!(ClaudeSummarizer::from_key(Some("  ".to_string()), DEFAULT_MODEL).is_err());
        let ai = ClaudeSummarizer::from_key(Some("sk-ant-test".to_string()), DEFAULT_MODEL).expect("key");
        assert_eq!(ai.api_key, "sk-ant-test");
    }

    #[test]
    fn request_carries_system_prompt_and_zero_temperature() {
        let ai = ClaudeSummarizer::new("sk-ant-test", DEFAULT_MODEL);
        let request = ai.request("Section 1. Purpose.", "Some Order", "04/08/2025");
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["model"], DEFAULT_MODEL);
        assert_eq!(json["max_tokens"], 1000);
        assert_eq!(json["temperature"], 0.0);
        assert_eq!(json["messages"][0]["role"], "user");
        let prompt = json["messages"][0]["content"].as_str().unwrap();
        assert!(prompt.contains("\"Some Order\" issued on 04/08/2025"));
        assert!(prompt.contains("Section 1. Purpose."));
        assert!(json["system"].as_str().unwrap().starts_with("You are an expert in law"));
    }

    #[test]
    fn response_text_skips_non_text_blocks() {
        let raw = r#"{"content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Summary body"}],"stop_reason":"end_turn","usage":{"input_tokens":10,"output_tokens":5}}"#;
        let response: ChatResponse = serde_json::from_str(raw).expect("parse");
        assert_eq!(response.text().as_deref(), Some("Summary body"));
    }

    #[test]
    fn overload_statuses_and_error_types_are_retryable() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let err = classify_failure(StatusCode::from_u16(529).unwrap(), body);
        assert!(err.is_retryable());
        assert!(matches!(err, SummarizeError::Overloaded { status: 529, .. }));

        assert!(classify_failure(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());

        let bad = r#"{"type":"error","error":{"type":"invalid_request_error","message":"max_tokens too large"}}"#;
        let err = classify_failure(StatusCode::BAD_REQUEST, bad);
        assert!(!err.is_retryable());
        match err {
            SummarizeError::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "max_tokens too large");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_text_is_rejected_without_a_request() {
        let ai = ClaudeSummarizer::new("sk-ant-test", DEFAULT_MODEL).with_base_url("http://127.0.0.1:9");
        let err = ai.summarize("   ", "t", "d").await.expect_err("blank input");
        assert!(matches!(err, SummarizeError::Malformed(_)));
    }

    #[tokio::test]
    async fn summarize_returns_first_text_block() {
        let base = serve_once(
            "200 OK",
            r#"{"content":[{"type":"text","text":"This order does X."}],"stop_reason":"end_turn"}"#,
        )
        .await;
        let ai = ClaudeSummarizer::new("sk-ant-test", DEFAULT_MODEL).with_base_url(base);
        let summary = ai.summarize("Section 1.", "Title", "01/20/2025").await.expect("summary");
        assert_eq!(summary, "This order does X.");
    }

    #[tokio::test]
    async fn summarize_surfaces_overload_as_retryable() {
        let base = serve_once(
            "529 Site Overloaded",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )
        .await;
        let ai = ClaudeSummarizer::new("sk-ant-test", DEFAULT_MODEL).with_base_url(base);
        let err = ai.summarize("Section 1.", "Title", "01/20/2025").await.expect_err("overloaded");
        assert!(err.is_retryable(), "{err:?}");
    }
}
