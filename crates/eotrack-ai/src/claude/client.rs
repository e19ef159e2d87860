use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::debug;

use super::types::*;
use crate::SummarizeError;

pub(crate) const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic's "overloaded" status, outside the IANA registry.
const STATUS_OVERLOADED: u16 = 529;

pub(crate) struct ClaudeClient {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl ClaudeClient {
    pub fn new(api_key: &str, http: reqwest::Client) -> Self {
        Self {
            api_key: api_key.to_string(),
            http,
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn headers(&self) -> Result<HeaderMap, SummarizeError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| SummarizeError::Malformed(format!("api key is not a valid header: {e}")))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, SummarizeError> {
        let url = format!("{}/messages", self.base_url);

        debug!(model = %request.model, "Claude chat request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| SummarizeError::Malformed(format!("decoding Claude response: {e}")))
    }
}

/// Map a non-success response onto the retryable / non-retryable split.
pub(crate) fn classify_failure(status: StatusCode, body: &str) -> SummarizeError {
    let parsed = serde_json::from_str::<ApiErrorEnvelope>(body).ok();
    let kind = parsed.as_ref().map(|e| e.error.kind.as_str()).unwrap_or_default();
    let message = parsed
        .as_ref()
        .map(|e| e.error.message.clone())
        .unwrap_or_else(|| body.trim().to_string());

    let overloaded = status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::SERVICE_UNAVAILABLE
        || status.as_u16() == STATUS_OVERLOADED
        || matches!(kind, "overloaded_error" | "rate_limit_error");

    if overloaded {
        SummarizeError::Overloaded {
            status: status.as_u16(),
            message,
        }
    } else {
        SummarizeError::Api {
            status: status.as_u16(),
            message,
        }
    }
}
