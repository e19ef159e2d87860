//! Summarizer collaborator: turns an executive action's text into a plain-language summary.

pub mod claude;

use async_trait::async_trait;
use thiserror::Error;

pub use claude::{ClaudeSummarizer, DEFAULT_MODEL};

pub const CRATE_NAME: &str = "eotrack-ai";

pub const SYSTEM_PROMPT: &str = "You are an expert in law, government, and policy analysis. Your task is to analyze executive orders and provide concise, balanced summaries that help ordinary citizens understand them.";

#[derive(Debug, Error)]
pub enum SummarizeError {
    /// Rate limiting or provider overload; the caller may retry later.
    #[error("provider overloaded (status {status}): {message}")]
    Overloaded { status: u16, message: String },
    #[error("provider rejected request (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("malformed summarization exchange: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl SummarizeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SummarizeError::Overloaded { .. } => true,
            SummarizeError::Transport(err) => err.is_timeout(),
            SummarizeError::Api { .. } | SummarizeError::Malformed(_) => false,
        }
    }
}

/// Produces a summary for one record. Retry policy belongs to the caller.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, title: &str, date: &str) -> Result<String, SummarizeError>;
}

pub fn build_prompt(content: &str, title: &str, date: &str) -> String {
    format!(
        r#"
You are analyzing an executive order titled "{title}" issued on {date}.

Here is the full text of the executive order:
---
{content}
---

Please provide a concise summary covering:
1. A simplified explanation of what this executive order is about (2-3 sentences)
2. Potential pros and cons of this order (2-3 bullet points each)
3. What it means and its potential impact (2-3 sentences)
4. Whether it appears lawful/constitutional or potentially overreaches executive power (1-2 sentences)

Format your response in a simple text format without any markdown or special formatting.
"#
    )
}
