use thiserror::Error;

use crate::llm::LlmError;

#[derive(Debug, Error)]
pub enum ExplainError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("caller identity missing")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("explanation quota already used for this question")]
    QuotaExhausted,
    #[error("model not configured: {0}")]
    UpstreamConfig(String),
    #[error("model call failed: {0}")]
    UpstreamCall(String),
    #[error("tokenizer unavailable: {0:#}")]
    Tokenizer(anyhow::Error),
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl ExplainError {
    pub fn code(&self) -> &'static str {
        match self {
            ExplainError::NotFound(_) => "not_found",
            ExplainError::Unauthorized => "unauthorized",
            ExplainError::Forbidden(_) => "forbidden",
            ExplainError::QuotaExhausted => "quota_exhausted",
            ExplainError::UpstreamConfig(_) => "upstream_config",
            ExplainError::UpstreamCall(_) => "upstream_call",
            ExplainError::Tokenizer(_) => "tokenizer",
            ExplainError::Store(_) => "store",
        }
    }
}

impl From<LlmError> for ExplainError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::MissingCredential => ExplainError::UpstreamConfig(err.to_string()),
            other => ExplainError::UpstreamCall(other.to_string()),
        }
    }
}
