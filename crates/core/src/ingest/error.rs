use thiserror::Error;

/// Per-ticker failure from the market data provider. Never fatal to a run.
#[derive(Debug, Error)]
pub enum MarketDataError {
    /// Unknown or delisted symbol (HTTP 404).
    #[error("ticker not found by provider")]
    NotFound,

    /// Provider throttling (HTTP 429). No retry is attempted.
    #[error("rate limited by provider (retry_after_secs={retry_after_secs:?})")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Network failure or timeout, including the per-task timeout.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    /// The fetch task panicked or was cancelled before producing an outcome.
    #[error("fetch task failed: {0}")]
    TaskFailed(String),
}

impl MarketDataError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::Transport(_) => "transport",
            Self::Http { .. } => "http",
            Self::InvalidResponse(_) => "invalid_response",
            Self::TaskFailed(_) => "task_failed",
        }
    }
}

impl From<reqwest::Error> for MarketDataError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::InvalidResponse(err.to_string());
        }
        if err.is_timeout() {
            return Self::Transport(format!("request timed out: {err}"));
        }
        Self::Transport(err.to_string())
    }
}
