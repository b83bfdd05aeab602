use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeraldError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM provider rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("LLM provider timeout after {ms}ms")]
    ProviderTimeout { ms: u64 },

    #[error("LLM provider connection error: {0}")]
    ProviderConnection(String),

    #[error("Context window exceeded")]
    ContextWindowExceeded,

    #[error("Unknown model: {0}")]
    InvalidModel(String),

    #[error("Model refused the request: {0}")]
    Refusal(String),

    #[error("LLM provider error ({status}): {message}")]
    ProviderApi { status: u16, message: String },

    #[error("Frontend error: {0}")]
    Frontend(String),

    #[error("File service error: {0}")]
    FileService(String),

    #[error("Tool '{tool}' failed: {reason}")]
    Tool { tool: String, reason: String },

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HeraldError {
    /// Short code string used in structured logs and admin replies.
    pub fn code(&self) -> &'static str {
        match self {
            HeraldError::Config(_) => "CONFIG_ERROR",
            HeraldError::Cache(_) => "CACHE_ERROR",
            HeraldError::Database(_) => "DATABASE_ERROR",
            HeraldError::RateLimited { .. } => "RATE_LIMITED",
            HeraldError::ProviderTimeout { .. } => "PROVIDER_TIMEOUT",
            HeraldError::ProviderConnection(_) => "PROVIDER_CONNECTION",
            HeraldError::ContextWindowExceeded => "CONTEXT_WINDOW_EXCEEDED",
            HeraldError::InvalidModel(_) => "INVALID_MODEL",
            HeraldError::Refusal(_) => "REFUSAL",
            HeraldError::ProviderApi { .. } => "PROVIDER_API_ERROR",
            HeraldError::Frontend(_) => "FRONTEND_ERROR",
            HeraldError::FileService(_) => "FILE_SERVICE_ERROR",
            HeraldError::Tool { .. } => "TOOL_ERROR",
            HeraldError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            HeraldError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            HeraldError::Cancelled => "CANCELLED",
            HeraldError::Serialization(_) => "SERIALIZATION_ERROR",
            HeraldError::Io(_) => "IO_ERROR",
            HeraldError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Transient errors are retried once with jitter inside the LLM client.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HeraldError::RateLimited { .. }
                | HeraldError::ProviderTimeout { .. }
                | HeraldError::ProviderConnection(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HeraldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(HeraldError::RateLimited { retry_after_ms: 5000 }.is_transient());
        assert!(HeraldError::ProviderTimeout { ms: 1000 }.is_transient());
        assert!(HeraldError::ProviderConnection("reset".into()).is_transient());
        assert!(!HeraldError::ContextWindowExceeded.is_transient());
        assert!(!HeraldError::InsufficientBalance.is_transient());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(HeraldError::InsufficientBalance.code(), "INSUFFICIENT_BALANCE");
        assert_eq!(HeraldError::Cancelled.code(), "CANCELLED");
    }
}
