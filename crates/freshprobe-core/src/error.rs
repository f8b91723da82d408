use thiserror::Error;

/// Canonical error type for probe and load-generation operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Layered configuration could not be loaded or deserialized.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but holds values the run cannot use.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The request never produced a response (connect, DNS, timeout).
    #[error("transport error for `{url}`: {message}")]
    Transport {
        /// Request URL.
        url: String,
        /// Underlying client error.
        message: String,
    },

    /// The server answered with a status the caller did not expect.
    #[error("unexpected status {status} from `{url}`")]
    Status {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Response body did not match the expected record shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// Threshold expression could not be parsed.
    #[error("threshold error: {0}")]
    Threshold(String),

    /// I/O error while writing reports.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProbeError {
    /// Creates a `Transport` variant.
    #[must_use]
    pub fn transport(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Creates an `InvalidConfig` variant.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

impl From<serde_json::Error> for ProbeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<prometheus::Error> for ProbeError {
    fn from(err: prometheus::Error) -> Self {
        Self::Internal(format!("metrics exposition: {}", err))
    }
}

/// Convenient result alias for probe operations.
pub type ProbeResult<T> = Result<T, ProbeError>;
