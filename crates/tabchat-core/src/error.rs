/// Top-level error type for tabchat.
///
/// The first five variants are the failure kinds a completion request can
/// end in; callers decide how to present them. Only [`ChatError::Api`] with a
/// 5xx status is ever retried.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The caller cancelled the request or stream.
    #[error("Request was aborted by the user")]
    Aborted,

    /// The provider answered with a non-2xx status or reported an error.
    #[error("API error{}: {message}", status_suffix(.status_code))]
    Api {
        /// Provider message, or a generic one when the body had none.
        message: String,
        /// HTTP status of the failed response, when there was one.
        status_code: Option<u16>,
    },

    /// Failure below HTTP semantics (connect, TLS, body read).
    #[error("Network error: {0}")]
    Network(String),

    /// A streaming response arrived without a body.
    #[error("Empty response body")]
    NoResponseBody,

    /// A stream frame carried malformed JSON.
    #[error("Stream parse error: {0}")]
    StreamParse(String),

    /// Invalid model or client configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A successful response body that could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// Builds an [`ChatError::Api`] from a message and optional status.
    pub fn api(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::Api {
            message: message.into(),
            status_code,
        }
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Aborted => "ABORTED",
            Self::Api { .. } => "API_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
            Self::NoResponseBody => "NO_RESPONSE",
            Self::StreamParse(_) => "STREAM_PARSE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// HTTP status carried by an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status_code, .. } => *status_code,
            _ => None,
        }
    }

    /// True only for API errors with a server-side (5xx) status.
    pub fn is_retryable(&self) -> bool {
        matches!(self.status_code(), Some(status) if status >= 500)
    }
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code.map(|s| format!(" {s}")).unwrap_or_default()
}

/// A convenience `Result` alias using [`ChatError`].
pub type ChatResult<T> = Result<T, ChatError>;
