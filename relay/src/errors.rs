use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Errors that can occur while relaying a request
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("Upstream request failed for {0}: {1}")]
    UpstreamRequestFailed(String, String),

    #[error("Upstream timeout for {0}")]
    UpstreamTimeout(String),

    #[error("Malformed response from upstream {0}: {1}")]
    UpstreamMalformedResponse(String, String),

    #[error("HTTP client error: {0}")]
    HttpClientError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Short tag for the error kind, used in caller-facing failure bodies and
    /// metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::RequestBodyError(_) => "request_body",
            RelayError::UpstreamRequestFailed(_, _) => "upstream_error",
            RelayError::UpstreamTimeout(_) => "upstream_timeout",
            RelayError::UpstreamMalformedResponse(_, _) => "malformed_response",
            RelayError::HttpClientError(_) => "http_client",
            RelayError::InternalError(_) => "internal",
            RelayError::Io(_) => "io",
        }
    }
}
