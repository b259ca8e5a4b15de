use crate::response::Response;
use thiserror::Error;

/// Main error type for SCM API operations
#[derive(Debug, Error)]
pub enum ScmError {
    /// Configuration could not be resolved during setup
    #[error("configuration error: {0}")]
    Config(String),

    /// A request was attempted before `Client::setup` completed
    #[error("client is not set up: call setup() before sending requests")]
    NotSetUp,

    /// The configured host has no entry in the server table
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// The API answered 404
    #[error("[HTTP 404] object not found")]
    ObjectNotFound { body: Vec<u8> },

    /// A bounded retry loop gave up
    #[error("too many retries ({attempts} attempts)")]
    TooManyRetries { attempts: usize },

    /// Non-success response carrying the decoded error envelope
    #[error("{response}")]
    Api {
        status: u16,
        response: Response,
        body: Vec<u8>,
    },

    /// The token endpoint refused to issue a token
    #[error("{message}")]
    Auth {
        message: String,
        detail: Option<String>,
    },

    /// A success response could not be decoded into the requested type
    #[error("failed to decode response: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
        body: Vec<u8>,
    },

    /// A token refresh this caller waited on failed; carries that
    /// refresh's error as it was reported to the caller that made it
    #[error("token refresh failed: {message}")]
    RefreshFailed {
        message: String,
        status: Option<u16>,
        body: Option<Vec<u8>>,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// The request context was cancelled
    #[error("request cancelled")]
    Cancelled,

    /// The request context deadline passed
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl ScmError {
    /// Create an API error from a status code and raw body
    pub fn api(status: u16, body: Vec<u8>) -> Self {
        let response = Response::new(status, &body);
        ScmError::Api {
            status,
            response,
            body,
        }
    }

    /// Create an authentication error carrying the raw response body
    pub fn auth(message: impl Into<String>, body: &[u8]) -> Self {
        ScmError::Auth {
            message: message.into(),
            detail: Some(String::from_utf8_lossy(body).into_owned()),
        }
    }

    /// Check if this error is the 404 sentinel
    pub fn is_not_found(&self) -> bool {
        matches!(self, ScmError::ObjectNotFound { .. })
    }

    /// Check if this error is the retry-cap sentinel
    pub fn is_too_many_retries(&self) -> bool {
        matches!(self, ScmError::TooManyRetries { .. })
    }

    /// Check if this error is the unknown-host sentinel
    pub fn is_unknown_host(&self) -> bool {
        matches!(self, ScmError::UnknownHost(_))
    }

    /// Get the HTTP status code if the server answered
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ScmError::Api { status, .. } => Some(*status),
            ScmError::ObjectNotFound { .. } => Some(404),
            ScmError::RefreshFailed { status, .. } => *status,
            ScmError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Raw response body, when the error came with one
    pub fn body(&self) -> Option<&[u8]> {
        match self {
            ScmError::Api { body, .. }
            | ScmError::ObjectNotFound { body }
            | ScmError::Decode { body, .. } => Some(body),
            ScmError::RefreshFailed { body, .. } => body.as_deref(),
            _ => None,
        }
    }
}

/// Result type for SCM operations
pub type Result<T> = std::result::Result<T, ScmError>;
