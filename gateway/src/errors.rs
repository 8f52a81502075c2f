use crate::keypool::KeySet;
use crate::kv::KvError;
use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Errors that can occur while serving a gateway request
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("no credentials available in {0}")]
    NoCredentials(KeySet),

    #[error("key-value store unavailable")]
    KvUnavailable,

    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("upstream returned an unusable body: {0}")]
    UpstreamInvalidBody(String),

    #[error("circuit open for {host}, retry in {retry_after:?}")]
    CircuitOpen { host: String, retry_after: Duration },

    #[error("missing authentication")]
    AuthMissing,

    #[error("invalid client authentication key")]
    AuthInvalid,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("batch larger than {0} texts")]
    BatchTooLarge(usize),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<KvError> for GatewayError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Unavailable => GatewayError::KvUnavailable,
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl GatewayError {
    /// HTTP status this error maps to on the client surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthInvalid => StatusCode::UNAUTHORIZED,
            GatewayError::BadRequest(_) | GatewayError::BatchTooLarge(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NoCredentials(_) | GatewayError::KvUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short client-facing error string. Anything the client can't act on
    /// collapses to a generic internal error; details stay in the logs.
    pub fn client_error(&self) -> &'static str {
        match self {
            GatewayError::AuthMissing => "Missing authentication",
            GatewayError::AuthInvalid => "Invalid client authentication key",
            GatewayError::BadRequest(_) | GatewayError::BatchTooLarge(_) => "Bad request",
            _ => "An internal error occurred",
        }
    }

    /// Longer client-facing message accompanying [`client_error`].
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::AuthMissing => {
                "Provide a key in the URL path, the x-goog-api-key header, or the Authorization header".to_string()
            }
            GatewayError::AuthInvalid => "The provided key is not authorized".to_string(),
            GatewayError::BadRequest(reason) => reason.clone(),
            GatewayError::BatchTooLarge(limit) => format!("Maximum batch size is {limit} texts"),
            _ => "The gateway could not complete the request".to_string(),
        }
    }
}
