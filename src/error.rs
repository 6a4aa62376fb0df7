use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;

/// Failure taxonomy for one request/connection. Every variant maps to the
/// HTTP status the multiplexer answers with; none of them terminate the
/// process.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("path escapes document root: {0}")]
    PathEscape(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("length required")]
    LengthRequired,
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("destination already exists: {0}")]
    Conflict(String),
    #[error("gateway timeout after {0}s")]
    UpstreamTimeout(u64),
    #[error("gateway terminated by signal: {0}")]
    UpstreamKilled(String),
    #[error("gateway exited with status {0}")]
    UpstreamFailed(i32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::Config(_) => 500,
            ServerError::MalformedRequest(_) => 400,
            ServerError::PathEscape(_) => 403,
            ServerError::NotFound(_) => 404,
            ServerError::LengthRequired => 411,
            ServerError::PayloadTooLarge(_) => 413,
            ServerError::MethodNotAllowed => 405,
            ServerError::Conflict(_) => 409,
            ServerError::UpstreamTimeout(_) => 504,
            ServerError::UpstreamKilled(_) => 502,
            ServerError::UpstreamFailed(_) => 500,
            ServerError::Io(_) => 500,
        }
    }
}
