use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShoalError>;

#[derive(Debug, Error)]
pub enum ShoalError {
    #[error("malformed hash: {0}")]
    MalformedHash(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("resize failed: {0}")]
    ResizeFailed(String),

    #[error("node is not writeable")]
    NotWriteable,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}
