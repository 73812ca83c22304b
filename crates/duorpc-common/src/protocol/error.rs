use thiserror::Error;

#[derive(Error, Debug)]
pub enum DuorpcError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("authentication rejected by peer")]
    AuthenticationFailed,

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("call cancelled")]
    Cancelled,

    #[error("connection closed")]
    Disconnected,

    #[error("client is not connected")]
    NotConnected,

    #[error("client {0} is not connected")]
    ClientNotConnected(String),

    #[error("error {code}: {message}")]
    Response { code: i32, message: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rustls::Error> for DuorpcError {
    fn from(err: rustls::Error) -> Self {
        DuorpcError::Connection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DuorpcError>;
