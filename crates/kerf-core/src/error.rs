use thiserror::Error;

/// Errors produced by the kerf protocol layer.
#[derive(Debug, Error)]
pub enum KerfError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid envelope: {0}")]
    Protocol(String),

    #[error("inconsistent frame: {0}")]
    InconsistentFrame(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("attestation error: {0}")]
    Attestation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for KerfError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        KerfError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for KerfError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        KerfError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for KerfError {
    fn from(e: serde_json::Error) -> Self {
        KerfError::Codec(e.to_string())
    }
}

pub type KerfResult<T> = Result<T, KerfError>;
