use thiserror::Error;

/// Errors produced by the outpost core layer.
#[derive(Debug, Error)]
pub enum OutpostError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("rule parse error: {0}")]
    RuleParse(String),

    #[error("enrichment error: {0}")]
    Enrichment(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("destination denied: {0}:{1}")]
    DestinationDenied(String, u16),

    #[error("not a SOCKS5 connection")]
    NotSocks,

    #[error("connection failed: {0}")]
    Connection(#[source] Box<OutpostError>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl OutpostError {
    /// Wrap any failure from the tunnel handshake/connect path as a
    /// single connection error carrying the underlying cause.
    pub fn into_connection(self) -> OutpostError {
        match self {
            OutpostError::Connection(_) => self,
            other => OutpostError::Connection(Box::new(other)),
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for OutpostError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        OutpostError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for OutpostError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        OutpostError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for OutpostError {
    fn from(e: serde_json::Error) -> Self {
        OutpostError::RuleParse(e.to_string())
    }
}

pub type OutpostResult<T> = Result<T, OutpostError>;
