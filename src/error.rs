use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("transient I/O error: {0}")]
    TransientIO(String),

    #[error("catalog miss: {0}")]
    CatalogMiss(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Io(e) => DbError::Internal(e.to_string()),
            DbError::ConfigError(s) => DbError::ConfigError(s.clone()),
            DbError::ResourceExhausted(s) => DbError::ResourceExhausted(s.clone()),
            DbError::PeerUnreachable(s) => DbError::PeerUnreachable(s.clone()),
            DbError::ProtocolError(s) => DbError::ProtocolError(s.clone()),
            DbError::TransientIO(s) => DbError::TransientIO(s.clone()),
            DbError::CatalogMiss(s) => DbError::CatalogMiss(s.clone()),
            DbError::Catalog(s) => DbError::Catalog(s.clone()),
            DbError::Network(s) => DbError::Network(s.clone()),
            DbError::Execution(s) => DbError::Execution(s.clone()),
            DbError::Serialization(s) => DbError::Serialization(s.clone()),
            DbError::NotFound(s) => DbError::NotFound(s.clone()),
            DbError::AlreadyExists(s) => DbError::AlreadyExists(s.clone()),
            DbError::InvalidInput(s) => DbError::InvalidInput(s.clone()),
            DbError::Internal(s) => DbError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}
