use recdb::RecDbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid argument shape or violated domain invariant.
    #[error("{0}")]
    Value(String),

    /// Wrong kind of record or heterogeneous record types.
    #[error("{0}")]
    Type(String),

    /// Operation not applicable to this record.
    #[error("{0}")]
    Runtime(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Ser(String),

    #[error(transparent)]
    Db(#[from] RecDbError),
}

pub type Result<T> = std::result::Result<T, Error>;
