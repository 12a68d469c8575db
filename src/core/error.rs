use crate::core::types::DocId;

/// Recoverable failures surfaced to callers. Programmer errors
/// (out-of-range bit access, lifecycle misuse, builder calls on a
/// sealed term table) panic instead of returning a variant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("document {0:?} has already been added")]
    DuplicateDocId(DocId),

    #[error("document {0:?} not found")]
    DocIdNotFound(DocId),

    #[error("slice buffer pool exhausted")]
    PoolExhausted,

    #[error("allocator serves {expected}-byte blocks, {requested} bytes requested")]
    WrongBlockSize { expected: usize, requested: usize },

    #[error("variable blob {blob} of column {column} already allocated")]
    BlobAlreadyAllocated { column: usize, blob: usize },

    #[error("incompatible slice: {0}")]
    IncompatibleSlice(String),

    #[error("index is shut down")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
