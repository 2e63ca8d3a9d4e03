use thiserror::Error;

#[derive(Error, Debug)]
pub enum KuraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record not found: recid={0}")]
    RecordNotFound(u64),

    #[error("key not found")]
    KeyNotFound,

    #[error("invalid record format: {0}")]
    InvalidFormat(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, KuraError>;
