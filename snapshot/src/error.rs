use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not a snapshot file (bad magic)")]
    BadMagic,

    #[error("snapshot file is truncated")]
    Truncated,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Mem(#[from] grr_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
