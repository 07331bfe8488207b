//! Shared error type used across the workspace's library crates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("guest address {0:#010x} is outside the process's address space")]
    AddressOutOfRange(u32),

    #[error("page at {0:#010x} is not mapped")]
    PageNotMapped(u32),

    #[error("page at {0:#010x} does not allow this access")]
    PermissionDenied(u32),

    #[error("failed to decode instruction at {0:#010x}")]
    DecodeFailed(u32),

    #[error("code cache is full")]
    CacheFull,

    #[error("index entry for key {0:#018x} already exists")]
    DuplicateKey(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
