//! Structured error kinds, one per row of the error-handling table.
//!
//! `InvariantViolation`-class bugs are never represented here: they are
//! programming errors and remain `assert!`/`panic!` per spec.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("name exceeds NAME_MAX bytes")]
    NameTooLong,

    #[error("entry already exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("free map exhausted")]
    OutOfSectors,

    #[error("path component is not a directory")]
    NotADirectory,
}
