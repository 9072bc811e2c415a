//! Crate-wide error kinds.
//!
//! The public cache API never propagates these to callers (see
//! `cache` module docs) — they exist so internal code has a single
//! vocabulary for the semantic failure kinds and so tests can assert
//! on *why* an operation returned a miss.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("not found")]
    NotFound,

    #[error("stale entry: {0}")]
    StaleEntry(&'static str),

    #[error("corrupted artifact: {0}")]
    Corruption(String),

    #[error("io failure: {0}")]
    IoFailure(#[from] std::io::Error),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
