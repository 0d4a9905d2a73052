#![forbid(unsafe_code)]
//! Error types for Spindle.
//!
//! Defines `SimError` and a `Result<T>` alias used throughout the
//! workspace. Every failure mode here is recoverable: the step loop
//! turns them into protocol-visible outcomes and keeps going.

use spindle_types::{ConfigError, DiskId, ObjectId, RequestId};
use thiserror::Error;

/// Unified error type for all Spindle operations.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed input at the protocol boundary: {0}")]
    BadInput(String),

    #[error("invalid configuration header: {0}")]
    Config(#[from] ConfigError),

    #[error("object {0} already exists")]
    DuplicateObject(ObjectId),

    #[error("object {0} does not exist")]
    UnknownObject(ObjectId),

    #[error("request {0} already registered")]
    DuplicateRequest(RequestId),

    #[error("no space for {size} units on disk {disk}")]
    NoSpace { disk: DiskId, size: u32 },

    #[error("no disk can host a replica of {size} units")]
    PlacementExhausted { size: u32 },
}

/// Result alias using `SimError`.
pub type Result<T> = std::result::Result<T, SimError>;
