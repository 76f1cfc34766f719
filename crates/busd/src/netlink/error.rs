//! Error type for the low-level netlink socket/message plumbing.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
}
