//! Error types shared across the rust-ccnd crates.

use thiserror::Error;

/// All errors that the wire-level crates can produce.
#[derive(Error, Debug)]
pub enum Error {
    /// Error in the ccnb coding layer.
    #[error("ccnb coding error: {0}")]
    Coding(String),

    /// A message did not parse as the expected element.
    #[error("packet error: {0}")]
    Packet(String),

    /// Malformed name or name URI.
    #[error("name error: {0}")]
    Name(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn coding(msg: impl Into<String>) -> Self {
        Error::Coding(msg.into())
    }

    pub fn packet(msg: impl Into<String>) -> Self {
        Error::Packet(msg.into())
    }

    pub fn name(msg: impl Into<String>) -> Self {
        Error::Name(msg.into())
    }
}
