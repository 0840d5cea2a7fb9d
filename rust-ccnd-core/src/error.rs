//! Daemon startup errors.
//!
//! Once the loop is running no error crosses a component boundary;
//! everything self-handles and logs.  Startup is the exception: a bind
//! or keystore failure is fatal and reaches the caller typed.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StartupError {
    /// The keystore could not be loaded or created.
    #[error("keystore: {0}")]
    Keystore(#[source] std::io::Error),

    /// A listener could not be bound.
    #[error("bind: {0}")]
    Bind(#[source] std::io::Error),

    /// Anything else that went wrong bringing the daemon up.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
