//! Common types for the rust-ccnd daemon.
//!
//! This crate holds everything that both the daemon core and its clients
//! need to agree on: the ccnb wire coding, names, typed packet views, and
//! the activity meters.

pub mod ccnb;
pub mod error;
pub mod meter;
pub mod name;
pub mod packet;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
