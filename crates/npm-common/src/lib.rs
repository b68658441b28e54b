//! Shared driver plumbing for the network policy dataplane.
//!
//! - [`shell`]: command execution with argument quoting
//! - [`error`]: the error type every OS driver reports through
//!
//! The dataplane crate builds its iptables driver on top of [`shell`]; host
//! endpoint drivers only need [`DriverError`].

pub mod error;
pub mod shell;

pub use error::{DriverError, DriverResult};
