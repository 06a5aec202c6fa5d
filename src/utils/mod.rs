//! The `utils` module holds definitions shared by every other module:
//! the crate-wide error type and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Result};
