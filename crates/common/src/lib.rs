//! Common utilities for tas-host
//!
//! Shared error type and logging setup used by the host binary.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
