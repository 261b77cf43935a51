//! Common utilities for usbtarget
//!
//! Shared by the probe binary and any other front end built on the target
//! layer: the error type for host-side plumbing and logging setup.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
