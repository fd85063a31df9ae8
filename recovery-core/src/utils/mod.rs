//! Error types and logging setup shared by every engine.

pub mod errors;
pub mod logger;

pub use errors::{ErrorKind, RecoveryError, Result};
