//! Result alias for ferry core operations.

use crate::error::Error;

/// The standard Result type for ferry core operations.
pub type Result<T> = std::result::Result<T, Error>;
