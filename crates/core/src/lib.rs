//! Error type and result alias shared across ferry crates.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod result;

pub use error::Error;
pub use result::Result;
