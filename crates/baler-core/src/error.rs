//! Errors shared with the storage crate.

pub use baler_types::error::{BalerError, Result};
