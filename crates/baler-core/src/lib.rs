pub mod archive;
pub mod build;
pub mod chunking;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod installer;
pub mod lock;
pub mod platform;
pub mod purge;
pub mod scan;
pub mod transfer;

pub use build::{BuildProgress, BuildReport, BuildStatus, Engine, Phase};

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
