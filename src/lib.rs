//! tasktree library root.

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod config;
pub mod core;
pub mod error;
pub type Result<T> = error::TaskTreeResult<T>;
