//! A3S Rebase Core - Foundational Types
//!
//! Error and configuration types shared by the registry runtime and the CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{NameOptions, Options, RetryPolicy, TransportOptions};
pub use error::{OciError, Result};

/// A3S Rebase version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
