//! A3S Rebase Runtime - registry client and image rebase engine.
//!
//! This crate talks the OCI distribution protocol (challenge handshake,
//! scoped bearer tokens, verified blob transfer) and splices image layer
//! stacks to move an image onto a new base without rebuilding it.

#![allow(clippy::result_large_err)]

pub mod oci;

// Re-export common types
pub use oci::{check_push_permission, resolve_destination};
pub use oci::{ComposedImage, Image, Layer};
pub use oci::{DefaultKeychain, Keychain, RegistryAuth};
pub use oci::{Digest, Reference, Repository};
pub use oci::{ImagePuller, PushResult, RegistryClient, RegistryPusher, RemoteImage};
pub use oci::{RebaseOutcome, RebaseRequest, Rebaser};

/// A3S Rebase Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
