//! OCI registry client and image rebasing.
//!
//! ```text
//!  Reference ──► ImagePuller ──► RemoteImage ─┐
//!                                             ├─► mutate::rebase ──► ComposedImage ──► RegistryPusher
//!  old base / new base (Reference or annot.) ─┘
//!
//!  RegistryClient ──► RegistrySession (Transport: /v2/ ping, challenge, token, retries)
//! ```
//!
//! Every blob read goes through [`image::fetch_verified`], which hashes the
//! bytes as they stream in and refuses to hand out content that does not
//! match its descriptor.

mod check;
pub mod credentials;
pub mod digest;
pub mod image;
pub mod manifest;
pub mod mutate;
mod pull;
mod push;
mod rebase;
pub mod reference;
pub mod registry;
pub mod transport;

pub use check::check_push_permission;
pub use credentials::{
    AnonymousKeychain, CredentialStore, DefaultKeychain, Keychain, RegistryAuth, StaticKeychain,
};
pub use digest::{Algorithm, Digest, DigestVerifier};
pub use image::{fetch_verified, BlobSource, ComposedImage, Image, Layer, ManifestTemplate, MemorySource};
pub use manifest::{ConfigFile, Descriptor, History, Manifest, RootFs};
pub use pull::{ImagePuller, Platform, RemoteBlobSource, RemoteImage};
pub use push::{resolve_destination, PushResult, RegistryPusher};
pub use rebase::{RebaseOutcome, RebaseRequest, Rebaser};
pub use reference::{Reference, Repository};
pub use registry::{RegistryClient, RegistrySession, UploadSession};
pub use transport::{Challenge, SessionState, Transport, TransportError};
