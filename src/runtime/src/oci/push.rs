//! Pushing images to a registry.
//!
//! Every blob the manifest references is confirmed present at the
//! destination (already there, mounted, or uploaded) before the manifest is
//! submitted. Distinct blobs are transferred concurrently.

use std::collections::HashSet;

use a3s_rebase_core::error::Result;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};

use super::digest::Digest;
use super::image::{Image, Layer};
use super::manifest::Descriptor;
use super::reference::{Reference, Repository};
use super::registry::{RegistryClient, RegistrySession, UploadSession};

/// Result of a push operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PushResult {
    /// Digest of the pushed manifest
    pub digest: Digest,
    /// Where the manifest was pushed
    pub reference: Reference,
    /// Blobs whose bytes were sent
    pub uploaded: usize,
    /// Blobs mounted from another repository
    pub mounted: usize,
    /// Blobs already present at the destination
    pub skipped: usize,
}

/// Map the requested destination to the one the manifest is pushed to.
///
/// A digest cannot be pushed "to": digest destinations are retargeted to
/// the digest of the content being pushed. Tags are unchanged.
pub fn resolve_destination(requested: &Reference, digest: &Digest) -> Reference {
    if requested.is_digest() {
        requested.context().digest(digest.clone())
    } else {
        requested.clone()
    }
}

enum Blob {
    Config { descriptor: Descriptor, data: Bytes },
    Layer(Layer),
}

impl Blob {
    fn digest(&self) -> &Digest {
        match self {
            Blob::Config { descriptor, .. } => &descriptor.digest,
            Blob::Layer(layer) => layer.digest(),
        }
    }

    fn source_repository(&self) -> Option<&Repository> {
        match self {
            Blob::Config { .. } => None,
            Blob::Layer(layer) => layer.source_repository(),
        }
    }

    async fn bytes(&self) -> Result<Bytes> {
        match self {
            Blob::Config { data, .. } => Ok(data.clone()),
            Blob::Layer(layer) => Ok(Bytes::from(layer.compressed().await?)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Uploaded,
    Mounted,
    Skipped,
}

/// Pushes images to registries.
#[derive(Debug, Clone)]
pub struct RegistryPusher {
    client: RegistryClient,
}

impl RegistryPusher {
    pub fn new(client: RegistryClient) -> Self {
        Self { client }
    }

    /// Push `image` to `destination`.
    ///
    /// The returned reference is `destination` after
    /// [`resolve_destination`]; the manifest is pushed there once.
    pub async fn push(&self, image: &dyn Image, destination: &Reference) -> Result<PushResult> {
        let manifest = image.manifest()?;
        let raw_manifest = image.raw_manifest()?;
        let digest = Digest::sha256_of(&raw_manifest);
        let resolved = resolve_destination(destination, &digest);

        tracing::info!(
            reference = %resolved,
            digest = %digest,
            "Pushing image to registry"
        );

        let mut blobs = vec![Blob::Config {
            descriptor: manifest.config.clone(),
            data: Bytes::from(image.raw_config_file().await?.as_ref().clone()),
        }];
        let mut seen: HashSet<Digest> = HashSet::from([manifest.config.digest.clone()]);
        for layer in image.layers().await? {
            if seen.insert(layer.digest().clone()) {
                blobs.push(Blob::Layer(layer));
            }
        }

        let target = resolved.context();
        let mut mount_from: Vec<Repository> = Vec::new();
        for blob in &blobs {
            if let Some(source) = blob.source_repository() {
                if is_mountable(source, target) && !mount_from.contains(source) {
                    mount_from.push(source.clone());
                }
            }
        }

        let session = self.client.push_session(target, &mount_from).await?;
        let concurrency = self.client.options().max_concurrent_transfers.max(1);
        let transfers: Vec<Transfer> = stream::iter(blobs.iter())
            .map(|blob| transfer(&session, blob))
            .buffer_unordered(concurrency)
            .try_collect()
            .await?;

        let count = |kind: Transfer| transfers.iter().filter(|t| **t == kind).count();
        let result = PushResult {
            digest: digest.clone(),
            reference: resolved.clone(),
            uploaded: count(Transfer::Uploaded),
            mounted: count(Transfer::Mounted),
            skipped: count(Transfer::Skipped),
        };

        session
            .put_manifest(
                &resolved.identifier(),
                &raw_manifest,
                manifest.content_type(),
                &digest,
            )
            .await?;

        tracing::info!(
            reference = %resolved,
            digest = %digest,
            uploaded = result.uploaded,
            mounted = result.mounted,
            skipped = result.skipped,
            "Image pushed successfully"
        );
        Ok(result)
    }
}

/// Blobs can be mounted across repositories of the same registry.
fn is_mountable(source: &Repository, target: &Repository) -> bool {
    source.registry() == target.registry() && source.name() != target.name()
}

/// Make one blob present at the session's repository.
async fn transfer(session: &RegistrySession, blob: &Blob) -> Result<Transfer> {
    let digest = blob.digest();
    if session.blob_exists(digest).await? {
        tracing::debug!(digest = %digest, "Blob already present, skipping");
        return Ok(Transfer::Skipped);
    }

    let mount = blob
        .source_repository()
        .filter(|source| is_mountable(source, session.repository()));
    let location = match session.initiate_upload(mount.map(|source| (digest, source))).await? {
        UploadSession::Mounted => {
            tracing::debug!(digest = %digest, "Blob mounted");
            return Ok(Transfer::Mounted);
        }
        UploadSession::Pending { location } => location,
    };

    let data = blob.bytes().await?;
    let size = data.len();
    session.upload_blob(&location, digest, data).await?;
    tracing::debug!(digest = %digest, size, "Blob uploaded");
    Ok(Transfer::Uploaded)
}
