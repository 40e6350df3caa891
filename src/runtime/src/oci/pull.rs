//! Remote images.
//!
//! [`ImagePuller`] resolves a [`Reference`] to a [`RemoteImage`]: the
//! manifest is fetched (following an image index to the configured
//! platform) and verified, while the config and layers stay in the
//! registry until something reads them.

use std::sync::{Arc, OnceLock};

use a3s_rebase_core::error::{OciError, Result};
use async_trait::async_trait;
use oci_spec::image::ImageIndex;
use tokio::sync::OnceCell;

use super::digest::Digest;
use super::image::{fetch_verified, zip_layers, BlobSource, BlobStream, Image, Layer};
use super::manifest::{is_index, ConfigFile, Descriptor, Manifest};
use super::reference::{Reference, Repository};
use super::registry::{RegistryClient, RegistrySession};

/// Target platform for image index resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    /// Parse `os/arch[/variant]`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(OciError::ConfigError(format!(
                "Invalid platform '{}': expected os/arch[/variant]",
                s
            ))),
        }
    }

    /// `linux` with the host's CPU architecture.
    pub fn host_linux() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
            variant: None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref variant) = self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Pick the index entry for `platform`. An exact variant match wins over
/// an entry that only matches os and architecture.
fn resolve_platform(index: &ImageIndex, platform: &Platform) -> Option<String> {
    let candidates: Vec<_> = index
        .manifests()
        .iter()
        .filter(|entry| {
            entry.platform().as_ref().map_or(false, |p| {
                p.os().to_string() == platform.os
                    && p.architecture().to_string() == platform.architecture
            })
        })
        .collect();

    let exact = candidates.iter().find(|entry| {
        let variant = entry.platform().as_ref().and_then(|p| p.variant().clone());
        variant == platform.variant
    });
    exact
        .or_else(|| candidates.first())
        .map(|entry| entry.digest().to_string())
}

/// Blobs of one registry repository.
#[derive(Debug, Clone)]
pub struct RemoteBlobSource {
    session: RegistrySession,
}

impl RemoteBlobSource {
    pub fn new(session: RegistrySession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl BlobSource for RemoteBlobSource {
    async fn open(&self, descriptor: &Descriptor) -> Result<BlobStream> {
        self.session.get_blob(&descriptor.digest).await
    }

    fn repository(&self) -> Option<&Repository> {
        Some(self.session.repository())
    }
}

/// An image whose manifest has been fetched from a registry.
pub struct RemoteImage {
    reference: Reference,
    raw_manifest: Arc<Vec<u8>>,
    manifest: OnceLock<Arc<Manifest>>,
    raw_config: OnceCell<Arc<Vec<u8>>>,
    config: OnceCell<Arc<ConfigFile>>,
    source: Arc<RemoteBlobSource>,
}

impl std::fmt::Debug for RemoteImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteImage")
            .field("reference", &self.reference.to_string())
            .field("manifest_size", &self.raw_manifest.len())
            .finish()
    }
}

impl RemoteImage {
    /// Reference the image was fetched by.
    pub fn reference(&self) -> &Reference {
        &self.reference
    }
}

#[async_trait]
impl Image for RemoteImage {
    fn raw_manifest(&self) -> Result<Arc<Vec<u8>>> {
        Ok(self.raw_manifest.clone())
    }

    fn manifest(&self) -> Result<Arc<Manifest>> {
        if let Some(manifest) = self.manifest.get() {
            return Ok(manifest.clone());
        }
        let parsed = Manifest::from_slice(&self.raw_manifest).map_err(|e| {
            OciError::ManifestFetchFailed {
                reference: self.reference.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(self.manifest.get_or_init(|| Arc::new(parsed)).clone())
    }

    async fn raw_config_file(&self) -> Result<Arc<Vec<u8>>> {
        let manifest = self.manifest()?;
        self.raw_config
            .get_or_try_init(|| async {
                let data = fetch_verified(self.source.as_ref(), &manifest.config).await?;
                Ok::<_, OciError>(Arc::new(data))
            })
            .await
            .cloned()
    }

    async fn config_file(&self) -> Result<Arc<ConfigFile>> {
        self.config
            .get_or_try_init(|| async {
                let raw = self.raw_config_file().await?;
                Ok::<_, OciError>(Arc::new(ConfigFile::from_slice(&raw)?))
            })
            .await
            .cloned()
    }

    async fn layers(&self) -> Result<Vec<Layer>> {
        let manifest = self.manifest()?;
        let config = self.config_file().await?;
        zip_layers(&manifest, &config, self.source.clone())
    }
}

/// Fetches images from registries.
#[derive(Debug, Clone)]
pub struct ImagePuller {
    client: RegistryClient,
    platform: Platform,
}

impl ImagePuller {
    /// Create a puller. The index platform comes from the client's
    /// transport options, defaulting to linux on the host architecture.
    pub fn new(client: RegistryClient) -> Result<Self> {
        let platform = match client.options().platform {
            Some(ref p) => Platform::parse(p)?,
            None => Platform::host_linux(),
        };
        Ok(Self { client, platform })
    }

    pub fn client(&self) -> &RegistryClient {
        &self.client
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Fetch the manifest for `reference` and return the image it describes.
    pub async fn image(&self, reference: &Reference) -> Result<RemoteImage> {
        tracing::info!(reference = %reference, "Fetching image");
        let session = self.client.pull_session(reference.context()).await?;
        let (reference, raw) = self.fetch_image_manifest(&session, reference).await?;

        tracing::debug!(
            reference = %reference,
            digest = %Digest::sha256_of(&raw),
            "Image manifest verified"
        );
        Ok(RemoteImage {
            reference,
            raw_manifest: Arc::new(raw),
            manifest: OnceLock::new(),
            raw_config: OnceCell::new(),
            config: OnceCell::new(),
            source: Arc::new(RemoteBlobSource::new(session)),
        })
    }

    /// Digest of the manifest `reference` points at, without following
    /// an index. Uses `HEAD` and falls back to `GET`.
    pub async fn digest(&self, reference: &Reference) -> Result<Digest> {
        if let Some(digest) = reference.digest() {
            return Ok(digest.clone());
        }
        let session = self.client.pull_session(reference.context()).await?;
        let identifier = reference.identifier();
        if let Some(head) = session.head_manifest(&identifier).await? {
            if let Some(digest) = head.digest {
                return Ok(digest);
            }
        }
        let fetched = session.get_manifest(&identifier).await?;
        let digest = Digest::sha256_of(&fetched.bytes);
        verify_manifest(reference, fetched.digest.as_ref(), &fetched.bytes)?;
        Ok(digest)
    }

    /// Fetch and verify the manifest, following an index once.
    async fn fetch_image_manifest(
        &self,
        session: &RegistrySession,
        reference: &Reference,
    ) -> Result<(Reference, Vec<u8>)> {
        let fetched = session.get_manifest(&reference.identifier()).await?;
        verify_manifest(reference, fetched.digest.as_ref(), &fetched.bytes)?;

        let media_type = fetched
            .media_type
            .clone()
            .or_else(|| sniff_media_type(&fetched.bytes));
        if !media_type.as_deref().map_or(false, is_index) {
            return Ok((reference.clone(), fetched.bytes));
        }

        let index = ImageIndex::from_reader(fetched.bytes.as_slice()).map_err(|e| {
            OciError::ManifestFetchFailed {
                reference: reference.to_string(),
                reason: format!("invalid image index: {}", e),
            }
        })?;
        let child = resolve_platform(&index, &self.platform).ok_or_else(|| {
            OciError::ManifestFetchFailed {
                reference: reference.to_string(),
                reason: format!("no manifest for platform {}", self.platform),
            }
        })?;
        let child = reference.context().digest(Digest::parse(&child)?);
        tracing::debug!(
            reference = %reference,
            platform = %self.platform,
            child = %child,
            "Resolved image index"
        );

        let fetched = session.get_manifest(&child.identifier()).await?;
        verify_manifest(&child, fetched.digest.as_ref(), &fetched.bytes)?;
        Ok((child, fetched.bytes))
    }
}

/// Check manifest bytes against the reference digest, or the registry's
/// reported digest for tag references.
fn verify_manifest(reference: &Reference, reported: Option<&Digest>, bytes: &[u8]) -> Result<()> {
    match reference.digest().or(reported) {
        Some(expected) => expected.verify(bytes),
        None => Ok(()),
    }
}

fn sniff_media_type(bytes: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    if let Some(mt) = value.get("mediaType").and_then(|v| v.as_str()) {
        return Some(mt.to_string());
    }
    if value.get("manifests").is_some() {
        return Some(super::manifest::OCI_INDEX.to_string());
    }
    None
}
