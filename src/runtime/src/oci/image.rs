//! The image capability.
//!
//! An [`Image`] exposes its manifest, config, layers, and digest. Two
//! implementations exist: [`RemoteImage`](super::pull::RemoteImage), backed
//! by bytes fetched from a registry, and [`ComposedImage`], assembled in
//! memory by the rebase engine. Both parse lazily and cache, so callers
//! cannot tell them apart.
//!
//! Every blob read through this module is hashed as it streams in and
//! released only when the hash matches the descriptor it was requested by.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use a3s_rebase_core::error::{OciError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use super::digest::{Digest, DigestVerifier};
use super::manifest::{ConfigFile, Descriptor, Manifest};
use super::reference::Repository;

/// Upper bound on buffer space reserved up front from a descriptor's size.
const PREALLOCATE_LIMIT: u64 = 64 * 1024 * 1024;

/// Raw, unverified blob bytes as they arrive.
pub type BlobStream = BoxStream<'static, Result<Vec<u8>>>;

/// Somewhere blob bytes can be read from.
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Open a stream over the blob `descriptor` names. The bytes are not
    /// trusted; [`fetch_verified`] checks them.
    async fn open(&self, descriptor: &Descriptor) -> Result<BlobStream>;

    /// Repository holding the blob, when it lives in a registry.
    fn repository(&self) -> Option<&Repository> {
        None
    }
}

/// Read a blob and check it against its descriptor's digest.
///
/// On mismatch the bytes are dropped and `DigestMismatch` is returned.
pub async fn fetch_verified(source: &dyn BlobSource, descriptor: &Descriptor) -> Result<Vec<u8>> {
    let mut stream = source.open(descriptor).await?;
    let mut verifier = DigestVerifier::new(descriptor.digest.clone());
    let mut data = Vec::with_capacity(descriptor.size.min(PREALLOCATE_LIMIT) as usize);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        verifier.update(&chunk);
        data.extend_from_slice(&chunk);
    }
    verifier.finish()?;
    Ok(data)
}

/// Blobs held in memory, keyed by digest.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    blobs: HashMap<Digest, Arc<Vec<u8>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blob and return its SHA-256 digest.
    pub fn insert(&mut self, data: Vec<u8>) -> Digest {
        let digest = Digest::sha256_of(&data);
        self.blobs.insert(digest.clone(), Arc::new(data));
        digest
    }

    /// Add bytes under an arbitrary digest, whether or not they match.
    pub fn insert_as(&mut self, digest: Digest, data: Vec<u8>) {
        self.blobs.insert(digest, Arc::new(data));
    }
}

#[async_trait]
impl BlobSource for MemorySource {
    async fn open(&self, descriptor: &Descriptor) -> Result<BlobStream> {
        let data = self
            .blobs
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| OciError::BlobTransferFailed {
                digest: descriptor.digest.to_string(),
                reason: "blob not found".to_string(),
            })?;
        Ok(stream::once(async move { Ok::<_, OciError>(data.as_ref().clone()) }).boxed())
    }
}

/// A content-addressed layer: compressed blob plus uncompressed diff ID.
#[derive(Clone)]
pub struct Layer {
    descriptor: Descriptor,
    diff_id: Digest,
    source: Arc<dyn BlobSource>,
}

impl Layer {
    pub fn new(descriptor: Descriptor, diff_id: Digest, source: Arc<dyn BlobSource>) -> Self {
        Self {
            descriptor,
            diff_id,
            source,
        }
    }

    /// Digest of the compressed blob, as stored and transferred.
    pub fn digest(&self) -> &Digest {
        &self.descriptor.digest
    }

    /// Digest of the uncompressed content, as recorded in the config.
    pub fn diff_id(&self) -> &Digest {
        &self.diff_id
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    /// Repository the compressed blob can be mounted from.
    pub fn source_repository(&self) -> Option<&Repository> {
        self.source.repository()
    }

    /// Compressed bytes, verified against the layer digest.
    pub async fn compressed(&self) -> Result<Vec<u8>> {
        fetch_verified(self.source.as_ref(), &self.descriptor).await
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("digest", &self.descriptor.digest.to_string())
            .field("diff_id", &self.diff_id.to_string())
            .field("size", &self.descriptor.size)
            .finish()
    }
}

/// An image: manifest, config, ordered layers, and the digest of its manifest.
#[async_trait]
pub trait Image: Send + Sync {
    /// Exact manifest bytes; the image digest is taken over these.
    fn raw_manifest(&self) -> Result<Arc<Vec<u8>>>;

    /// Parsed manifest, cached after the first call.
    fn manifest(&self) -> Result<Arc<Manifest>>;

    /// Digest of the manifest bytes.
    fn digest(&self) -> Result<Digest> {
        Ok(Digest::sha256_of(&self.raw_manifest()?))
    }

    /// Exact config bytes, verified against the manifest's config digest.
    async fn raw_config_file(&self) -> Result<Arc<Vec<u8>>>;

    /// Parsed config, cached after the first call.
    async fn config_file(&self) -> Result<Arc<ConfigFile>>;

    /// Layers bottom to top, each paired with its diff ID.
    async fn layers(&self) -> Result<Vec<Layer>>;
}

/// Pair manifest layer descriptors with config diff IDs.
pub(crate) fn zip_layers(
    manifest: &Manifest,
    config: &ConfigFile,
    source: Arc<dyn BlobSource>,
) -> Result<Vec<Layer>> {
    config.check_layers(manifest.layers.len())?;
    Ok(manifest
        .layers
        .iter()
        .zip(config.rootfs.diff_ids.iter())
        .map(|(desc, diff_id)| Layer::new(desc.clone(), diff_id.clone(), source.clone()))
        .collect())
}

/// Manifest fields a composed image inherits from the image it derives from.
#[derive(Debug, Clone, Default)]
pub struct ManifestTemplate {
    pub media_type: Option<String>,
    pub config_media_type: String,
    pub annotations: BTreeMap<String, String>,
}

impl ManifestTemplate {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            media_type: manifest.media_type.clone(),
            config_media_type: manifest.config.media_type.clone(),
            annotations: manifest.annotations.clone().unwrap_or_default(),
        }
    }
}

/// An image assembled in memory from a config and existing layers.
///
/// The config bytes are fixed at construction; the manifest and digest are
/// computed on first use.
pub struct ComposedImage {
    template: ManifestTemplate,
    config: Arc<ConfigFile>,
    raw_config: Arc<Vec<u8>>,
    layers: Vec<Layer>,
    raw_manifest: OnceLock<Arc<Vec<u8>>>,
    manifest: OnceLock<Arc<Manifest>>,
}

impl ComposedImage {
    pub fn new(template: ManifestTemplate, config: ConfigFile, layers: Vec<Layer>) -> Result<Self> {
        config.check_layers(layers.len())?;
        let raw_config = config.to_bytes()?;
        Ok(Self {
            template,
            config: Arc::new(config),
            raw_config: Arc::new(raw_config),
            layers,
            raw_manifest: OnceLock::new(),
            manifest: OnceLock::new(),
        })
    }

    /// Copy of this image with `annotations` merged over the existing ones.
    pub fn with_annotations(&self, annotations: BTreeMap<String, String>) -> Self {
        let mut template = self.template.clone();
        template.annotations.extend(annotations);
        Self {
            template,
            config: self.config.clone(),
            raw_config: self.raw_config.clone(),
            layers: self.layers.clone(),
            raw_manifest: OnceLock::new(),
            manifest: OnceLock::new(),
        }
    }

    fn build_manifest(&self) -> Manifest {
        let config = Descriptor::for_bytes(&self.template.config_media_type, &self.raw_config);
        Manifest {
            schema_version: 2,
            media_type: self.template.media_type.clone(),
            config,
            layers: self.layers.iter().map(|l| l.descriptor().clone()).collect(),
            annotations: if self.template.annotations.is_empty() {
                None
            } else {
                Some(self.template.annotations.clone())
            },
            extra: serde_json::Map::new(),
        }
    }
}

impl fmt::Debug for ComposedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedImage")
            .field("config_digest", &Digest::sha256_of(&self.raw_config).to_string())
            .field("layers", &self.layers)
            .field("annotations", &self.template.annotations)
            .finish()
    }
}

#[async_trait]
impl Image for ComposedImage {
    fn raw_manifest(&self) -> Result<Arc<Vec<u8>>> {
        if let Some(raw) = self.raw_manifest.get() {
            return Ok(raw.clone());
        }
        let raw = Arc::new(self.manifest()?.to_bytes()?);
        Ok(self.raw_manifest.get_or_init(|| raw).clone())
    }

    fn manifest(&self) -> Result<Arc<Manifest>> {
        Ok(self
            .manifest
            .get_or_init(|| Arc::new(self.build_manifest()))
            .clone())
    }

    async fn raw_config_file(&self) -> Result<Arc<Vec<u8>>> {
        Ok(self.raw_config.clone())
    }

    async fn config_file(&self) -> Result<Arc<ConfigFile>> {
        Ok(self.config.clone())
    }

    async fn layers(&self) -> Result<Vec<Layer>> {
        Ok(self.layers.clone())
    }
}
