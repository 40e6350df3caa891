//! OCI image reference parsing.
//!
//! Parses image references like `ghcr.io/a3s-box/code:v0.1.0` into a
//! [`Reference`]: either a tag or a digest within a [`Repository`].

use std::fmt;

use a3s_rebase_core::config::NameOptions;
use a3s_rebase_core::error::{OciError, Result};

use super::digest::Digest;

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Docker Hub's canonical registry name.
const DOCKER_HUB: &str = "index.docker.io";

/// Host actually serving the Docker Hub distribution API.
const DOCKER_HUB_API: &str = "registry-1.docker.io";

const MAX_REPOSITORY_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;

/// Bare repository coordinate: registry plus repository path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repository {
    registry: String,
    repository: String,
    insecure: bool,
}

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// Mutable pointer, e.g. `ghcr.io/org/app:v1`
    Tag { repository: Repository, tag: String },
    /// Immutable pointer, e.g. `ghcr.io/org/app@sha256:...`
    Digest {
        repository: Repository,
        digest: Digest,
    },
}

impl Repository {
    /// Build a repository coordinate, applying the registry and namespace
    /// defaults.
    pub fn new(registry: &str, repository: &str, opts: &NameOptions) -> Result<Self> {
        let registry = normalize_registry(registry);
        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository.to_string()
        };
        validate_repository(&repository).map_err(|reason| OciError::MalformedReference {
            reference: format!("{}/{}", registry, repository),
            reason,
        })?;
        Ok(Self {
            registry,
            repository,
            insecure: opts.insecure,
        })
    }

    /// Registry hostname (e.g., "ghcr.io", "index.docker.io")
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path (e.g., "library/nginx", "a3s-box/code")
    pub fn name(&self) -> &str {
        &self.repository
    }

    /// Sibling reference by tag.
    pub fn tag(&self, tag: &str) -> Result<Reference> {
        validate_tag(tag).map_err(|reason| OciError::MalformedReference {
            reference: format!("{}:{}", self, tag),
            reason,
        })?;
        Ok(Reference::Tag {
            repository: self.clone(),
            tag: tag.to_string(),
        })
    }

    /// Sibling reference by digest.
    pub fn digest(&self, digest: Digest) -> Reference {
        Reference::Digest {
            repository: self.clone(),
            digest,
        }
    }

    /// Token scope for `action` (e.g., "pull", "push,pull").
    pub fn scope(&self, action: &str) -> String {
        format!("repository:{}:{}", self.repository, action)
    }

    /// URL scheme used to reach the registry.
    pub fn scheme(&self) -> &'static str {
        if self.insecure || is_local_registry(&self.registry) {
            "http"
        } else {
            "https"
        }
    }

    /// Host serving the distribution API for this registry.
    pub fn api_host(&self) -> &str {
        if self.registry == DOCKER_HUB {
            DOCKER_HUB_API
        } else {
            &self.registry
        }
    }

    /// Base URL of the distribution API, without trailing slash.
    pub fn api_base(&self) -> String {
        format!("{}://{}/v2", self.scheme(), self.api_host())
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

impl Reference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → index.docker.io/library/nginx:latest
    /// - `nginx:1.25` → index.docker.io/library/nginx:1.25
    /// - `myuser/myimage` → index.docker.io/myuser/myimage:latest
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    ///
    /// A reference carrying both a tag and a digest resolves to the digest.
    pub fn parse(reference: &str, opts: &NameOptions) -> Result<Self> {
        let reference = reference.trim();
        let malformed = |reason: &str| OciError::MalformedReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };
        if reference.is_empty() {
            return Err(malformed("empty reference"));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let digest = Digest::parse(digest)
                    .map_err(|_| malformed("invalid digest, expected algorithm:hex"))?;
                (name, Some(digest))
            }
            None => (reference, None),
        };

        // Split tag on the last colon after the last slash; a colon before
        // any slash belongs to a registry port.
        let last_segment_start = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let colon = last_segment_start + colon;
                (&name_tag[..colon], Some(&name_tag[colon + 1..]))
            }
            None => (name_tag, None),
        };

        let (registry, repository) = split_registry_repository(name, &opts.default_registry);
        if repository.is_empty() {
            return Err(malformed("empty repository"));
        }
        let repository = Repository::new(&registry, repository, opts)
            .map_err(|_| malformed("repository must be lowercase alphanumerics separated by '.', '_', '__' or '-'"))?;

        if let Some(digest) = digest {
            return Ok(repository.digest(digest));
        }
        let tag = tag.unwrap_or(DEFAULT_TAG);
        validate_tag(tag).map_err(|reason| malformed(&reason))?;
        Ok(Reference::Tag {
            repository,
            tag: tag.to_string(),
        })
    }

    /// Bare repository coordinate (no tag or digest).
    pub fn context(&self) -> &Repository {
        match self {
            Reference::Tag { repository, .. } | Reference::Digest { repository, .. } => repository,
        }
    }

    /// Tag or digest string, as used in manifest URLs.
    pub fn identifier(&self) -> String {
        match self {
            Reference::Tag { tag, .. } => tag.clone(),
            Reference::Digest { digest, .. } => digest.to_string(),
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match self {
            Reference::Digest { digest, .. } => Some(digest),
            Reference::Tag { .. } => None,
        }
    }

    pub fn is_digest(&self) -> bool {
        matches!(self, Reference::Digest { .. })
    }

    /// Token scope for `action` on this reference's repository.
    pub fn scope(&self, action: &str) -> String {
        self.context().scope(action)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag { repository, tag } => write!(f, "{}:{}", repository, tag),
            Reference::Digest { repository, digest } => write!(f, "{}@{}", repository, digest),
        }
    }
}

/// Split a name into registry and repository components.
///
/// The first component is a registry hostname when it contains a dot or
/// colon, or is "localhost".
fn split_registry_repository<'a>(name: &'a str, default_registry: &str) -> (String, &'a str) {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first.to_string(), rest);
        }
    }
    (default_registry.to_string(), name)
}

/// Normalize Docker Hub aliases to `index.docker.io`.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        DOCKER_HUB.to_string()
    } else {
        r
    }
}

fn is_local_registry(registry: &str) -> bool {
    let host = if registry.starts_with('[') {
        registry.split(']').next().map(|h| format!("{}]", h)).unwrap_or_default()
    } else {
        registry.split(':').next().unwrap_or_default().to_string()
    };
    host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host.ends_with(".local")
}

fn validate_repository(repository: &str) -> std::result::Result<(), String> {
    if repository.is_empty() {
        return Err("empty repository".to_string());
    }
    if repository.len() > MAX_REPOSITORY_LEN {
        return Err(format!("repository longer than {} characters", MAX_REPOSITORY_LEN));
    }
    for component in repository.split('/') {
        if !is_valid_component(component) {
            return Err(format!("invalid repository component '{}'", component));
        }
    }
    Ok(())
}

/// `[a-z0-9]+` runs joined by `.`, `_`, `__`, or one or more `-`.
fn is_valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if bytes.is_empty() || !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(bytes[i]) {
            i += 1;
        }
        let sep = &component[start..i];
        let ok = sep == "." || sep == "_" || sep == "__" || sep.bytes().all(|b| b == b'-');
        if !ok {
            return false;
        }
    }
    true
}

fn validate_tag(tag: &str) -> std::result::Result<(), String> {
    let bytes = tag.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_TAG_LEN {
        return Err(format!("tag must be 1-{} characters", MAX_TAG_LEN));
    }
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    if !word(bytes[0]) || !bytes.iter().all(|&b| word(b) || b == b'.' || b == b'-') {
        return Err(format!("invalid tag '{}'", tag));
    }
    Ok(())
}
