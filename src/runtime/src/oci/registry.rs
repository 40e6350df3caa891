//! Registry client for the OCI distribution API.
//!
//! [`RegistryClient`] holds the HTTP client, the keychain, and the transport
//! options. It opens [`RegistrySession`]s, one per repository and scope set,
//! which expose the individual manifest and blob calls. Sessions are cheap
//! and short-lived: open one per operation and drop it afterwards.

use std::sync::Arc;

use a3s_rebase_core::config::TransportOptions;
use a3s_rebase_core::error::{OciError, Result};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION};
use reqwest::{Response, StatusCode, Url};

use super::credentials::Keychain;
use super::digest::Digest;
use super::image::BlobStream;
use super::manifest::ACCEPTED_MANIFEST_TYPES;
use super::reference::Repository;
use super::transport::{Transport, TransportError};

/// Header carrying the registry's digest of returned or stored content.
pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

const OCTET_STREAM: &str = "application/octet-stream";

/// Entry point for talking to registries.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    keychain: Arc<dyn Keychain>,
    options: TransportOptions,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("options", &self.options)
            .finish()
    }
}

impl RegistryClient {
    /// Create a client with its own HTTP connection pool.
    pub fn new(keychain: Arc<dyn Keychain>, options: &TransportOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(options.timeout())
            .user_agent(options.user_agent.as_str())
            .build()
            .map_err(|e| OciError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_http_client(http, keychain, options))
    }

    /// Create a client on top of a caller-provided HTTP client.
    pub fn with_http_client(
        http: reqwest::Client,
        keychain: Arc<dyn Keychain>,
        options: &TransportOptions,
    ) -> Self {
        Self {
            http,
            keychain,
            options: options.clone(),
        }
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn keychain(&self) -> &Arc<dyn Keychain> {
        &self.keychain
    }

    /// Open a session scoped to pull from `repository`.
    ///
    /// A registry that cannot be reached is a `ManifestFetchFailed`.
    pub async fn pull_session(&self, repository: &Repository) -> Result<RegistrySession> {
        let scopes = vec![repository.scope("pull")];
        self.open(repository, scopes, |e| {
            e.into_oci(|reason| OciError::ManifestFetchFailed {
                reference: repository.to_string(),
                reason,
            })
        })
        .await
    }

    /// Open a session scoped to push to `repository`.
    ///
    /// `mount_from` lists repositories on the same registry that blobs may
    /// be mounted from; the session also asks for pull on each of them.
    /// A registry that cannot be reached is an `UploadInitiationFailed`.
    pub async fn push_session(
        &self,
        repository: &Repository,
        mount_from: &[Repository],
    ) -> Result<RegistrySession> {
        let mut scopes = vec![repository.scope("push,pull")];
        for source in mount_from {
            let scope = source.scope("pull");
            if source.registry() == repository.registry() && !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        self.open(repository, scopes, |e| {
            let status = e.status().unwrap_or(0);
            e.into_oci(|reason| OciError::UploadInitiationFailed {
                reference: repository.to_string(),
                status,
                reason,
            })
        })
        .await
    }

    async fn open(
        &self,
        repository: &Repository,
        scopes: Vec<String>,
        unreachable: impl FnOnce(TransportError) -> OciError,
    ) -> Result<RegistrySession> {
        let transport = Transport::connect(
            repository,
            self.keychain.clone(),
            scopes,
            self.http.clone(),
            &self.options,
        )
        .await
        .map_err(unreachable)?;
        Ok(RegistrySession {
            transport: Arc::new(transport),
            repository: repository.clone(),
            chunk_size: self.options.chunk_size,
        })
    }
}

/// Manifest bytes as served by the registry.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub bytes: Vec<u8>,
    pub media_type: Option<String>,
    /// `Docker-Content-Digest` reported by the registry, if any.
    pub digest: Option<Digest>,
}

/// Result of a manifest `HEAD`.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestHead {
    pub digest: Option<Digest>,
    pub media_type: Option<String>,
    pub size: Option<u64>,
}

/// Outcome of opening a blob upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSession {
    /// The registry already has the blob (mounted or otherwise)
    Mounted,
    /// Bytes should be sent to this absolute URL
    Pending { location: String },
}

/// One authenticated session against one repository.
#[derive(Clone)]
pub struct RegistrySession {
    transport: Arc<Transport>,
    repository: Repository,
    chunk_size: Option<usize>,
}

impl std::fmt::Debug for RegistrySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrySession")
            .field("repository", &self.repository.to_string())
            .field("transport", &self.transport)
            .finish()
    }
}

impl RegistrySession {
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.transport.api_base(), self.repository.name(), path)
    }

    /// `GET /v2/<repo>/manifests/<identifier>`
    pub async fn get_manifest(&self, identifier: &str) -> Result<FetchedManifest> {
        let reference = self.display(identifier);
        let url = self.url(&format!("manifests/{}", identifier));
        let accept = ACCEPTED_MANIFEST_TYPES.join(", ");
        let response = self
            .transport
            .send(|client| client.get(url.as_str()).header(ACCEPT, accept.as_str()))
            .await
            .map_err(|e| {
                e.into_oci(|reason| OciError::ManifestFetchFailed {
                    reference: reference.clone(),
                    reason,
                })
            })?;

        let status = response.status();
        if !status.is_success() {
            let reason = failure_reason(response).await;
            return Err(match status {
                StatusCode::FORBIDDEN => OciError::PermissionDenied { reference, reason },
                _ => OciError::ManifestFetchFailed { reference, reason },
            });
        }

        let media_type = header_str(&response, CONTENT_TYPE.as_str())
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string());
        let digest = header_digest(&response);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| OciError::ManifestFetchFailed {
                reference: reference.clone(),
                reason: e.to_string(),
            })?
            .to_vec();

        tracing::debug!(reference = %reference, size = bytes.len(), "Fetched manifest");
        Ok(FetchedManifest {
            bytes,
            media_type,
            digest,
        })
    }

    /// `HEAD /v2/<repo>/manifests/<identifier>`. `None` when absent.
    pub async fn head_manifest(&self, identifier: &str) -> Result<Option<ManifestHead>> {
        let reference = self.display(identifier);
        let url = self.url(&format!("manifests/{}", identifier));
        let accept = ACCEPTED_MANIFEST_TYPES.join(", ");
        let response = self
            .transport
            .send(|client| client.head(url.as_str()).header(ACCEPT, accept.as_str()))
            .await
            .map_err(|e| {
                e.into_oci(|reason| OciError::ManifestFetchFailed {
                    reference: reference.clone(),
                    reason,
                })
            })?;

        match response.status() {
            status if status.is_success() => Ok(Some(ManifestHead {
                digest: header_digest(&response),
                media_type: header_str(&response, CONTENT_TYPE.as_str()).map(str::to_string),
                size: header_str(&response, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok()),
            })),
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::FORBIDDEN => Err(OciError::PermissionDenied {
                reference,
                reason: "manifest HEAD forbidden".to_string(),
            }),
            status => Err(OciError::ManifestFetchFailed {
                reference,
                reason: format!("HEAD returned {}", status.as_u16()),
            }),
        }
    }

    /// `HEAD /v2/<repo>/blobs/<digest>`
    pub async fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        let url = self.url(&format!("blobs/{}", digest));
        let response = self
            .transport
            .send(|client| client.head(url.as_str()))
            .await
            .map_err(|e| e.into_oci(|reason| self.blob_failed(digest, reason)))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::FORBIDDEN => Err(OciError::PermissionDenied {
                reference: self.repository.to_string(),
                reason: format!("blob HEAD {} forbidden", digest),
            }),
            status => Err(self.blob_failed(digest, format!("HEAD returned {}", status.as_u16()))),
        }
    }

    /// `GET /v2/<repo>/blobs/<digest>` as an unverified byte stream.
    pub async fn get_blob(&self, digest: &Digest) -> Result<BlobStream> {
        let url = self.url(&format!("blobs/{}", digest));
        let response = self
            .transport
            .send(|client| client.get(url.as_str()))
            .await
            .map_err(|e| e.into_oci(|reason| self.blob_failed(digest, reason)))?;

        let status = response.status();
        if !status.is_success() {
            let reason = failure_reason(response).await;
            return Err(match status {
                StatusCode::FORBIDDEN => OciError::PermissionDenied {
                    reference: self.repository.to_string(),
                    reason,
                },
                _ => self.blob_failed(digest, reason),
            });
        }

        let digest = digest.to_string();
        let stream = response.bytes_stream().map(move |chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| OciError::BlobTransferFailed {
                    digest: digest.clone(),
                    reason: e.to_string(),
                })
        });
        Ok(stream.boxed())
    }

    /// `POST /v2/<repo>/blobs/uploads/`, optionally asking to mount
    /// `digest` from another repository on the same registry.
    pub async fn initiate_upload(
        &self,
        mount: Option<(&Digest, &Repository)>,
    ) -> Result<UploadSession> {
        let reference = self.repository.to_string();
        let url = self.url("blobs/uploads/");
        let query: Vec<(&str, String)> = match mount {
            Some((digest, from)) => vec![
                ("mount", digest.to_string()),
                ("from", from.name().to_string()),
            ],
            None => Vec::new(),
        };
        let response = self
            .transport
            .send(|client| {
                client
                    .post(url.as_str())
                    .query(&query)
                    .header(CONTENT_LENGTH, "0")
            })
            .await
            .map_err(|e| {
                e.into_oci(|reason| OciError::UploadInitiationFailed {
                    reference: reference.clone(),
                    status: 0,
                    reason,
                })
            })?;

        match response.status() {
            StatusCode::CREATED => Ok(UploadSession::Mounted),
            StatusCode::ACCEPTED => {
                let location = self.location_of(&response).ok_or_else(|| {
                    OciError::UploadInitiationFailed {
                        reference: reference.clone(),
                        status: 202,
                        reason: "missing Location header".to_string(),
                    }
                })?;
                Ok(UploadSession::Pending {
                    location: location.to_string(),
                })
            }
            StatusCode::FORBIDDEN => Err(OciError::PermissionDenied {
                reference,
                reason: failure_reason(response).await,
            }),
            status => Err(OciError::UploadInitiationFailed {
                reference,
                status: status.as_u16(),
                reason: failure_reason(response).await,
            }),
        }
    }

    /// Send a whole blob with a single `PUT <location>?digest=`.
    pub async fn put_blob_monolithic(&self, location: &str, digest: &Digest, data: Bytes) -> Result<()> {
        let url = self.completion_url(location, digest)?;
        let response = self
            .transport
            .send(|client| {
                client
                    .put(url.as_str())
                    .header(CONTENT_TYPE, OCTET_STREAM)
                    .body(data.clone())
            })
            .await
            .map_err(|e| e.into_oci(|reason| self.blob_failed(digest, reason)))?;
        self.check_committed(response, digest).await
    }

    /// `PATCH` one chunk starting at `offset`. Returns the next location.
    pub async fn put_blob_chunk(
        &self,
        location: &str,
        digest: &Digest,
        offset: usize,
        chunk: Bytes,
    ) -> Result<String> {
        let range = format!("{}-{}", offset, offset + chunk.len().saturating_sub(1));
        let response = self
            .transport
            .send(|client| {
                client
                    .patch(location)
                    .header(CONTENT_TYPE, OCTET_STREAM)
                    .header(CONTENT_RANGE, range.as_str())
                    .body(chunk.clone())
            })
            .await
            .map_err(|e| e.into_oci(|reason| self.blob_failed(digest, reason)))?;

        match response.status() {
            StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(self
                .location_of(&response)
                .map(|u| u.to_string())
                .unwrap_or_else(|| location.to_string())),
            StatusCode::FORBIDDEN => Err(OciError::PermissionDenied {
                reference: self.repository.to_string(),
                reason: failure_reason(response).await,
            }),
            status => Err(self.blob_failed(
                digest,
                format!("chunk upload returned {}: {}", status.as_u16(), failure_reason(response).await),
            )),
        }
    }

    /// Close a chunked upload with an empty `PUT <location>?digest=`.
    pub async fn finish_upload(&self, location: &str, digest: &Digest) -> Result<()> {
        let url = self.completion_url(location, digest)?;
        let response = self
            .transport
            .send(|client| client.put(url.as_str()).header(CONTENT_LENGTH, "0"))
            .await
            .map_err(|e| e.into_oci(|reason| self.blob_failed(digest, reason)))?;
        self.check_committed(response, digest).await
    }

    /// Upload `data` to an open session, chunked when a chunk size is
    /// configured and the blob is larger than one chunk.
    ///
    /// Chunks are slices of `data`; retries and replays never copy the blob.
    pub async fn upload_blob(&self, location: &str, digest: &Digest, data: Bytes) -> Result<()> {
        match self.chunk_size {
            Some(size) if size > 0 && data.len() > size => {
                let mut location = location.to_string();
                for offset in (0..data.len()).step_by(size) {
                    let chunk = data.slice(offset..(offset + size).min(data.len()));
                    location = self.put_blob_chunk(&location, digest, offset, chunk).await?;
                }
                self.finish_upload(&location, digest).await
            }
            _ => self.put_blob_monolithic(location, digest, data).await,
        }
    }

    /// `PUT /v2/<repo>/manifests/<identifier>`.
    ///
    /// `expected` is the digest of `bytes`; a different
    /// `Docker-Content-Digest` in the response is a `DigestMismatch`.
    pub async fn put_manifest(
        &self,
        identifier: &str,
        bytes: &[u8],
        media_type: &str,
        expected: &Digest,
    ) -> Result<Digest> {
        let reference = self.display(identifier);
        let url = self.url(&format!("manifests/{}", identifier));
        let response = self
            .transport
            .send(|client| {
                client
                    .put(url.as_str())
                    .header(CONTENT_TYPE, media_type)
                    .body(bytes.to_vec())
            })
            .await
            .map_err(|e| {
                e.into_oci(|reason| OciError::ManifestSubmissionFailed {
                    reference: reference.clone(),
                    reason,
                })
            })?;

        let status = response.status();
        if !status.is_success() {
            let reason = failure_reason(response).await;
            return Err(match status {
                StatusCode::FORBIDDEN => OciError::PermissionDenied { reference, reason },
                _ => OciError::ManifestSubmissionFailed {
                    reference,
                    reason: format!("{}: {}", status.as_u16(), reason),
                },
            });
        }

        if let Some(actual) = header_digest(&response) {
            if &actual != expected {
                return Err(OciError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(expected.clone())
    }

    async fn check_committed(&self, response: Response, digest: &Digest) -> Result<()> {
        let status = response.status();
        if !status.is_success() {
            let reason = failure_reason(response).await;
            return Err(match status {
                StatusCode::FORBIDDEN => OciError::PermissionDenied {
                    reference: self.repository.to_string(),
                    reason,
                },
                _ => self.blob_failed(digest, format!("commit returned {}: {}", status.as_u16(), reason)),
            });
        }
        if let Some(actual) = header_digest(&response) {
            if &actual != digest {
                return Err(OciError::DigestMismatch {
                    expected: digest.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(())
    }

    /// `location` with `digest=` appended, keeping any existing query.
    fn completion_url(&self, location: &str, digest: &Digest) -> Result<Url> {
        let mut url = Url::parse(location)
            .map_err(|e| self.blob_failed(digest, format!("invalid upload location '{}': {}", location, e)))?;
        url.query_pairs_mut().append_pair("digest", &digest.to_string());
        Ok(url)
    }

    /// The `Location` header resolved against the API base.
    fn location_of(&self, response: &Response) -> Option<Url> {
        let location = header_str(response, LOCATION.as_str())?;
        let base = Url::parse(self.transport.api_base()).ok()?;
        base.join(location).ok()
    }

    fn display(&self, identifier: &str) -> String {
        if identifier.contains(':') {
            format!("{}@{}", self.repository, identifier)
        } else {
            format!("{}:{}", self.repository, identifier)
        }
    }

    fn blob_failed(&self, digest: &Digest, reason: String) -> OciError {
        OciError::BlobTransferFailed {
            digest: digest.to_string(),
            reason,
        }
    }
}

fn header_str<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn header_digest(response: &Response) -> Option<Digest> {
    header_str(response, DOCKER_CONTENT_DIGEST).and_then(|v| Digest::parse(v.trim()).ok())
}

/// Status line plus the registry's error body, for error messages.
async fn failure_reason(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    if body.is_empty() {
        format!("status {}", status.as_u16())
    } else {
        format!("status {}: {}", status.as_u16(), body)
    }
}
