//! In-process fake registry for integration tests.
//!
//! Speaks enough of the distribution API for the client: bearer or basic
//! challenge and token endpoint, blob HEAD/GET, upload sessions (monolithic,
//! chunked, cross-repository mount), and manifest GET/HEAD/PUT. Switches
//! inject server errors and token expiry.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use a3s_rebase_core::config::{NameOptions, Options, RetryPolicy};
use a3s_rebase_runtime::oci::manifest::{
    ConfigFile, Descriptor, History, Manifest, RootFs, OCI_CONFIG, OCI_MANIFEST,
};
use a3s_rebase_runtime::oci::{AnonymousKeychain, Keychain};
use a3s_rebase_runtime::{Digest, Reference, RegistryClient};
use base64::Engine;
use parking_lot::Mutex;
use wiremock::matchers::path_regex;
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub const TOKEN: &str = "test-token";
pub const LAYER_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

#[derive(Default)]
struct State {
    blobs: HashMap<(String, String), Vec<u8>>,
    manifests: HashMap<(String, String), (Vec<u8>, String)>,
    uploads: HashMap<String, (String, Vec<u8>)>,
    next_upload: usize,
    token_scopes: Vec<Vec<String>>,
    tampered: HashSet<String>,
    deny_push: bool,
    deny_tokens: bool,
    forbid_ping: bool,
    /// Expected `Authorization` header when only Basic auth is accepted
    basic: Option<String>,
    fail_requests: usize,
    fail_uploads: usize,
    expire_tokens: usize,
    requests: usize,
    upload_sessions: usize,
    blob_uploads: usize,
    chunks: usize,
    mounts: usize,
    manifest_puts: usize,
}

/// A fake registry listening on `127.0.0.1`.
pub struct FakeRegistry {
    pub server: MockServer,
    state: Arc<Mutex<State>>,
}

impl FakeRegistry {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let state = Arc::new(Mutex::new(State::default()));

        let realm = format!("{}/token", server.uri());
        let shared = state.clone();
        Mock::given(path_regex("^/"))
            .respond_with(move |req: &Request| handle(&shared, &realm, req))
            .mount(&server)
            .await;

        Self { server, state }
    }

    /// `127.0.0.1:<port>`
    pub fn host(&self) -> String {
        self.server.uri().trim_start_matches("http://").to_string()
    }

    pub fn reference(&self, path: &str) -> Reference {
        Reference::parse(&format!("{}/{}", self.host(), path), &NameOptions::default()).unwrap()
    }

    pub fn options(&self) -> Options {
        let mut options = Options::default();
        options.transport.retry = RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        };
        options.transport.platform = Some("linux/amd64".to_string());
        options
    }

    pub fn client(&self) -> RegistryClient {
        self.client_with(&self.options(), Arc::new(AnonymousKeychain))
    }

    pub fn client_with(&self, options: &Options, keychain: Arc<dyn Keychain>) -> RegistryClient {
        RegistryClient::new(keychain, &options.transport).unwrap()
    }

    /// Store `image` in `repo` under `tag` and under its digest.
    pub fn seed(&self, repo: &str, tag: &str, image: &TestImage) {
        let mut state = self.state.lock();
        for (digest, data) in &image.blobs {
            state
                .blobs
                .insert((repo.to_string(), digest.to_string()), data.clone());
        }
        let entry = (image.manifest.clone(), OCI_MANIFEST.to_string());
        state
            .manifests
            .insert((repo.to_string(), tag.to_string()), entry.clone());
        state
            .manifests
            .insert((repo.to_string(), image.digest.to_string()), entry);
    }

    pub fn deny_push(&self) {
        self.state.lock().deny_push = true;
    }

    pub fn deny_tokens(&self) {
        self.state.lock().deny_tokens = true;
    }

    /// Answer `/v2/` with 403.
    pub fn forbid_ping(&self) {
        self.state.lock().forbid_ping = true;
    }

    /// Challenge with `Basic` and accept only these credentials.
    pub fn require_basic(&self, username: &str, password: &str) {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
        self.state.lock().basic = Some(format!("Basic {}", encoded));
    }

    /// Answer the next `n` registry requests with 503.
    pub fn fail_requests(&self, n: usize) {
        self.state.lock().fail_requests = n;
    }

    /// Answer the next `n` upload-completing `PUT`s with 503.
    pub fn fail_uploads(&self, n: usize) {
        self.state.lock().fail_uploads = n;
    }

    /// Reject the next `n` authorized requests outside `/v2/` with a fresh
    /// challenge, as if the token had expired.
    pub fn expire_tokens(&self, n: usize) {
        self.state.lock().expire_tokens = n;
    }

    /// Serve corrupted bytes for `digest`.
    pub fn tamper(&self, digest: &Digest) {
        self.state.lock().tampered.insert(digest.to_string());
    }

    pub fn manifest(&self, repo: &str, reference: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .manifests
            .get(&(repo.to_string(), reference.to_string()))
            .map(|(bytes, _)| bytes.clone())
    }

    pub fn has_blob(&self, repo: &str, digest: &Digest) -> bool {
        self.state
            .lock()
            .blobs
            .contains_key(&(repo.to_string(), digest.to_string()))
    }

    pub fn token_scopes(&self) -> Vec<Vec<String>> {
        self.state.lock().token_scopes.clone()
    }

    /// Requests seen outside the token endpoint.
    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }

    pub fn upload_sessions(&self) -> usize {
        self.state.lock().upload_sessions
    }

    pub fn blob_uploads(&self) -> usize {
        self.state.lock().blob_uploads
    }

    pub fn chunks(&self) -> usize {
        self.state.lock().chunks
    }

    pub fn mounts(&self) -> usize {
        self.state.lock().mounts
    }

    pub fn manifest_puts(&self) -> usize {
        self.state.lock().manifest_puts
    }
}

fn challenge(realm: &str) -> ResponseTemplate {
    ResponseTemplate::new(401).insert_header(
        "WWW-Authenticate",
        format!(r#"Bearer realm="{}",service="fake-registry""#, realm).as_str(),
    )
}

fn handle(state: &Mutex<State>, realm: &str, req: &Request) -> ResponseTemplate {
    let path = req.url.path().to_string();
    let method = req.method.as_str().to_string();

    if path == "/token" {
        let mut state = state.lock();
        if state.deny_tokens {
            return ResponseTemplate::new(401);
        }
        let scopes: Vec<String> = req
            .url
            .query_pairs()
            .filter(|(k, _)| k == "scope")
            .map(|(_, v)| v.into_owned())
            .collect();
        state.token_scopes.push(scopes);
        return ResponseTemplate::new(200).set_body_json(serde_json::json!({ "token": TOKEN }));
    }

    {
        let mut state = state.lock();
        state.requests += 1;
        if state.fail_requests > 0 {
            state.fail_requests -= 1;
            return ResponseTemplate::new(503);
        }
        if state.forbid_ping && path == "/v2/" {
            return ResponseTemplate::new(403);
        }

        let expected = state
            .basic
            .clone()
            .unwrap_or_else(|| format!("Bearer {}", TOKEN));
        let rechallenge = |basic: bool| {
            if basic {
                ResponseTemplate::new(401)
                    .insert_header("WWW-Authenticate", r#"Basic realm="fake-registry""#)
            } else {
                challenge(realm)
            }
        };
        let authorized = req
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v == expected);
        if !authorized {
            return rechallenge(state.basic.is_some());
        }
        if path == "/v2/" {
            return ResponseTemplate::new(200);
        }
        if state.expire_tokens > 0 {
            state.expire_tokens -= 1;
            return rechallenge(state.basic.is_some());
        }
    }

    let Some(rest) = path.strip_prefix("/v2/") else {
        return ResponseTemplate::new(404);
    };

    if let Some(idx) = rest.find("/blobs/uploads") {
        let repo = &rest[..idx];
        let session = rest[idx + "/blobs/uploads".len()..].trim_start_matches('/');
        return handle_upload(state, repo, session, &method, req);
    }
    if let Some(idx) = rest.rfind("/blobs/") {
        let repo = &rest[..idx];
        let digest = &rest[idx + "/blobs/".len()..];
        return handle_blob(state, repo, digest, &method);
    }
    if let Some(idx) = rest.rfind("/manifests/") {
        let repo = &rest[..idx];
        let reference = &rest[idx + "/manifests/".len()..];
        return handle_manifest(state, repo, reference, &method, req);
    }
    ResponseTemplate::new(404)
}

fn handle_blob(state: &Mutex<State>, repo: &str, digest: &str, method: &str) -> ResponseTemplate {
    let state = state.lock();
    let Some(data) = state.blobs.get(&(repo.to_string(), digest.to_string())) else {
        return ResponseTemplate::new(404);
    };
    let response = ResponseTemplate::new(200).insert_header("Docker-Content-Digest", digest);
    match method {
        "HEAD" => response,
        _ => {
            let mut body = data.clone();
            if state.tampered.contains(digest) {
                body.push(b'!');
            }
            response.set_body_bytes(body)
        }
    }
}

fn handle_upload(
    state: &Mutex<State>,
    repo: &str,
    session: &str,
    method: &str,
    req: &Request,
) -> ResponseTemplate {
    let mut state = state.lock();
    match method {
        "POST" => {
            if state.deny_push {
                return ResponseTemplate::new(403);
            }
            let query: HashMap<String, String> = req.url.query_pairs().into_owned().collect();
            if let (Some(digest), Some(from)) = (query.get("mount"), query.get("from")) {
                if let Some(data) = state.blobs.get(&(from.clone(), digest.clone())).cloned() {
                    state.blobs.insert((repo.to_string(), digest.clone()), data);
                    state.mounts += 1;
                    return ResponseTemplate::new(201).insert_header("Docker-Content-Digest", digest.as_str());
                }
            }
            state.next_upload += 1;
            state.upload_sessions += 1;
            let id = format!("upload-{}", state.next_upload);
            state.uploads.insert(id.clone(), (repo.to_string(), Vec::new()));
            ResponseTemplate::new(202)
                .insert_header("Location", format!("/v2/{}/blobs/uploads/{}", repo, id).as_str())
        }
        "PATCH" => {
            let Some((_, buffer)) = state.uploads.get_mut(session) else {
                return ResponseTemplate::new(404);
            };
            buffer.extend_from_slice(&req.body);
            state.chunks += 1;
            ResponseTemplate::new(202)
                .insert_header("Location", format!("/v2/{}/blobs/uploads/{}", repo, session).as_str())
        }
        "PUT" => {
            if state.fail_uploads > 0 {
                state.fail_uploads -= 1;
                return ResponseTemplate::new(503);
            }
            let Some((upload_repo, mut buffer)) = state.uploads.remove(session) else {
                return ResponseTemplate::new(404);
            };
            buffer.extend_from_slice(&req.body);
            let expected = req
                .url
                .query_pairs()
                .find(|(k, _)| k == "digest")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            let actual = Digest::sha256_of(&buffer).to_string();
            if actual != expected {
                return ResponseTemplate::new(400).set_body_string("DIGEST_INVALID");
            }
            state.blobs.insert((upload_repo, actual.clone()), buffer);
            state.blob_uploads += 1;
            ResponseTemplate::new(201).insert_header("Docker-Content-Digest", actual.as_str())
        }
        _ => ResponseTemplate::new(405),
    }
}

fn handle_manifest(
    state: &Mutex<State>,
    repo: &str,
    reference: &str,
    method: &str,
    req: &Request,
) -> ResponseTemplate {
    let mut state = state.lock();
    match method {
        "PUT" => {
            if state.deny_push {
                return ResponseTemplate::new(403);
            }
            let media_type = req
                .headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or(OCI_MANIFEST)
                .to_string();
            let digest = Digest::sha256_of(&req.body).to_string();
            let entry = (req.body.clone(), media_type);
            state
                .manifests
                .insert((repo.to_string(), reference.to_string()), entry.clone());
            state.manifests.insert((repo.to_string(), digest.clone()), entry);
            state.manifest_puts += 1;
            ResponseTemplate::new(201).insert_header("Docker-Content-Digest", digest.as_str())
        }
        "GET" | "HEAD" => {
            let Some((bytes, media_type)) = state
                .manifests
                .get(&(repo.to_string(), reference.to_string()))
                .cloned()
            else {
                return ResponseTemplate::new(404);
            };
            let digest = Digest::sha256_of(&bytes).to_string();
            let response = ResponseTemplate::new(200).insert_header("Docker-Content-Digest", digest.as_str());
            if method == "HEAD" {
                response.insert_header("Content-Type", media_type.as_str())
            } else {
                response.set_body_raw(bytes, &media_type)
            }
        }
        _ => ResponseTemplate::new(405),
    }
}

/// An image ready to be seeded into the fake registry.
pub struct TestImage {
    pub manifest: Vec<u8>,
    pub digest: Digest,
    pub config: Vec<u8>,
    pub layer_digests: Vec<Digest>,
    pub diff_ids: Vec<Digest>,
    blobs: Vec<(Digest, Vec<u8>)>,
}

pub fn layer_bytes(name: &str) -> Vec<u8> {
    format!("layer:{}", name).into_bytes()
}

pub fn diff_id(name: &str) -> Digest {
    Digest::sha256_of(format!("diff:{}", name).as_bytes())
}

pub fn step(created_by: &str) -> History {
    History {
        created_by: Some(created_by.to_string()),
        ..History::default()
    }
}

/// Build an amd64 image whose layers are named `layers`, bottom first.
pub fn build_image(layers: &[&str], history: Vec<History>, annotations: &[(&str, &str)]) -> TestImage {
    let mut blobs = Vec::new();
    let mut descriptors = Vec::new();
    for name in layers {
        let data = layer_bytes(name);
        let descriptor = Descriptor::for_bytes(LAYER_TYPE, &data);
        blobs.push((descriptor.digest.clone(), data));
        descriptors.push(descriptor);
    }
    let diff_ids: Vec<Digest> = layers.iter().map(|n| diff_id(n)).collect();

    let config = ConfigFile {
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        history,
        rootfs: RootFs {
            fs_type: "layers".to_string(),
            diff_ids: diff_ids.clone(),
        },
        ..ConfigFile::default()
    };
    let config_bytes = config.to_bytes().unwrap();
    let config_descriptor = Descriptor::for_bytes(OCI_CONFIG, &config_bytes);
    blobs.push((config_descriptor.digest.clone(), config_bytes.clone()));

    let annotations: BTreeMap<String, String> = annotations
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let manifest = Manifest {
        schema_version: 2,
        media_type: Some(OCI_MANIFEST.to_string()),
        config: config_descriptor,
        layers: descriptors.clone(),
        annotations: if annotations.is_empty() { None } else { Some(annotations) },
        extra: serde_json::Map::new(),
    };
    let manifest_bytes = manifest.to_bytes().unwrap();

    TestImage {
        digest: Digest::sha256_of(&manifest_bytes),
        manifest: manifest_bytes,
        config: config_bytes,
        layer_digests: descriptors.into_iter().map(|d| d.digest).collect(),
        diff_ids,
        blobs,
    }
}
