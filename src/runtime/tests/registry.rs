//! Registry transport, pull, push, and permission probe against a fake registry.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use a3s_rebase_core::OciError;
use a3s_rebase_runtime::oci::manifest::{ConfigFile, Descriptor, RootFs, OCI_CONFIG, OCI_MANIFEST};
use a3s_rebase_runtime::oci::{
    AnonymousKeychain, BlobSource, ManifestTemplate, MemorySource, SessionState, StaticKeychain,
};
use a3s_rebase_runtime::{
    check_push_permission, ComposedImage, Digest, Image, ImagePuller, Layer, Reference,
    RegistryAuth, RegistryClient, RegistryPusher,
};
use common::{build_image, diff_id, layer_bytes, step, FakeRegistry, LAYER_TYPE};

/// An in-memory image with the named layers.
fn local_image(names: &[&str]) -> ComposedImage {
    let mut source = MemorySource::new();
    let mut descriptors = Vec::new();
    for name in names {
        let data = layer_bytes(name);
        let descriptor = Descriptor::for_bytes(LAYER_TYPE, &data);
        source.insert(data);
        descriptors.push(descriptor);
    }
    let source: Arc<dyn BlobSource> = Arc::new(source);
    let layers: Vec<Layer> = descriptors
        .into_iter()
        .zip(names.iter())
        .map(|(d, n)| Layer::new(d, diff_id(n), source.clone()))
        .collect();
    let config = ConfigFile {
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        rootfs: RootFs {
            fs_type: "layers".to_string(),
            diff_ids: layers.iter().map(|l| l.diff_id().clone()).collect(),
        },
        ..ConfigFile::default()
    };
    let template = ManifestTemplate {
        media_type: Some(OCI_MANIFEST.to_string()),
        config_media_type: OCI_CONFIG.to_string(),
        annotations: BTreeMap::new(),
    };
    ComposedImage::new(template, config, layers).unwrap()
}

#[tokio::test]
async fn test_handshake_requests_declared_scopes() {
    let registry = FakeRegistry::start().await;
    let client = registry.client();

    let session = client
        .pull_session(registry.reference("org/app:v1").context())
        .await
        .unwrap();
    assert_eq!(session.transport().state(), SessionState::Authorized);

    let push_repo = registry.reference("org/app:v1");
    let source_repo = registry.reference("org/base:v1");
    client
        .push_session(push_repo.context(), &[source_repo.context().clone()])
        .await
        .unwrap();

    assert_eq!(
        registry.token_scopes(),
        vec![
            vec!["repository:org/app:pull".to_string()],
            vec![
                "repository:org/app:push,pull".to_string(),
                "repository:org/base:pull".to_string(),
            ],
        ]
    );
}

#[tokio::test]
async fn test_token_rejection_is_authentication_failure() {
    let registry = FakeRegistry::start().await;
    registry.deny_tokens();

    let err = registry
        .client()
        .pull_session(registry.reference("org/app:v1").context())
        .await
        .unwrap_err();
    assert!(matches!(err, OciError::AuthenticationFailed { .. }), "{err:?}");
}

#[tokio::test]
async fn test_check_push_permission_denied() {
    let registry = FakeRegistry::start().await;
    registry.deny_push();

    let err = check_push_permission(&registry.reference("org/app:v1"), &registry.client())
        .await
        .unwrap_err();
    assert!(matches!(err, OciError::PermissionDenied { .. }), "{err:?}");
}

#[tokio::test]
async fn test_check_push_permission_sends_no_bytes() {
    let registry = FakeRegistry::start().await;

    check_push_permission(&registry.reference("org/app:v1"), &registry.client())
        .await
        .unwrap();
    assert_eq!(registry.upload_sessions(), 1);
    assert_eq!(registry.blob_uploads(), 0);
    assert_eq!(registry.manifest_puts(), 0);
}

#[tokio::test]
async fn test_pull_reads_verified_image() {
    let registry = FakeRegistry::start().await;
    let image = build_image(&["a", "b"], vec![step("ADD a"), step("ADD b")], &[]);
    registry.seed("org/app", "v1", &image);

    let puller = ImagePuller::new(registry.client()).unwrap();
    let remote = puller.image(&registry.reference("org/app:v1")).await.unwrap();

    assert_eq!(remote.digest().unwrap(), image.digest);
    let config = remote.config_file().await.unwrap();
    assert_eq!(config.rootfs.diff_ids, image.diff_ids);
    let layers = remote.layers().await.unwrap();
    assert_eq!(layers.len(), 2);
    assert_eq!(layers[1].compressed().await.unwrap(), layer_bytes("b"));
    assert_eq!(layers[0].source_repository(), Some(remote.reference().context()));

    let digest = puller.digest(&registry.reference("org/app:v1")).await.unwrap();
    assert_eq!(digest, image.digest);
}

#[tokio::test]
async fn test_missing_manifest_is_fetch_failure() {
    let registry = FakeRegistry::start().await;
    let puller = ImagePuller::new(registry.client()).unwrap();

    let err = puller
        .image(&registry.reference("org/app:nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, OciError::ManifestFetchFailed { .. }), "{err:?}");
}

#[tokio::test]
async fn test_tampered_blob_is_rejected() {
    let registry = FakeRegistry::start().await;
    let image = build_image(&["a"], vec![], &[]);
    registry.seed("org/app", "v1", &image);
    registry.tamper(&image.layer_digests[0]);

    let puller = ImagePuller::new(registry.client()).unwrap();
    let remote = puller.image(&registry.reference("org/app:v1")).await.unwrap();
    let layers = remote.layers().await.unwrap();

    let err = layers[0].compressed().await.unwrap_err();
    assert!(matches!(err, OciError::DigestMismatch { .. }), "{err:?}");
}

#[tokio::test]
async fn test_push_round_trip_preserves_digest() {
    let registry = FakeRegistry::start().await;
    let image = local_image(&["a", "b", "c"]);
    let expected = image.digest().unwrap();

    let pusher = RegistryPusher::new(registry.client());
    let result = pusher
        .push(&image, &registry.reference("org/app:v1"))
        .await
        .unwrap();
    assert_eq!(result.digest, expected);
    assert_eq!(result.uploaded, 4);
    assert_eq!(registry.manifest_puts(), 1);

    let puller = ImagePuller::new(registry.client()).unwrap();
    let fetched = puller.image(&registry.reference("org/app:v1")).await.unwrap();
    assert_eq!(fetched.digest().unwrap(), expected);
    let layers = fetched.layers().await.unwrap();
    assert_eq!(layers[2].compressed().await.unwrap(), layer_bytes("c"));
}

#[tokio::test]
async fn test_second_push_transfers_nothing() {
    let registry = FakeRegistry::start().await;
    let image = local_image(&["a", "b"]);
    let pusher = RegistryPusher::new(registry.client());
    let destination = registry.reference("org/app:v1");

    let first = pusher.push(&image, &destination).await.unwrap();
    let uploads = registry.blob_uploads();
    let second = pusher.push(&image, &destination).await.unwrap();

    assert_eq!(second.uploaded, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(registry.blob_uploads(), uploads);
    assert_eq!(first.digest, second.digest);
}

#[tokio::test]
async fn test_push_uploads_in_chunks() {
    let registry = FakeRegistry::start().await;
    let mut options = registry.options();
    options.transport.chunk_size = Some(3);
    let client = registry.client_with(&options, Arc::new(AnonymousKeychain));

    let image = local_image(&["chunked"]);
    let layer = image.layers().await.unwrap()[0].clone();
    RegistryPusher::new(client)
        .push(&image, &registry.reference("org/app:v1"))
        .await
        .unwrap();

    assert!(registry.has_blob("org/app", layer.digest()));
    assert!(registry.chunks() >= 4);
}

#[tokio::test]
async fn test_push_mounts_layers_from_sibling_repository() {
    let registry = FakeRegistry::start().await;
    let image = build_image(&["a", "b"], vec![], &[]);
    registry.seed("org/source", "v1", &image);

    let puller = ImagePuller::new(registry.client()).unwrap();
    let remote = puller
        .image(&registry.reference("org/source:v1"))
        .await
        .unwrap();
    let result = RegistryPusher::new(registry.client())
        .push(&remote, &registry.reference("org/target:v1"))
        .await
        .unwrap();

    assert_eq!(result.mounted, 2);
    assert_eq!(result.uploaded, 1);
    assert_eq!(registry.mounts(), 2);
    for digest in &image.layer_digests {
        assert!(registry.has_blob("org/target", digest));
    }
    assert_eq!(
        registry.manifest("org/target", "v1"),
        Some(image.manifest.clone())
    );
}

#[tokio::test]
async fn test_push_by_digest_targets_content_digest() {
    let registry = FakeRegistry::start().await;
    let image = local_image(&["a"]);
    let stale = Digest::sha256_of(b"something else");
    let requested = registry.reference(&format!("org/app@{}", stale));

    let result = RegistryPusher::new(registry.client())
        .push(&image, &requested)
        .await
        .unwrap();

    let digest = image.digest().unwrap();
    assert_eq!(result.reference.digest(), Some(&digest));
    assert!(registry.manifest("org/app", &digest.to_string()).is_some());
    assert!(registry.manifest("org/app", &stale.to_string()).is_none());
}

#[tokio::test]
async fn test_transient_server_error_is_retried() {
    let registry = FakeRegistry::start().await;
    let image = build_image(&["a"], vec![], &[]);
    registry.seed("org/app", "v1", &image);
    registry.fail_requests(1);

    let puller = ImagePuller::new(registry.client()).unwrap();
    let remote = puller.image(&registry.reference("org/app:v1")).await.unwrap();
    assert_eq!(remote.digest().unwrap(), image.digest);
}

#[tokio::test]
async fn test_persistent_server_error_is_fetch_failure() {
    let registry = FakeRegistry::start().await;
    registry.fail_requests(usize::MAX);

    let puller = ImagePuller::new(registry.client()).unwrap();
    let err = puller
        .image(&registry.reference("org/app:v1"))
        .await
        .unwrap_err();
    match err {
        OciError::ManifestFetchFailed { reason, .. } => assert!(reason.contains("503"), "{reason}"),
        other => panic!("unexpected error: {:?}", other),
    }
    // Bounded by the retry policy's two attempts.
    assert_eq!(registry.requests(), 2);
}

#[tokio::test]
async fn test_persistent_server_error_fails_push_check_with_status() {
    let registry = FakeRegistry::start().await;
    registry.fail_requests(usize::MAX);

    let err = check_push_permission(&registry.reference("org/app:v1"), &registry.client())
        .await
        .unwrap_err();
    assert!(
        matches!(err, OciError::UploadInitiationFailed { status: 503, .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn test_unreachable_registry_is_fetch_failure() {
    let options = a3s_rebase_core::config::Options::default();
    let mut transport = options.transport.clone();
    transport.retry.max_attempts = 1;
    let client = RegistryClient::new(Arc::new(AnonymousKeychain), &transport).unwrap();
    let reference = Reference::parse("127.0.0.1:1/org/app:v1", &options.name).unwrap();

    let err = ImagePuller::new(client)
        .unwrap()
        .image(&reference)
        .await
        .unwrap_err();
    assert!(matches!(err, OciError::ManifestFetchFailed { .. }), "{err:?}");
}

#[tokio::test]
async fn test_forbidden_ping_is_permission_denied() {
    let registry = FakeRegistry::start().await;
    registry.forbid_ping();

    let err = registry
        .client()
        .pull_session(registry.reference("org/app:v1").context())
        .await
        .unwrap_err();
    assert!(matches!(err, OciError::PermissionDenied { .. }), "{err:?}");
}

#[tokio::test]
async fn test_expired_token_is_renewed_and_request_replayed() {
    let registry = FakeRegistry::start().await;
    let image = build_image(&["a"], vec![], &[]);
    registry.seed("org/app", "v1", &image);

    let session = registry
        .client()
        .pull_session(registry.reference("org/app:v1").context())
        .await
        .unwrap();
    registry.expire_tokens(1);

    let fetched = session.get_manifest("v1").await.unwrap();
    assert_eq!(fetched.bytes, image.manifest);
    assert_eq!(registry.token_scopes().len(), 2);
    assert_eq!(session.transport().state(), SessionState::Authorized);
}

#[tokio::test]
async fn test_rejected_renewed_token_is_authentication_failure() {
    let registry = FakeRegistry::start().await;
    let image = build_image(&["a"], vec![], &[]);
    registry.seed("org/app", "v1", &image);

    let session = registry
        .client()
        .pull_session(registry.reference("org/app:v1").context())
        .await
        .unwrap();
    registry.expire_tokens(2);

    let err = session.get_manifest("v1").await.unwrap_err();
    assert!(matches!(err, OciError::AuthenticationFailed { .. }), "{err:?}");
    // One handshake to open the session, exactly one renewal.
    assert_eq!(registry.token_scopes().len(), 2);
}

#[tokio::test]
async fn test_basic_challenge_uses_keychain_credentials() {
    let registry = FakeRegistry::start().await;
    let image = build_image(&["a"], vec![], &[]);
    registry.seed("org/app", "v1", &image);
    registry.require_basic("user", "secret");

    let keychain = StaticKeychain::new().with(&registry.host(), RegistryAuth::basic("user", "secret"));
    let client = registry.client_with(&registry.options(), Arc::new(keychain));
    let puller = ImagePuller::new(client).unwrap();
    let remote = puller.image(&registry.reference("org/app:v1")).await.unwrap();

    assert_eq!(remote.digest().unwrap(), image.digest);
    assert!(registry.token_scopes().is_empty());
}

#[tokio::test]
async fn test_basic_challenge_without_credentials_fails() {
    let registry = FakeRegistry::start().await;
    registry.require_basic("user", "secret");

    let err = registry
        .client()
        .pull_session(registry.reference("org/app:v1").context())
        .await
        .unwrap_err();
    assert!(matches!(err, OciError::AuthenticationFailed { .. }), "{err:?}");
}

#[tokio::test]
async fn test_failed_upload_resends_whole_blob() {
    let registry = FakeRegistry::start().await;
    registry.fail_uploads(1);
    let image = local_image(&["a", "b"]);

    let result = RegistryPusher::new(registry.client())
        .push(&image, &registry.reference("org/app:v1"))
        .await
        .unwrap();

    assert_eq!(result.uploaded, 3);
    for layer in image.layers().await.unwrap() {
        assert!(registry.has_blob("org/app", layer.digest()));
    }
}
