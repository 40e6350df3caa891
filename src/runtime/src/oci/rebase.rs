//! Rebasing images that live in a registry.
//!
//! [`Rebaser`] fetches the original image and its bases, splices them with
//! [`mutate::rebase`](super::mutate::rebase), and records the new base in
//! the result's annotations so a later rebase can find it again without
//! being told.

use std::collections::BTreeMap;

use a3s_rebase_core::config::NameOptions;
use a3s_rebase_core::error::{OciError, Result};

use super::check::check_push_permission;
use super::digest::Digest;
use super::image::{ComposedImage, Image};
use super::manifest::{BASE_DIGEST_ANNOTATION, BASE_REF_ANNOTATION};
use super::mutate;
use super::pull::ImagePuller;
use super::push::{PushResult, RegistryPusher};
use super::reference::Reference;
use super::registry::RegistryClient;

/// A rebase-then-push request.
#[derive(Debug, Clone, PartialEq)]
pub struct RebaseRequest {
    /// Image to rebase
    pub original: Reference,
    /// Base to remove; defaults to the original's base annotations
    pub old_base: Option<Reference>,
    /// Base to insert; defaults to the original's base annotation
    pub new_base: Option<Reference>,
    /// Where to push; defaults to `original`
    pub tag: Option<Reference>,
}

/// What a rebase-then-push produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RebaseOutcome {
    /// Digest of the rebased manifest
    pub digest: Digest,
    /// `<repository>@<digest>` at the destination
    pub reference: Reference,
    pub push: PushResult,
}

/// Rebases registry images.
#[derive(Debug, Clone)]
pub struct Rebaser {
    client: RegistryClient,
    puller: ImagePuller,
    pusher: RegistryPusher,
    name_options: NameOptions,
}

impl Rebaser {
    pub fn new(client: RegistryClient, name_options: &NameOptions) -> Result<Self> {
        Ok(Self {
            puller: ImagePuller::new(client.clone())?,
            pusher: RegistryPusher::new(client.clone()),
            client,
            name_options: name_options.clone(),
        })
    }

    /// Rebase `original` from `old_base` onto `new_base`.
    ///
    /// Missing bases are recovered from the original's annotations: the
    /// new base from its reference annotation, the old base from its digest
    /// annotation looked up in the new base's repository.
    pub async fn rebase(
        &self,
        original: &Reference,
        old_base: Option<&Reference>,
        new_base: Option<&Reference>,
    ) -> Result<ComposedImage> {
        let original_image = self.puller.image(original).await?;
        let manifest = original_image.manifest()?;

        let new_base = match new_base {
            Some(reference) => reference.clone(),
            None => {
                let value = manifest.annotation(BASE_REF_ANNOTATION).ok_or_else(|| {
                    OciError::MissingBaseReference {
                        annotation: BASE_REF_ANNOTATION.to_string(),
                    }
                })?;
                tracing::info!(
                    annotation = BASE_REF_ANNOTATION,
                    new_base = value,
                    "Detected new base from annotation"
                );
                Reference::parse(value, &self.name_options)?
            }
        };

        let old_base = match old_base {
            Some(reference) => reference.clone(),
            None => {
                let value = manifest.annotation(BASE_DIGEST_ANNOTATION).ok_or_else(|| {
                    OciError::MissingBaseDigest {
                        annotation: BASE_DIGEST_ANNOTATION.to_string(),
                    }
                })?;
                let reference = new_base.context().digest(Digest::parse(value)?);
                tracing::info!(
                    annotation = BASE_DIGEST_ANNOTATION,
                    old_base = %reference,
                    "Detected old base from annotation"
                );
                reference
            }
        };

        let (old_image, new_image) =
            futures::try_join!(self.puller.image(&old_base), self.puller.image(&new_base))?;
        let rebased = mutate::rebase(&original_image, &old_image, &new_image).await?;

        let new_base_digest = new_image.digest()?;
        let mut annotations = BTreeMap::new();
        annotations.insert(BASE_DIGEST_ANNOTATION.to_string(), new_base_digest.to_string());
        annotations.insert(BASE_REF_ANNOTATION.to_string(), new_base.to_string());
        tracing::info!(
            base_digest = %new_base_digest,
            base_ref = %new_base,
            "Set base annotations"
        );
        let rebased = rebased.with_annotations(annotations);

        let digest = rebased.digest()?;
        tracing::info!(original = %original, digest = %digest, "Rebased image");
        Ok(rebased)
    }

    /// Check push access, rebase, and push the result once.
    pub async fn rebase_and_push(&self, request: &RebaseRequest) -> Result<RebaseOutcome> {
        let requested = request.tag.as_ref().unwrap_or(&request.original);
        check_push_permission(requested, &self.client).await?;

        let rebased = self
            .rebase(
                &request.original,
                request.old_base.as_ref(),
                request.new_base.as_ref(),
            )
            .await?;

        if request.tag.is_none() {
            tracing::info!(reference = %requested, "Pushing rebased image over the original");
        }
        let push = self.pusher.push(&rebased, requested).await?;
        Ok(RebaseOutcome {
            digest: push.digest.clone(),
            reference: push.reference.context().digest(push.digest.clone()),
            push,
        })
    }
}
