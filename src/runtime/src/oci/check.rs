//! Push permission probe.

use a3s_rebase_core::error::Result;

use super::reference::Reference;
use super::registry::{RegistryClient, UploadSession};

/// Check that the caller may push to `reference` without building or
/// sending anything.
///
/// Runs the push-scoped handshake and opens one upload session, which is
/// then abandoned. Authentication and permission failures are returned
/// unchanged.
pub async fn check_push_permission(reference: &Reference, client: &RegistryClient) -> Result<()> {
    let session = client.push_session(reference.context(), &[]).await?;
    match session.initiate_upload(None).await? {
        UploadSession::Mounted => {
            tracing::debug!(reference = %reference, "Upload probe short-circuited by registry");
        }
        UploadSession::Pending { .. } => {
            tracing::debug!(reference = %reference, "Upload probe accepted");
        }
    }
    Ok(())
}
