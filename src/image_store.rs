use crate::image_reference::ImageReference;
use crate::registry::PulledImage;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TagError {
    #[error("image {reference} is not present in the local image store")]
    SourceMissing { reference: ImageReference },

    #[error("failed to tag {source_ref} as {target}: {message}")]
    Runtime {
        source_ref: ImageReference,
        target: ImageReference,
        message: String,
    },
}

/// Failure of a best-effort operation. Callers log it and move on.
#[derive(Debug, Error)]
#[error("{operation} failed: {message}")]
pub struct CleanupError {
    pub operation: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    Absent,
}

/// The container runtime's image store that the cluster runs images from.
pub trait ImageStore {
    /// Adds `target` as a second name for the pulled content.
    async fn tag(&self, pulled: &PulledImage, target: &ImageReference) -> Result<(), TagError>;
    async fn remove_if_present(&self, reference: &ImageReference) -> Result<Removal, CleanupError>;
    /// Removes dangling images.
    async fn prune(&self) -> Result<(), CleanupError>;
    async fn list(&self) -> Result<Vec<ImageReference>, CleanupError>;
}

/// Tags a pulled image under its local name and drops the remote-tagged name.
///
/// The remote name is only removed once the local tag exists, so the content stays referenced.
pub async fn promote<S: ImageStore>(
    store: &S,
    pulled: &PulledImage,
    prune: bool,
) -> Result<ImageReference, TagError> {
    let local = pulled.reference.to_local();
    store.tag(pulled, &local).await?;
    info!("Tagged {} as {}", pulled.reference, local);

    match store.remove_if_present(&pulled.reference).await {
        Ok(Removal::Removed) => debug!("Removed remote-tagged copy {}", pulled.reference),
        Ok(Removal::Absent) => debug!("Remote-tagged copy {} already absent", pulled.reference),
        Err(e) => warn!("Ignoring cleanup failure: {}", e),
    }

    if prune {
        if let Err(e) = store.prune().await {
            warn!("Ignoring cleanup failure: {}", e);
        }
    }

    Ok(local)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Verification {
    pub missing_local: Vec<ImageReference>,
    pub lingering_remote: Vec<ImageReference>,
}

impl Verification {
    pub fn is_clean(&self) -> bool {
        self.missing_local.is_empty() && self.lingering_remote.is_empty()
    }
}

/// Checks that every promoted image is present under its local name only.
pub async fn verify<S: ImageStore>(
    store: &S,
    remotes: &[ImageReference],
) -> Result<Verification, CleanupError> {
    let present: Vec<ImageReference> = store.list().await?.iter().map(ImageReference::canonical).collect();
    let mut verification = Verification::default();
    for remote in remotes {
        let local = remote.to_local();
        if !present.contains(&local) {
            verification.missing_local.push(local);
        }
        if present.contains(&remote.canonical()) {
            verification.lingering_remote.push(remote.clone());
        }
    }
    Ok(verification)
}
