use crate::image_reference::ImageReference;
use crate::secret_string::SecretString;
use thiserror::Error;

/// Proof of a successful registry login, valid for the lifetime of one run.
#[derive(Debug, Clone)]
pub struct Session {
    pub host: String,
    pub username: String,
    pub credential: SecretString,
}

/// Proof that `reference` was pulled into the local image store during this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
    pub reference: ImageReference,
    pub image_id: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("registry {host} rejected the credentials of {username}: {message}")]
    Rejected {
        host: String,
        username: String,
        message: String,
    },

    #[error("registry {host} is unreachable: {message}")]
    Unreachable { host: String, message: String },
}

#[derive(Debug, Error)]
pub enum PullError {
    #[error("image {reference} not found")]
    ImageNotFound { reference: ImageReference },

    #[error("network error while pulling {reference}: {message}")]
    Network {
        reference: ImageReference,
        message: String,
    },

    #[error("container runtime failed to pull {reference}: {message}")]
    Runtime {
        reference: ImageReference,
        message: String,
    },
}

/// Remote side of the promotion: authenticate once, then fetch images into the local store.
pub trait Registry {
    /// The credential must reach the runtime over a non-interactive channel, never as an argument.
    async fn login(
        &self,
        host: &str,
        username: &str,
        credential: &SecretString,
    ) -> Result<Session, AuthError>;

    /// No retries: a failed pull is surfaced immediately.
    async fn pull(&self, session: &Session, reference: &ImageReference) -> Result<PulledImage, PullError>;
}
