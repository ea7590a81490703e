use crate::image_store::TagError;
use crate::manifest::ApplyError;
use crate::registry::{AuthError, PullError};
use crate::rollout::RolloutError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("registry credential is missing, set the {variable} environment variable")]
    MissingCredential { variable: String },

    #[error("cluster is unavailable: {message}")]
    ClusterUnavailable { message: String },

    #[error("namespace {namespace} does not exist, create it before promoting")]
    NamespaceMissing { namespace: String },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Pull(#[from] PullError),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Rollout(#[from] RolloutError),
}

impl OrchestrationError {
    /// Name of the stage that failed, used in the final diagnostic line.
    pub fn stage(&self) -> &'static str {
        match self {
            OrchestrationError::InvalidConfig { .. } => "configuration",
            OrchestrationError::MissingCredential { .. }
            | OrchestrationError::ClusterUnavailable { .. }
            | OrchestrationError::NamespaceMissing { .. } => "pre-flight",
            OrchestrationError::Auth(_) => "registry login",
            OrchestrationError::Pull(_) => "image pull",
            OrchestrationError::Tag(_) => "image tag",
            OrchestrationError::Apply(_) => "manifest apply",
            OrchestrationError::Rollout(_) => "rollout",
        }
    }

    /// Nothing was mutated when a pre-flight check failed.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            OrchestrationError::InvalidConfig { .. }
                | OrchestrationError::MissingCredential { .. }
                | OrchestrationError::ClusterUnavailable { .. }
                | OrchestrationError::NamespaceMissing { .. }
        )
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_preflight() { 2 } else { 1 }
    }
}
