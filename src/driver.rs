use crate::cluster::{ClusterTarget, ControlPlane};
use crate::config::Config;
use crate::error::OrchestrationError;
use crate::image_reference::ImageReference;
use crate::image_store::{self, ImageStore};
use crate::manifest::{self, AppliedSet};
use crate::registry::Registry;
use crate::rollout::{RolloutCoordinator, WorkloadRef};
use crate::secret_string::SecretString;
use tracing::{info, warn};

#[derive(Debug)]
pub struct RunReport {
    pub promoted: Vec<ImageReference>,
    pub applied: AppliedSet,
    pub restarted: Vec<WorkloadRef>,
}

/// Runs the whole promotion as one straight-line sequence, aborting on the first fatal error.
///
/// Every step is safe to repeat, so a failed run is recovered by running it again.
pub struct Driver<'a, R, S, C> {
    registry: &'a R,
    store: &'a S,
    cluster: &'a C,
}

impl<'a, R, S, C> Driver<'a, R, S, C>
where
    R: Registry,
    S: ImageStore,
    C: ControlPlane,
{
    pub fn new(registry: &'a R, store: &'a S, cluster: &'a C) -> Self {
        Driver {
            registry,
            store,
            cluster,
        }
    }

    pub async fn run(
        &self,
        config: &Config,
        credential: Option<&SecretString>,
    ) -> Result<RunReport, OrchestrationError> {
        let remotes = config
            .remote_images()
            .map_err(|e| OrchestrationError::InvalidConfig {
                message: format!("{:#}", e),
            })?;
        let target = ClusterTarget::from_config(config);

        let credential = self.preflight(config, credential, &target).await?;

        let session = self
            .registry
            .login(&config.registry.host, &config.registry.username, credential)
            .await?;
        info!("Logged in to {} as {}", session.host, session.username);

        let mut promoted = Vec::with_capacity(remotes.len());
        for remote in &remotes {
            let pulled = self.registry.pull(&session, remote).await?;
            info!("Pulled {} ({})", pulled.reference, pulled.image_id);
            promoted.push(image_store::promote(self.store, &pulled, config.runtime.prune).await?);
        }

        let applied = manifest::apply_directory(self.cluster, &target, &promoted).await?;
        info!(
            "Applied {} resource(s) to namespace {}",
            applied.resources.len(),
            target.namespace
        );

        let coordinator = RolloutCoordinator::new(self.cluster, &target.namespace);
        let restarted = coordinator
            .roll(&config.stateless_workload(), &config.stateful_workload())
            .await?;
        if config.rollout.wait_for_ready {
            coordinator
                .wait_until_ready(
                    &restarted,
                    config.rollout.ready_timeout(),
                    config.rollout.poll_interval(),
                )
                .await?;
        } else {
            info!("Rollouts triggered, not waiting for readiness");
        }

        match image_store::verify(self.store, &remotes).await {
            Ok(verification) if verification.is_clean() => {}
            Ok(verification) => warn!(
                "Local image store is not as expected, missing {:?}, lingering {:?}",
                verification.missing_local, verification.lingering_remote
            ),
            Err(e) => warn!("Skipping image store verification: {}", e),
        }

        Ok(RunReport {
            promoted,
            applied,
            restarted,
        })
    }

    /// Checked in order, before any side effect.
    async fn preflight<'c>(
        &self,
        config: &Config,
        credential: Option<&'c SecretString>,
        target: &ClusterTarget,
    ) -> Result<&'c SecretString, OrchestrationError> {
        let credential = credential.filter(|c| !c.is_blank()).ok_or_else(|| {
            OrchestrationError::MissingCredential {
                variable: config.registry.token_env.clone(),
            }
        })?;

        let version = self
            .cluster
            .server_version()
            .await
            .map_err(|e| OrchestrationError::ClusterUnavailable {
                message: format!("{:#}", e),
            })?;
        info!("Connected to Kubernetes API server version {}", version);

        let namespace_exists = self
            .cluster
            .namespace_exists(&target.namespace)
            .await
            .map_err(|e| OrchestrationError::ClusterUnavailable {
                message: format!("{:#}", e),
            })?;
        if !namespace_exists {
            return Err(OrchestrationError::NamespaceMissing {
                namespace: target.namespace.clone(),
            });
        }

        Ok(credential)
    }
}
