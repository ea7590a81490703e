use crate::cluster::ControlPlane;
use anyhow::Context;
use chrono::Utc;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::api::{Patch, PatchParams};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub static KUBE_PROMOTE_ANNOTATION: &str = "kube-promote/restartedAt";
pub static KUBE_PROMOTE_FIELD_MANAGER: &str = "kube-promote";
pub static KUBECTL_ROLLOUT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    /// Backed by a Deployment, pods carry no identity
    Stateless,
    /// Backed by a StatefulSet, pods keep their ordinal and volumes
    Stateful,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub name: String,
    pub kind: WorkloadKind,
}

impl WorkloadRef {
    pub fn new(name: &str, kind: WorkloadKind) -> Self {
        WorkloadRef {
            name: name.to_string(),
            kind,
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WorkloadKind::Stateless => write!(f, "deployment/{}", self.name),
            WorkloadKind::Stateful => write!(f, "statefulset/{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RolloutStatus {
    pub desired: i32,
    pub updated: i32,
    pub ready: i32,
    pub generation_observed: bool,
    pub revision_settled: bool,
}

impl RolloutStatus {
    pub fn is_ready(&self) -> bool {
        self.generation_observed
            && self.revision_settled
            && self.updated >= self.desired
            && self.ready >= self.desired
    }
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("workload {workload} cannot be restarted as {expected:?}")]
    WrongKind {
        workload: WorkloadRef,
        expected: WorkloadKind,
    },

    #[error("failed to restart {workload}: {message}")]
    RestartFailed { workload: WorkloadRef, message: String },

    #[error("failed to read rollout status of {workload}: {message}")]
    StatusFailed { workload: WorkloadRef, message: String },

    #[error("{workloads} not ready after {timeout:?}")]
    NotReady { workloads: String, timeout: Duration },
}

pub trait Rollout
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + DeserializeOwned
        + 'static,
{
    fn kind_name() -> &'static str {
        std::any::type_name::<Self>()
            .split("::")
            .last()
            .unwrap_or("workload")
    }
    fn desired_replicas(&self) -> i32;
    fn updated_replicas(&self) -> i32;
    fn ready_replicas(&self) -> i32;
    fn observed_generation(&self) -> Option<i64>;
    fn revision_settled(&self) -> bool {
        true
    }

    fn rollout_status(&self) -> RolloutStatus {
        let generation_observed = match (self.meta().generation, self.observed_generation()) {
            (Some(generation), Some(observed)) => observed >= generation,
            (None, _) => true,
            (Some(_), None) => false,
        };
        RolloutStatus {
            desired: self.desired_replicas(),
            updated: self.updated_replicas(),
            ready: self.ready_replicas(),
            generation_observed,
            revision_settled: self.revision_settled(),
        }
    }

    /// Merge-patches annotations into the pod template; the workload object itself is never replaced.
    async fn patch_template_annotations(
        api: &Api<Self>,
        resource_name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let k8s_resource_kind = Self::kind_name();

        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": annotations,
                    }
                }
            }
        });

        debug!(
            "Patching {} {} with patch {}",
            k8s_resource_kind, resource_name, patch
        );
        api.patch(
            resource_name,
            &PatchParams::apply(KUBE_PROMOTE_FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .with_context(|| {
            format!(
                "Failed to patch {} {} to trigger rollout",
                k8s_resource_kind, resource_name
            )
        })?;
        Ok(())
    }
}

impl Rollout for Deployment {
    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/deployment-v1/#DeploymentStatus
    fn desired_replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
    }

    fn updated_replicas(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.updated_replicas)
            .unwrap_or(0)
    }

    fn ready_replicas(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0)
    }

    fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.observed_generation)
    }
}

impl Rollout for StatefulSet {
    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/stateful-set-v1/#StatefulSetStatus
    fn desired_replicas(&self) -> i32 {
        self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
    }

    fn updated_replicas(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.updated_replicas)
            .unwrap_or(0)
    }

    fn ready_replicas(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0)
    }

    fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.observed_generation)
    }

    fn revision_settled(&self) -> bool {
        match self.status.as_ref() {
            Some(status) => match (&status.current_revision, &status.update_revision) {
                (Some(current), Some(update)) => current == update,
                _ => true,
            },
            None => false,
        }
    }
}

/// Single restart annotation stamped with the current time.
pub fn restart_annotation(key: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), Utc::now().to_rfc3339())])
}

/// Restarts the service layer first, then the stateful layer.
///
/// The ordering is advisory: nothing locks one workload against the other.
pub struct RolloutCoordinator<'a, C> {
    control_plane: &'a C,
    namespace: &'a str,
}

impl<'a, C: ControlPlane> RolloutCoordinator<'a, C> {
    pub fn new(control_plane: &'a C, namespace: &'a str) -> Self {
        RolloutCoordinator {
            control_plane,
            namespace,
        }
    }

    pub async fn restart_stateless(&self, workload: &WorkloadRef) -> Result<(), RolloutError> {
        if workload.kind != WorkloadKind::Stateless {
            return Err(RolloutError::WrongKind {
                workload: workload.clone(),
                expected: WorkloadKind::Stateless,
            });
        }
        info!("Triggering rollout restart of {}", workload);
        self.control_plane
            .restart_deployment(self.namespace, &workload.name)
            .await
            .map_err(|e| RolloutError::RestartFailed {
                workload: workload.clone(),
                message: format!("{:#}", e),
            })
    }

    /// Restart by pod template patch. Deleting a StatefulSet can orphan or destroy its volumes.
    pub async fn restart_stateful(&self, workload: &WorkloadRef) -> Result<(), RolloutError> {
        if workload.kind != WorkloadKind::Stateful {
            return Err(RolloutError::WrongKind {
                workload: workload.clone(),
                expected: WorkloadKind::Stateful,
            });
        }
        info!("Patching pod template of {} to trigger a rolling restart", workload);
        self.control_plane
            .patch_stateful_set_template(
                self.namespace,
                &workload.name,
                &restart_annotation(KUBE_PROMOTE_ANNOTATION),
            )
            .await
            .map_err(|e| RolloutError::RestartFailed {
                workload: workload.clone(),
                message: format!("{:#}", e),
            })
    }

    pub async fn roll(
        &self,
        stateless: &WorkloadRef,
        stateful: &WorkloadRef,
    ) -> Result<Vec<WorkloadRef>, RolloutError> {
        self.restart_stateless(stateless).await?;
        self.restart_stateful(stateful).await?;
        Ok(vec![stateless.clone(), stateful.clone()])
    }

    pub async fn wait_until_ready(
        &self,
        workloads: &[WorkloadRef],
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), RolloutError> {
        match tokio::time::timeout(timeout, self.poll_until_ready(workloads, poll_interval)).await {
            Ok(result) => result,
            Err(_) => Err(RolloutError::NotReady {
                workloads: workloads
                    .iter()
                    .map(|w| w.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                timeout,
            }),
        }
    }

    async fn poll_until_ready(
        &self,
        workloads: &[WorkloadRef],
        poll_interval: Duration,
    ) -> Result<(), RolloutError> {
        let mut pending: Vec<&WorkloadRef> = workloads.iter().collect();
        loop {
            let mut still_pending = Vec::new();
            for workload in pending {
                let status = self
                    .control_plane
                    .rollout_status(self.namespace, workload)
                    .await
                    .map_err(|e| RolloutError::StatusFailed {
                        workload: workload.clone(),
                        message: format!("{:#}", e),
                    })?;
                if status.is_ready() {
                    info!("{} is ready ({}/{} replicas)", workload, status.ready, status.desired);
                } else {
                    debug!("Waiting for {}: {:?}", workload, status);
                    still_pending.push(workload);
                }
            }
            if still_pending.is_empty() {
                return Ok(());
            }
            pending = still_pending;
            tokio::time::sleep(poll_interval).await;
        }
    }
}
