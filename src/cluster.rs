use crate::config::Config;
use crate::manifest::Manifest;
use crate::rollout::{
    KUBE_PROMOTE_FIELD_MANAGER, KUBECTL_ROLLOUT_ANNOTATION, Rollout, RolloutStatus, WorkloadKind,
    WorkloadRef, restart_annotation,
};
use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DynamicObject, Patch, PatchParams};
use kube::config::KubeConfigOptions;
use kube::core::GroupVersionKind;
use kube::discovery::{self, Scope};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Where manifests go: a namespace that must already exist and the directory they are read from.
#[derive(Debug, Clone)]
pub struct ClusterTarget {
    pub namespace: String,
    pub manifest_dir: PathBuf,
    pub manifest_globs: Vec<String>,
}

impl ClusterTarget {
    pub fn from_config(config: &Config) -> Self {
        ClusterTarget {
            namespace: config.cluster.namespace.clone(),
            manifest_dir: config.cluster.manifest_dir.clone(),
            manifest_globs: config.cluster.manifest_globs.clone(),
        }
    }
}

/// Operations the promotion workflow needs from the cluster control plane.
///
/// There is no delete or replace operation: workloads are only ever restarted by patching.
pub trait ControlPlane {
    /// Human readable API server version, fails when the cluster is unreachable.
    async fn server_version(&self) -> Result<String>;
    async fn namespace_exists(&self, namespace: &str) -> Result<bool>;
    async fn apply(&self, namespace: &str, manifest: &Manifest) -> Result<()>;
    /// Equivalent of `kubectl rollout restart deployment/<name>`.
    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<()>;
    async fn patch_stateful_set_template(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;
    async fn rollout_status(&self, namespace: &str, workload: &WorkloadRef) -> Result<RolloutStatus>;
}

/// Control plane backed by a kube client, created on first use so that a
/// missing kubeconfig surfaces as an unreachable cluster.
pub struct KubeControlPlane {
    kube_context: Option<String>,
    client: OnceCell<Client>,
}

impl KubeControlPlane {
    pub fn new(kube_context: Option<String>) -> Self {
        KubeControlPlane {
            kube_context,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| create_client(self.kube_context.as_deref()))
            .await
    }
}

pub async fn create_client(kube_context: Option<&str>) -> Result<Client> {
    info!("Initializing K8s client");
    let config = match kube_context {
        Some(context) => {
            let options = KubeConfigOptions {
                context: Some(context.to_string()),
                ..Default::default()
            };
            kube::Config::from_kubeconfig(&options)
                .await
                .with_context(|| format!("Failed to load kubeconfig context {}", context))?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };
    Client::try_from(config).context("Failed to build Kubernetes client")
}

impl ControlPlane for KubeControlPlane {
    async fn server_version(&self) -> Result<String> {
        let client = self.client().await?;
        let api_server_info = client
            .apiserver_version()
            .await
            .context("Kubernetes API server did not answer")?;
        Ok(format!("{}.{}", api_server_info.major, api_server_info.minor))
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        let namespaces: Api<Namespace> = Api::all(self.client().await?.clone());
        let found = namespaces
            .get_opt(namespace)
            .await
            .with_context(|| format!("Failed to look up namespace {}", namespace))?;
        Ok(found.is_some())
    }

    async fn apply(&self, namespace: &str, manifest: &Manifest) -> Result<()> {
        let client = self.client().await?;
        let (group, version) = match manifest.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", manifest.api_version.as_str()),
        };
        let gvk = GroupVersionKind::gvk(group, version, &manifest.id.kind);
        let (api_resource, capabilities) = discovery::pinned_kind(client, &gvk)
            .await
            .with_context(|| format!("Unknown resource type {}/{}", manifest.api_version, manifest.id.kind))?;

        let api: Api<DynamicObject> = match capabilities.scope {
            Scope::Namespaced => {
                let namespace = manifest.id.namespace.as_deref().unwrap_or(namespace);
                Api::namespaced_with(client.clone(), namespace, &api_resource)
            }
            Scope::Cluster => Api::all_with(client.clone(), &api_resource),
        };

        debug!("Applying {} from {}", manifest.id, manifest.source.display());
        api.patch(
            &manifest.id.name,
            &PatchParams::apply(KUBE_PROMOTE_FIELD_MANAGER).force(),
            &Patch::Apply(&manifest.body),
        )
        .await
        .with_context(|| format!("Control plane rejected {}", manifest.id))?;
        Ok(())
    }

    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client().await?.clone(), namespace);
        Deployment::patch_template_annotations(
            &deployments,
            name,
            &restart_annotation(KUBECTL_ROLLOUT_ANNOTATION),
        )
        .await
    }

    async fn patch_stateful_set_template(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let stateful_sets: Api<StatefulSet> = Api::namespaced(self.client().await?.clone(), namespace);
        StatefulSet::patch_template_annotations(&stateful_sets, name, annotations).await
    }

    async fn rollout_status(&self, namespace: &str, workload: &WorkloadRef) -> Result<RolloutStatus> {
        let client = self.client().await?.clone();
        let status = match workload.kind {
            WorkloadKind::Stateless => Api::<Deployment>::namespaced(client, namespace)
                .get(&workload.name)
                .await
                .with_context(|| format!("Failed to get {}", workload))?
                .rollout_status(),
            WorkloadKind::Stateful => Api::<StatefulSet>::namespaced(client, namespace)
                .get(&workload.name)
                .await
                .with_context(|| format!("Failed to get {}", workload))?
                .rollout_status(),
        };
        Ok(status)
    }
}
