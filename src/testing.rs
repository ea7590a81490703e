//! In-memory registry, image store and control plane sharing one call log.

use crate::cluster::ControlPlane;
use crate::config::Config;
use crate::image_reference::ImageReference;
use crate::image_store::{CleanupError, ImageStore, Removal, TagError};
use crate::manifest::Manifest;
use crate::registry::{AuthError, PullError, PulledImage, Registry, Session};
use crate::rollout::{RolloutStatus, WorkloadRef};
use crate::secret_string::SecretString;
use anyhow::{Result, bail};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Login { host: String, username: String },
    Pull(String),
    Tag { source: String, target: String },
    Remove(String),
    Prune,
    List,
    ServerVersion,
    NamespaceExists(String),
    Apply(String),
    RestartDeployment(String),
    PatchStatefulSet {
        name: String,
        annotations: BTreeMap<String, String>,
    },
    RolloutStatus(String),
}

#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn record(&self, call: Call) {
        self.0.lock().expect("call log poisoned").push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().expect("call log poisoned").clone()
    }
}

pub fn test_config(manifest_dir: &Path) -> Config {
    let yaml = format!(
        r#"
registry:
  host: ghcr.io
  owner: acme
  username: acme-bot
images:
  tag: "1.4.0"
  names: [orders-api, orders-db]
cluster:
  namespace: orders
  manifestDir: {}
workloads:
  deployment: orders-api
  statefulSet: orders-db
"#,
        manifest_dir.display()
    );
    serde_yaml_ng::from_str(&yaml).expect("test config should parse")
}

/// Registry and local image store in one, like a container runtime.
pub struct FakeDocker {
    pub log: CallLog,
    /// Remote references the registry can serve
    pub catalog: Vec<ImageReference>,
    pub images: Mutex<BTreeSet<ImageReference>>,
    pub accepted_token: String,
    pub network_down: bool,
    pub fail_cleanup: bool,
}

impl Default for FakeDocker {
    fn default() -> Self {
        FakeDocker {
            log: CallLog::default(),
            catalog: Vec::new(),
            images: Mutex::new(BTreeSet::new()),
            accepted_token: "ghp_token".to_string(),
            network_down: false,
            fail_cleanup: false,
        }
    }
}

impl FakeDocker {
    pub fn with_images(images: &[ImageReference]) -> Self {
        FakeDocker {
            images: Mutex::new(images.iter().cloned().collect()),
            ..Default::default()
        }
    }

    pub fn with_catalog(catalog: &[ImageReference]) -> Self {
        FakeDocker {
            catalog: catalog.to_vec(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.calls()
    }

    pub fn local_images(&self) -> Vec<ImageReference> {
        self.images
            .lock()
            .expect("image store poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn cleanup_error(&self, operation: &str) -> CleanupError {
        CleanupError {
            operation: operation.to_string(),
            message: "runtime busy".to_string(),
        }
    }
}

impl Registry for FakeDocker {
    async fn login(
        &self,
        host: &str,
        username: &str,
        credential: &SecretString,
    ) -> Result<Session, AuthError> {
        self.log.record(Call::Login {
            host: host.to_string(),
            username: username.to_string(),
        });
        if credential.expose_secret() != self.accepted_token {
            return Err(AuthError::Rejected {
                host: host.to_string(),
                username: username.to_string(),
                message: "unauthorized".to_string(),
            });
        }
        Ok(Session {
            host: host.to_string(),
            username: username.to_string(),
            credential: credential.clone(),
        })
    }

    async fn pull(&self, _session: &Session, reference: &ImageReference) -> Result<PulledImage, PullError> {
        self.log.record(Call::Pull(reference.to_string()));
        if self.network_down {
            return Err(PullError::Network {
                reference: reference.clone(),
                message: "dial tcp: i/o timeout".to_string(),
            });
        }
        if !self.catalog.contains(reference) {
            return Err(PullError::ImageNotFound {
                reference: reference.clone(),
            });
        }
        self.images
            .lock()
            .expect("image store poisoned")
            .insert(reference.clone());
        Ok(PulledImage {
            reference: reference.clone(),
            image_id: format!("sha256:{}", reference.repository),
        })
    }
}

impl ImageStore for FakeDocker {
    async fn tag(&self, pulled: &PulledImage, target: &ImageReference) -> Result<(), TagError> {
        self.log.record(Call::Tag {
            source: pulled.reference.to_string(),
            target: target.to_string(),
        });
        let mut images = self.images.lock().expect("image store poisoned");
        if !images.contains(&pulled.reference) {
            return Err(TagError::SourceMissing {
                reference: pulled.reference.clone(),
            });
        }
        images.insert(target.clone());
        Ok(())
    }

    async fn remove_if_present(&self, reference: &ImageReference) -> Result<Removal, CleanupError> {
        self.log.record(Call::Remove(reference.to_string()));
        if self.fail_cleanup {
            return Err(self.cleanup_error("removing image"));
        }
        if self
            .images
            .lock()
            .expect("image store poisoned")
            .remove(reference)
        {
            Ok(Removal::Removed)
        } else {
            Ok(Removal::Absent)
        }
    }

    async fn prune(&self) -> Result<(), CleanupError> {
        self.log.record(Call::Prune);
        if self.fail_cleanup {
            return Err(self.cleanup_error("pruning dangling images"));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ImageReference>, CleanupError> {
        self.log.record(Call::List);
        Ok(self.local_images())
    }
}

pub struct FakeCluster {
    pub log: CallLog,
    pub unreachable: bool,
    pub namespaces: Vec<String>,
    /// Resource names the control plane refuses to apply
    pub rejected_names: Vec<String>,
    /// Number of status polls answered as not ready
    pub polls_until_ready: usize,
    pub polls: AtomicUsize,
}

impl Default for FakeCluster {
    fn default() -> Self {
        FakeCluster {
            log: CallLog::default(),
            unreachable: false,
            namespaces: vec!["default".to_string(), "orders".to_string()],
            rejected_names: Vec::new(),
            polls_until_ready: 0,
            polls: AtomicUsize::new(0),
        }
    }
}

impl FakeCluster {
    pub fn calls(&self) -> Vec<Call> {
        self.log.calls()
    }
}

impl ControlPlane for FakeCluster {
    async fn server_version(&self) -> Result<String> {
        self.log.record(Call::ServerVersion);
        if self.unreachable {
            bail!("connection refused");
        }
        Ok("1.31".to_string())
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        self.log.record(Call::NamespaceExists(namespace.to_string()));
        Ok(self.namespaces.iter().any(|n| n == namespace))
    }

    async fn apply(&self, _namespace: &str, manifest: &Manifest) -> Result<()> {
        self.log.record(Call::Apply(manifest.id.to_string()));
        if self.rejected_names.contains(&manifest.id.name) {
            bail!("admission webhook denied {}", manifest.id);
        }
        Ok(())
    }

    async fn restart_deployment(&self, _namespace: &str, name: &str) -> Result<()> {
        self.log.record(Call::RestartDeployment(name.to_string()));
        Ok(())
    }

    async fn patch_stateful_set_template(
        &self,
        _namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.log.record(Call::PatchStatefulSet {
            name: name.to_string(),
            annotations: annotations.clone(),
        });
        Ok(())
    }

    async fn rollout_status(&self, _namespace: &str, workload: &WorkloadRef) -> Result<RolloutStatus> {
        self.log.record(Call::RolloutStatus(workload.to_string()));
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        let ready = poll > self.polls_until_ready;
        Ok(RolloutStatus {
            desired: 1,
            updated: 1,
            ready: i32::from(ready),
            generation_observed: true,
            revision_settled: true,
        })
    }
}
