use crate::image_reference::ImageReference;
use crate::rollout::{WorkloadKind, WorkloadRef};
use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

static DEFAULT_TOKEN_ENV: &str = "CR_PAT";
static DEFAULT_MANIFEST_GLOBS: [&str; 3] = ["*.yaml", "*.yml", "*.json"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub registry: Registry,
    pub images: Images,
    pub cluster: Cluster,
    pub workloads: Workloads,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub rollout: Rollout,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub host: String,
    pub owner: String,
    pub username: String,
    /// Name of the environment variable holding the registry token
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_true")]
    pub manifest_probe: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Images {
    pub tag: String,
    pub names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub namespace: String,
    pub manifest_dir: PathBuf,
    #[serde(default = "default_manifest_globs")]
    pub manifest_globs: Vec<String>,
    /// kubeconfig context, the current context is used when unset
    #[serde(default)]
    pub kube_context: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workloads {
    pub deployment: String,
    pub stateful_set: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    #[serde(default = "default_runtime_binary")]
    pub binary: String,
    /// Extra environment for the runtime CLI, e.g. the output of `minikube docker-env`
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub prune: bool,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime {
            binary: default_runtime_binary(),
            env: BTreeMap::new(),
            prune: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub wait_for_ready: bool,
    #[serde(default = "default_ready_timeout_seconds")]
    pub ready_timeout_seconds: u64,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
}

impl Default for Rollout {
    fn default() -> Self {
        Rollout {
            wait_for_ready: false,
            ready_timeout_seconds: default_ready_timeout_seconds(),
            poll_interval_seconds: default_poll_interval_seconds(),
        }
    }
}

impl Rollout {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_true() -> bool {
    true
}

fn default_manifest_globs() -> Vec<String> {
    DEFAULT_MANIFEST_GLOBS.iter().map(|g| g.to_string()).collect()
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_ready_timeout_seconds() -> u64 {
    300
}

fn default_poll_interval_seconds() -> u64 {
    5
}

impl Config {
    /// Remote references of the configured images, in configuration order.
    pub fn remote_images(&self) -> Result<Vec<ImageReference>> {
        self.images
            .names
            .iter()
            .map(|name| {
                ImageReference::remote(
                    &self.registry.host,
                    &self.registry.owner,
                    name,
                    &self.images.tag,
                )
                .with_context(|| format!("Invalid image {} with tag {}", name, self.images.tag))
            })
            .collect()
    }

    pub fn stateless_workload(&self) -> WorkloadRef {
        WorkloadRef::new(&self.workloads.deployment, WorkloadKind::Stateless)
    }

    pub fn stateful_workload(&self) -> WorkloadRef {
        WorkloadRef::new(&self.workloads.stateful_set, WorkloadKind::Stateful)
    }

    fn validate(&self) -> Result<()> {
        if self.images.names.is_empty() {
            bail!("images.names must list at least one image");
        }
        let mut seen = BTreeSet::new();
        for name in &self.images.names {
            if !seen.insert(name) {
                bail!("Image {} is listed more than once in images.names", name);
            }
        }
        self.remote_images()?;
        if self.cluster.namespace.trim().is_empty() {
            bail!("cluster.namespace must not be empty");
        }
        if self.workloads.deployment.trim().is_empty() || self.workloads.stateful_set.trim().is_empty() {
            bail!("workloads.deployment and workloads.statefulSet must both be set");
        }
        if self.cluster.manifest_globs.is_empty() {
            bail!("cluster.manifestGlobs must contain at least one pattern");
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.validate()?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}
