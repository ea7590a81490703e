use crate::cluster::{ClusterTarget, ControlPlane};
use crate::image_reference::ImageReference;
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Kinds whose pod templates are checked for pull policy mistakes.
static POD_TEMPLATE_KINDS: [&str; 5] = ["Deployment", "StatefulSet", "DaemonSet", "ReplicaSet", "Job"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{} in {}", self.kind, self.name, namespace),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A single resource definition read from the manifest directory.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub id: ResourceId,
    pub api_version: String,
    pub source: PathBuf,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedResource {
    /// Resource id when known, otherwise the file and document position
    pub resource: String,
    pub cause: String,
}

impl fmt::Display for RejectedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.resource, self.cause)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedSet {
    pub resources: Vec<ResourceId>,
}

/// Some resources were malformed or rejected. Those in `applied` did reach the cluster.
#[derive(Debug, Error)]
#[error(
    "{} manifest(s) rejected, {} applied: {}",
    .rejected.len(),
    .applied.resources.len(),
    join_rejected(.rejected)
)]
pub struct ApplyError {
    pub applied: AppliedSet,
    pub rejected: Vec<RejectedResource>,
}

fn join_rejected(rejected: &[RejectedResource]) -> String {
    rejected
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Everything read from a manifest directory, valid or not.
#[derive(Debug, Default)]
pub struct ManifestBatch {
    pub manifests: Vec<Manifest>,
    pub malformed: Vec<RejectedResource>,
}

impl ManifestBatch {
    /// Reads every file under `dir` matching one of `globs`, in path order.
    pub fn load(dir: &Path, globs: &[String]) -> Result<Self> {
        let matcher = build_glob_set(globs)?;
        let mut files = Vec::new();
        collect_files(dir, dir, &matcher, &mut files)?;
        files.sort();

        let mut batch = ManifestBatch::default();
        for file in files {
            let content = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read manifest file {}", file.display()))?;
            batch.read_documents(&file, &content);
        }
        info!(
            "Loaded {} manifest(s) from {} ({} malformed)",
            batch.manifests.len(),
            dir.display(),
            batch.malformed.len()
        );
        Ok(batch)
    }

    fn read_documents(&mut self, file: &Path, content: &str) {
        for (index, document) in serde_yaml_ng::Deserializer::from_str(content).enumerate() {
            let position = format!("{} document {}", file.display(), index + 1);
            match Value::deserialize(document) {
                Ok(Value::Null) => {}
                Ok(value) => self.push_value(file, &position, value),
                Err(e) => {
                    // the deserializer cannot resume after a syntax error
                    self.malformed.push(RejectedResource {
                        resource: position,
                        cause: e.to_string(),
                    });
                    break;
                }
            }
        }
    }

    fn push_value(&mut self, file: &Path, position: &str, value: Value) {
        if value.get("kind").and_then(Value::as_str) == Some("List") {
            let items = value
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for (index, item) in items.into_iter().enumerate() {
                self.push_value(file, &format!("{} item {}", position, index + 1), item);
            }
            return;
        }

        match manifest_from_value(file, value) {
            Ok(manifest) => self.manifests.push(manifest),
            Err(cause) => self.malformed.push(RejectedResource {
                resource: position.to_string(),
                cause,
            }),
        }
    }

    /// Containers that run a promoted local image but would still try to pull it from a registry.
    pub fn misconfigured_pull_policies(&self, local_images: &[ImageReference]) -> Vec<String> {
        let local_names: Vec<String> = local_images.iter().map(|r| r.to_string()).collect();
        let mut findings = Vec::new();

        for manifest in &self.manifests {
            if !POD_TEMPLATE_KINDS.contains(&manifest.id.kind.as_str()) {
                continue;
            }
            let containers = manifest
                .body
                .pointer("/spec/template/spec/containers")
                .and_then(Value::as_array);
            for container in containers.into_iter().flatten() {
                let Some(image) = container.get("image").and_then(Value::as_str) else {
                    continue;
                };
                if !local_names.iter().any(|name| name == image) {
                    continue;
                }
                let policy = container.get("imagePullPolicy").and_then(Value::as_str);
                let pulls_always = match policy {
                    Some(policy) => policy == "Always",
                    None => image.ends_with(":latest"),
                };
                if pulls_always {
                    let container_name = container
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("<unnamed>");
                    findings.push(format!("{} container {}", manifest.id, container_name));
                }
            }
        }
        findings
    }
}

fn build_glob_set(globs: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for glob in globs {
        builder.add(Glob::new(glob).with_context(|| format!("Invalid manifest glob {}", glob))?);
    }
    builder.build().context("Failed to build manifest glob set")
}

fn collect_files(root: &Path, dir: &Path, matcher: &GlobSet, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read manifest directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read manifest directory {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("Failed to inspect {}", path.display()))?;
        if file_type.is_dir() {
            collect_files(root, &path, matcher, files)?;
            continue;
        }
        // Symlinked directories are not followed
        if file_type.is_symlink() && path.is_dir() {
            debug!("Skipping symlinked directory {}", path.display());
            continue;
        }
        let file_name_matches = path.file_name().is_some_and(|name| matcher.is_match(name));
        let relative_matches = path
            .strip_prefix(root)
            .is_ok_and(|relative| matcher.is_match(relative));
        if file_name_matches || relative_matches {
            files.push(path);
        }
    }
    Ok(())
}

fn manifest_from_value(file: &Path, body: Value) -> Result<Manifest, String> {
    if !body.is_object() {
        return Err("manifest is not a mapping".to_string());
    }
    let api_version = body
        .get("apiVersion")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or("manifest missing apiVersion")?
        .to_string();
    let kind = body
        .get("kind")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or("manifest missing kind")?
        .to_string();
    let name = body
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("{} manifest missing metadata.name", kind))?
        .to_string();
    let namespace = body
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Manifest {
        id: ResourceId {
            kind,
            name,
            namespace,
        },
        api_version,
        source: file.to_path_buf(),
        body,
    })
}

/// Applies every manifest of the batch, continuing past rejections.
pub async fn apply_batch<C: ControlPlane>(
    control_plane: &C,
    namespace: &str,
    batch: ManifestBatch,
) -> Result<AppliedSet, ApplyError> {
    let mut applied = AppliedSet::default();
    let mut rejected = batch.malformed;

    for manifest in &batch.manifests {
        match control_plane.apply(namespace, manifest).await {
            Ok(()) => {
                info!("Applied {}", manifest.id);
                applied.resources.push(manifest.id.clone());
            }
            Err(e) => {
                warn!("Failed to apply {}: {:#}", manifest.id, e);
                rejected.push(RejectedResource {
                    resource: manifest.id.to_string(),
                    cause: format!("{:#}", e),
                });
            }
        }
    }

    if rejected.is_empty() {
        Ok(applied)
    } else {
        Err(ApplyError { applied, rejected })
    }
}

/// Loads the target's manifest directory and applies it as one batch.
pub async fn apply_directory<C: ControlPlane>(
    control_plane: &C,
    target: &ClusterTarget,
    local_images: &[ImageReference],
) -> Result<AppliedSet, ApplyError> {
    let batch = ManifestBatch::load(&target.manifest_dir, &target.manifest_globs).map_err(|e| {
        ApplyError {
            applied: AppliedSet::default(),
            rejected: vec![RejectedResource {
                resource: target.manifest_dir.display().to_string(),
                cause: format!("{:#}", e),
            }],
        }
    })?;

    for finding in batch.misconfigured_pull_policies(local_images) {
        warn!(
            "{} pulls a locally promoted image with imagePullPolicy Always, use IfNotPresent or Never",
            finding
        );
    }

    apply_batch(control_plane, &target.namespace, batch).await
}
