use crate::image_reference::ImageReference;
use crate::image_store::{CleanupError, ImageStore, Removal, TagError};
use crate::oci_registry::{ManifestProbe, ProbeOutcome};
use crate::registry::{AuthError, PullError, PulledImage, Registry, Session};
use crate::secret_string::SecretString;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

static NOT_FOUND_MARKERS: [&str; 5] = [
    "manifest unknown",
    "not found",
    "does not exist",
    "repository name not known",
    "no such image",
];
static NETWORK_MARKERS: [&str; 8] = [
    "dial tcp",
    "i/o timeout",
    "connection refused",
    "connection reset",
    "no such host",
    "tls handshake timeout",
    "context deadline exceeded",
    "network is unreachable",
];
static REJECTED_LOGIN_MARKERS: [&str; 4] = [
    "unauthorized",
    "denied",
    "incorrect username or password",
    "authentication required",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullFailure {
    NotFound,
    Network,
    Other,
}

/// Talks to the container runtime the cluster runs images from through its CLI.
///
/// `env` carries the runtime connection, e.g. `DOCKER_HOST` as printed by `minikube docker-env`.
pub struct DockerCli {
    binary: String,
    env: BTreeMap<String, String>,
    manifest_probe: Option<ManifestProbe>,
}

impl DockerCli {
    pub fn new(binary: &str, env: BTreeMap<String, String>) -> Self {
        DockerCli {
            binary: binary.to_string(),
            env,
            manifest_probe: None,
        }
    }

    pub fn with_manifest_probe(mut self, probe: ManifestProbe) -> Self {
        self.manifest_probe = Some(probe);
        self
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.envs(&self.env)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn login_command(&self, host: &str, username: &str) -> Command {
        let mut cmd = self.command(["login", host, "--username", username, "--password-stdin"]);
        cmd.stdin(Stdio::piped());
        cmd
    }

    async fn run(&self, mut cmd: Command) -> std::io::Result<Output> {
        debug!(command = ?cmd.as_std(), "Running container runtime command");
        cmd.output().await
    }

    async fn login_with_stdin(&self, host: &str, username: &str, credential: &SecretString) -> std::io::Result<Output> {
        let mut cmd = self.login_command(host, username);
        debug!(command = ?cmd.as_std(), "Running registry login");
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(credential.expose_secret().as_bytes()).await?;
            stdin.shutdown().await?;
        }
        child.wait_with_output().await
    }

    async fn image_id(&self, reference: &ImageReference) -> std::io::Result<Output> {
        self.run(self.command([
            "image",
            "inspect",
            "--format",
            "{{.Id}}",
            reference.to_string().as_str(),
        ]))
        .await
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn contains_any(haystack: &str, markers: &[&str]) -> bool {
    let haystack = haystack.to_lowercase();
    markers.iter().any(|marker| haystack.contains(marker))
}

fn classify_pull_failure(stderr: &str) -> PullFailure {
    if contains_any(stderr, &NETWORK_MARKERS) {
        PullFailure::Network
    } else if contains_any(stderr, &NOT_FOUND_MARKERS) {
        PullFailure::NotFound
    } else {
        PullFailure::Other
    }
}

fn is_rejected_login(stderr: &str) -> bool {
    contains_any(stderr, &REJECTED_LOGIN_MARKERS)
}

fn is_missing_image(stderr: &str) -> bool {
    contains_any(stderr, &["no such image"])
}

impl Registry for DockerCli {
    async fn login(
        &self,
        host: &str,
        username: &str,
        credential: &SecretString,
    ) -> Result<Session, AuthError> {
        info!("Logging in to registry {} as {}", host, username);
        let output = self
            .login_with_stdin(host, username, credential)
            .await
            .map_err(|e| AuthError::Unreachable {
                host: host.to_string(),
                message: format!("failed to run {}: {}", self.binary, e),
            })?;

        if !output.status.success() {
            let message = stderr_of(&output);
            return Err(if is_rejected_login(&message) {
                AuthError::Rejected {
                    host: host.to_string(),
                    username: username.to_string(),
                    message,
                }
            } else {
                AuthError::Unreachable {
                    host: host.to_string(),
                    message,
                }
            });
        }

        Ok(Session {
            host: host.to_string(),
            username: username.to_string(),
            credential: credential.clone(),
        })
    }

    async fn pull(&self, session: &Session, reference: &ImageReference) -> Result<PulledImage, PullError> {
        if let Some(probe) = &self.manifest_probe {
            match probe.probe(reference, &session.credential).await {
                Ok(ProbeOutcome::NotFound) => {
                    return Err(PullError::ImageNotFound {
                        reference: reference.clone(),
                    });
                }
                Ok(ProbeOutcome::Found { digest }) => {
                    debug!("Registry has {} at digest {:?}", reference, digest)
                }
                Ok(ProbeOutcome::Inconclusive(status)) => {
                    debug!("Manifest probe for {} returned {}, pulling anyway", reference, status)
                }
                Err(e) => {
                    debug!("Manifest probe for {} failed, pulling anyway: {:#}", reference, e)
                }
            }
        }

        info!("Pulling image {}", reference);
        let output = self
            .run(self.command(["pull", reference.to_string().as_str()]))
            .await
            .map_err(|e| PullError::Runtime {
                reference: reference.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let message = stderr_of(&output);
            return Err(match classify_pull_failure(&message) {
                PullFailure::NotFound => PullError::ImageNotFound {
                    reference: reference.clone(),
                },
                PullFailure::Network => PullError::Network {
                    reference: reference.clone(),
                    message,
                },
                PullFailure::Other => PullError::Runtime {
                    reference: reference.clone(),
                    message,
                },
            });
        }

        let inspected = self.image_id(reference).await.map_err(|e| PullError::Runtime {
            reference: reference.clone(),
            message: e.to_string(),
        })?;
        if !inspected.status.success() {
            return Err(PullError::Runtime {
                reference: reference.clone(),
                message: stderr_of(&inspected),
            });
        }

        Ok(PulledImage {
            reference: reference.clone(),
            image_id: String::from_utf8_lossy(&inspected.stdout).trim().to_string(),
        })
    }
}

impl ImageStore for DockerCli {
    async fn tag(&self, pulled: &PulledImage, target: &ImageReference) -> Result<(), TagError> {
        let output = self
            .run(self.command(["tag", pulled.reference.to_string().as_str(), target.to_string().as_str()]))
            .await
            .map_err(|e| TagError::Runtime {
                source_ref: pulled.reference.clone(),
                target: target.clone(),
                message: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(());
        }
        let message = stderr_of(&output);
        if is_missing_image(&message) {
            Err(TagError::SourceMissing {
                reference: pulled.reference.clone(),
            })
        } else {
            Err(TagError::Runtime {
                source_ref: pulled.reference.clone(),
                target: target.clone(),
                message,
            })
        }
    }

    async fn remove_if_present(&self, reference: &ImageReference) -> Result<Removal, CleanupError> {
        let output = self
            .run(self.command(["image", "rm", reference.to_string().as_str()]))
            .await
            .map_err(|e| CleanupError {
                operation: format!("removing {}", reference),
                message: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(Removal::Removed);
        }
        let message = stderr_of(&output);
        if is_missing_image(&message) {
            Ok(Removal::Absent)
        } else {
            Err(CleanupError {
                operation: format!("removing {}", reference),
                message,
            })
        }
    }

    async fn prune(&self) -> Result<(), CleanupError> {
        let output = self
            .run(self.command(["image", "prune", "--force"]))
            .await
            .map_err(|e| CleanupError {
                operation: "pruning dangling images".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(CleanupError {
                operation: "pruning dangling images".to_string(),
                message: stderr_of(&output),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(reclaimed) = stdout.lines().find(|l| l.starts_with("Total reclaimed space")) {
            info!("Pruned dangling images, {}", reclaimed);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ImageReference>, CleanupError> {
        let output = self
            .run(self.command(["image", "ls", "--format", "{{.Repository}}:{{.Tag}}"]))
            .await
            .map_err(|e| CleanupError {
                operation: "listing images".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(CleanupError {
                operation: "listing images".to_string(),
                message: stderr_of(&output),
            });
        }
        Ok(parse_image_listing(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Untagged (`<none>`) and digest-only entries are skipped.
fn parse_image_listing(listing: &str) -> Vec<ImageReference> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match ImageReference::parse(line) {
            Ok(reference) => Some(reference),
            Err(e) => {
                debug!("Skipping image listing entry {}: {}", line, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_command_keeps_credential_out_of_arguments() {
        let docker = DockerCli::new(
            "docker",
            BTreeMap::from([("DOCKER_HOST".to_string(), "tcp://192.168.49.2:2376".to_string())]),
        );

        let cmd = docker.login_command("ghcr.io", "acme-bot");

        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["login", "ghcr.io", "--username", "acme-bot", "--password-stdin"]
        );
        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        assert_eq!(
            envs,
            vec![(OsStr::new("DOCKER_HOST"), Some(OsStr::new("tcp://192.168.49.2:2376")))]
        );
    }

    #[test]
    fn test_classify_pull_failure() {
        assert_eq!(
            classify_pull_failure(
                "Error response from daemon: manifest unknown: manifest unknown"
            ),
            PullFailure::NotFound
        );
        assert_eq!(
            classify_pull_failure(
                "Error response from daemon: Get \"https://ghcr.io/v2/\": dial tcp: lookup ghcr.io: no such host"
            ),
            PullFailure::Network
        );
        assert_eq!(
            classify_pull_failure("Error response from daemon: Head \"https://ghcr.io/v2/acme/orders-api/manifests/1.4.0\": context deadline exceeded"),
            PullFailure::Network
        );
        assert_eq!(
            classify_pull_failure("Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
            PullFailure::Other
        );
    }

    #[test]
    fn test_login_failure_classification() {
        assert!(is_rejected_login(
            "Error response from daemon: Get \"https://ghcr.io/v2/\": denied: denied"
        ));
        assert!(is_rejected_login("unauthorized: incorrect username or password"));
        assert!(!is_rejected_login("dial tcp 140.82.112.34:443: i/o timeout"));
    }

    #[test]
    fn test_missing_image_detection() {
        assert!(is_missing_image(
            "Error response from daemon: No such image: ghcr.io/acme/orders-api:1.4.0"
        ));
        assert!(!is_missing_image(
            "Error response from daemon: conflict: unable to remove repository reference"
        ));
    }

    #[test]
    fn test_parse_image_listing() {
        let listing = "ghcr.io/acme/orders-api:1.4.0\norders-api:1.4.0\n<none>:<none>\n\npostgres:16\n";

        let references = parse_image_listing(listing);

        let names: Vec<String> = references.iter().map(|r| r.to_string()).collect();
        assert_eq!(
            names,
            vec!["ghcr.io/acme/orders-api:1.4.0", "orders-api:1.4.0", "postgres:16"]
        );
    }

    /// A stand-in runtime binary. It records argv, `DOCKER_HOST` and, for `login`, stdin,
    /// then runs `behaviour` with the original arguments.
    #[cfg(unix)]
    struct ScriptedRuntime {
        dir: tempfile::TempDir,
    }

    #[cfg(unix)]
    impl ScriptedRuntime {
        fn new(behaviour: &str) -> Self {
            use std::os::unix::fs::PermissionsExt;

            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("calls.log");
            let script = format!(
                "#!/bin/sh\n\
                 echo \"args: $*\" >> '{log}'\n\
                 echo \"env: $DOCKER_HOST\" >> '{log}'\n\
                 if [ \"$1\" = login ]; then echo \"stdin: $(cat)\" >> '{log}'; fi\n\
                 {behaviour}\n",
                log = log.display(),
            );
            let path = dir.path().join("docker");
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            ScriptedRuntime { dir }
        }

        fn cli(&self) -> DockerCli {
            DockerCli::new(
                &self.dir.path().join("docker").display().to_string(),
                BTreeMap::from([("DOCKER_HOST".to_string(), "tcp://192.168.49.2:2376".to_string())]),
            )
        }

        fn log(&self) -> String {
            std::fs::read_to_string(self.dir.path().join("calls.log")).unwrap_or_default()
        }
    }

    #[cfg(unix)]
    fn remote() -> ImageReference {
        ImageReference::remote("ghcr.io", "acme", "orders-api", "1.4.0").unwrap()
    }

    #[cfg(unix)]
    fn session() -> Session {
        Session {
            host: "ghcr.io".to_string(),
            username: "acme-bot".to_string(),
            credential: SecretString::new("ghp_s3cr3t".to_string()),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_login_sends_credential_on_stdin_only() {
        let runtime = ScriptedRuntime::new("exit 0");

        let session = runtime
            .cli()
            .login("ghcr.io", "acme-bot", &SecretString::new("ghp_s3cr3t".to_string()))
            .await
            .unwrap();

        assert_eq!(session.host, "ghcr.io");
        let log = runtime.log();
        assert!(log.contains("args: login ghcr.io --username acme-bot --password-stdin\n"));
        assert!(log.contains("env: tcp://192.168.49.2:2376\n"));
        assert!(log.contains("stdin: ghp_s3cr3t\n"));
        let args_lines: Vec<&str> = log.lines().filter(|l| l.starts_with("args:")).collect();
        assert!(args_lines.iter().all(|l| !l.contains("ghp_s3cr3t")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_login_rejected_by_registry() {
        let runtime = ScriptedRuntime::new(
            "echo 'Error response from daemon: Get \"https://ghcr.io/v2/\": unauthorized' >&2; exit 1",
        );

        let err = runtime
            .cli()
            .login("ghcr.io", "acme-bot", &SecretString::new("ghp_wrong".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Rejected { .. }));
        assert!(!err.to_string().contains("ghp_wrong"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pull_reads_image_id() {
        let runtime = ScriptedRuntime::new(
            "case \"$1\" in image) echo sha256:5d41402abc4b ;; esac; exit 0",
        );

        let pulled = runtime.cli().pull(&session(), &remote()).await.unwrap();

        assert_eq!(pulled.image_id, "sha256:5d41402abc4b");
        assert!(runtime.log().contains("args: pull ghcr.io/acme/orders-api:1.4.0\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pull_maps_runtime_failures() {
        let missing = ScriptedRuntime::new(
            "echo 'Error response from daemon: manifest unknown: manifest unknown' >&2; exit 1",
        );
        let err = missing.cli().pull(&session(), &remote()).await.unwrap_err();
        assert!(matches!(err, PullError::ImageNotFound { .. }));

        let offline = ScriptedRuntime::new(
            "echo 'Error response from daemon: Get \"https://ghcr.io/v2/\": dial tcp: i/o timeout' >&2; exit 1",
        );
        let err = offline.cli().pull(&session(), &remote()).await.unwrap_err();
        assert!(matches!(err, PullError::Network { .. }));
        assert_eq!(offline.log().matches("args: pull").count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pull_proceeds_when_registry_api_is_unreachable() {
        let runtime = ScriptedRuntime::new(
            "case \"$1\" in image) echo sha256:5d41402abc4b ;; esac; exit 0",
        );
        let client = reqwest::Client::builder()
            .tls_built_in_root_certs(false)
            .no_proxy()
            .build()
            .unwrap();
        let docker = runtime.cli().with_manifest_probe(ManifestProbe::new(client));
        let reference = ImageReference::remote("localhost:1", "acme", "orders-api", "1.4.0").unwrap();

        let pulled = docker.pull(&session(), &reference).await.unwrap();

        assert_eq!(pulled.reference, reference);
        assert!(runtime.log().contains("args: pull localhost:1/acme/orders-api:1.4.0\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tag_of_unknown_image_is_source_missing() {
        let runtime = ScriptedRuntime::new(
            "echo 'Error response from daemon: No such image: ghcr.io/acme/orders-api:1.4.0' >&2; exit 1",
        );
        let pulled = PulledImage {
            reference: remote(),
            image_id: "sha256:5d41402abc4b".to_string(),
        };

        let err = runtime.cli().tag(&pulled, &remote().to_local()).await.unwrap_err();

        assert!(matches!(err, TagError::SourceMissing { .. }));
        assert!(runtime.log().contains("args: tag ghcr.io/acme/orders-api:1.4.0 orders-api:1.4.0\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_if_present() {
        let present = ScriptedRuntime::new("echo 'Untagged: ghcr.io/acme/orders-api:1.4.0'; exit 0");
        assert_eq!(present.cli().remove_if_present(&remote()).await.unwrap(), Removal::Removed);

        let absent = ScriptedRuntime::new(
            "echo 'Error response from daemon: No such image: ghcr.io/acme/orders-api:1.4.0' >&2; exit 1",
        );
        assert_eq!(absent.cli().remove_if_present(&remote()).await.unwrap(), Removal::Absent);

        let busy = ScriptedRuntime::new(
            "echo 'Error response from daemon: conflict: unable to remove repository reference' >&2; exit 1",
        );
        let err = busy.cli().remove_if_present(&remote()).await.unwrap_err();
        assert!(err.message.contains("conflict"));
    }
}
