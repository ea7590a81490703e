use crate::image_reference::ImageReference;
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap};
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

static MANIFEST_MEDIA_TYPES: [&str; 4] = [
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];
/// Set by registries speaking the distribution API; a 404 without it may come from any web server.
static DISTRIBUTION_API_VERSION: &str = "Docker-Distribution-API-Version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Found { digest: Option<String> },
    NotFound,
    /// The registry answered but the answer says nothing definite, e.g. a token exchange is required
    Inconclusive(StatusCode),
}

/// Asks the registry HTTP API whether a manifest exists before the runtime starts a pull.
#[derive(Clone)]
pub struct ManifestProbe {
    client: Client,
}

pub fn create_client() -> Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    Client::builder()
        .build()
        .context("Failed to build HTTP client")
}

impl ManifestProbe {
    pub fn new(client: Client) -> Self {
        ManifestProbe { client }
    }

    /// A transport error means the registry API could not be reached from here,
    /// which says nothing about whether the runtime can pull.
    pub async fn probe(
        &self,
        image_reference: &ImageReference,
        registry_auth_token: &SecretString,
    ) -> Result<ProbeOutcome> {
        let registry = image_reference
            .registry
            .as_deref()
            .context("Only remote image references can be probed")?;
        let url = format!(
            "https://{}/v2/{}/manifests/{}",
            registry,
            image_reference.registry_path(),
            image_reference.tag
        );

        debug!("Probing OCI image manifest at URL {}", url);
        let response = self
            .client
            .head(&url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPES.join(", "))
            .header(
                AUTHORIZATION,
                format!("Bearer {}", registry_auth_token.expose_secret()),
            )
            .send()
            .await
            .with_context(|| format!("Failed to reach registry {}", registry))?;

        Ok(classify_response(response.status(), response.headers()))
    }
}

fn classify_response(status: StatusCode, headers: &HeaderMap) -> ProbeOutcome {
    if status.is_success() {
        ProbeOutcome::Found {
            digest: get_digest_from_headers(headers),
        }
    } else if status == StatusCode::NOT_FOUND && headers.contains_key(DISTRIBUTION_API_VERSION) {
        ProbeOutcome::NotFound
    } else {
        ProbeOutcome::Inconclusive(status)
    }
}

fn get_digest_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Docker-Content-Digest")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}
