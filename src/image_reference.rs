use std::fmt;

static DOCKER_HUB: &str = "docker.io";
static DOCKER_HUB_ALIASES: [&str; 2] = ["index.docker.io", "registry-1.docker.io"];

/// A tagged image name, either fully qualified against a registry
/// (`ghcr.io/acme/orders-api:1.4.0`) or bare for the cluster runtime (`orders-api:1.4.0`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub owner: Option<String>,
    pub repository: String,
    pub tag: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    MissingRepository,
    MissingTag,
    InvalidFormat(String),
    InvalidComponent(String),
    DigestNotAllowed,
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::DigestNotAllowed => write!(f, "digest references are not allowed"),
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::MissingTag => write!(f, "tag is missing"),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
            ParseError::InvalidComponent(part) => {
                write!(f, "invalid image name component: {:?}", part)
            }
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{}/", registry)?;
        }
        if let Some(owner) = &self.owner {
            write!(f, "{}/", owner)?;
        }
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl ImageReference {
    /// Fully qualified reference as pulled from the registry.
    pub fn remote(registry: &str, owner: &str, repository: &str, tag: &str) -> Result<Self, ParseError> {
        let owner = owner.trim_matches('/');
        validate_host(registry)?;
        for part in owner.split('/') {
            validate_component(part)?;
        }
        validate_component(repository)?;
        validate_tag(tag)?;
        Ok(Self {
            registry: Some(registry.to_string()),
            owner: Some(owner.to_string()),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Bare `repository:tag` reference used inside the cluster runtime.
    pub fn local(repository: &str, tag: &str) -> Result<Self, ParseError> {
        validate_component(repository)?;
        validate_tag(tag)?;
        Ok(Self {
            registry: None,
            owner: None,
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Same repository and tag with the registry and owner prefix dropped.
    pub fn to_local(&self) -> Self {
        Self {
            registry: None,
            owner: None,
            repository: self.repository.clone(),
            tag: self.tag.clone(),
        }
    }

    /// Spells out Docker Hub the way the runtime resolves it: an owner-qualified name
    /// without a registry lives on `docker.io`, whatever alias of it was used.
    pub fn canonical(&self) -> Self {
        let registry = match (self.registry.as_deref(), &self.owner) {
            (None, Some(_)) => Some(DOCKER_HUB.to_string()),
            (Some(host), _) if DOCKER_HUB_ALIASES.contains(&host) => Some(DOCKER_HUB.to_string()),
            (registry, _) => registry.map(str::to_string),
        };
        Self {
            registry,
            ..self.clone()
        }
    }

    /// Path below `/v2/` in the registry HTTP API, e.g. `acme/orders-api`.
    pub fn registry_path(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{}/{}", owner, self.repository),
            None => self.repository.clone(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseError> {
        // digest references are not supported
        if s.contains('@') {
            return Err(ParseError::DigestNotAllowed);
        }

        // Must contain a tag (colon after last slash)
        let (without_tag, tag) = if let Some(pos) = s.rfind(':') {
            let last_slash = s.rfind('/').unwrap_or(0);
            if pos > last_slash {
                (&s[..pos], Some(s[pos + 1..].to_string()))
            } else {
                (s, None)
            }
        } else {
            (s, None)
        };
        let tag = tag.ok_or(ParseError::MissingTag)?;
        validate_tag(&tag)?;

        let mut parts: Vec<&str> = without_tag.split('/').collect();
        let repository = parts.pop().unwrap_or_default();
        if repository.is_empty() {
            return Err(ParseError::MissingRepository);
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        // Only the first component can be a registry host, and only if it looks like one
        let registry = match parts.first() {
            Some(first) if looks_like_host(first) => Some(parts.remove(0)),
            _ => None,
        };
        let owner = (!parts.is_empty()).then(|| parts.join("/"));

        Ok(Self {
            registry: registry.map(str::to_string),
            owner,
            repository: repository.to_string(),
            tag,
        })
    }
}

fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn validate_component(part: &str) -> Result<(), ParseError> {
    let valid = !part.is_empty()
        && !part.starts_with(['.', '-', '_'])
        && part
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(ParseError::InvalidComponent(part.to_string()))
    }
}

fn validate_host(host: &str) -> Result<(), ParseError> {
    let valid = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'));
    if valid {
        Ok(())
    } else {
        Err(ParseError::InvalidComponent(host.to_string()))
    }
}

fn validate_tag(tag: &str) -> Result<(), ParseError> {
    if tag.is_empty() {
        return Err(ParseError::MissingTag);
    }
    let valid = tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(ParseError::InvalidComponent(tag.to_string()))
    }
}
