use std::{env, fmt};

/// Registry credential that prints "<REDACTED, length {length of the secret}>" for Debug/Display.
///
/// Only ever read from the process environment and handed to the container
/// runtime over stdin. There is deliberately no `Serialize` implementation.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: String) -> Self {
        SecretString(s)
    }

    /// Reads the secret from `var`. Unset and whitespace-only values yield `None`.
    pub fn from_env(var: &str) -> Option<Self> {
        env::var(var)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(SecretString)
    }

    /// Access the raw secret if explicitly needed
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    fn fmt_redacted_secret(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}
