//! Publication credentials.
//!
//! Secrets are opaque: [`Secret`] has no `Serialize` impl and its `Debug`
//! and `Display` output is masked. Credentials are resolved at event time
//! from a [`CredentialSource`] and handed only to the publication stage.

use std::collections::HashMap;
use std::fmt;

pub const INDEX_USERNAME_VAR: &str = "WHEELHOUSE_INDEX_USERNAME";
pub const INDEX_PASSWORD_VAR: &str = "WHEELHOUSE_INDEX_PASSWORD";
pub const STORE_KEY_ID_VAR: &str = "WHEELHOUSE_STORE_KEY_ID";
pub const STORE_SECRET_VAR: &str = "WHEELHOUSE_STORE_SECRET";

const MASK: &str = "****";

/// Opaque secret string.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Reveal the secret. Only command environments should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

/// Package index username/password pair.
#[derive(Debug, Clone)]
pub struct IndexCredentials {
    pub username: Secret,
    pub password: Secret,
}

/// Object store key id/secret pair.
#[derive(Debug, Clone)]
pub struct StoreCredentials {
    pub key_id: Secret,
    pub secret: Secret,
}

/// Everything the publication stage may need. Either pair can be absent;
/// the stage that needs a missing pair fails with a publish error.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub index: Option<IndexCredentials>,
    pub store: Option<StoreCredentials>,
}

impl Credentials {
    /// Resolve credentials through a lookup function (environment, vault, test map).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let pair = |a: &str, b: &str| match (lookup(a), lookup(b)) {
            (Some(x), Some(y)) if !x.is_empty() && !y.is_empty() => {
                Some((Secret::new(x), Secret::new(y)))
            }
            _ => None,
        };
        Self {
            index: pair(INDEX_USERNAME_VAR, INDEX_PASSWORD_VAR)
                .map(|(username, password)| IndexCredentials { username, password }),
            store: pair(STORE_KEY_ID_VAR, STORE_SECRET_VAR)
                .map(|(key_id, secret)| StoreCredentials { key_id, secret }),
        }
    }

    /// All secret values, used to scrub captured command output.
    pub fn secret_values(&self) -> Vec<&str> {
        let mut values = Vec::new();
        if let Some(index) = &self.index {
            values.push(index.username.expose());
            values.push(index.password.expose());
        }
        if let Some(store) = &self.store {
            values.push(store.key_id.expose());
            values.push(store.secret.expose());
        }
        values
    }
}

/// Process-wide secret store consulted once per event.
pub trait CredentialSource: Send + Sync {
    fn resolve(&self) -> Credentials;
}

/// Reads credentials from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialSource;

impl CredentialSource for EnvCredentialSource {
    fn resolve(&self) -> Credentials {
        Credentials::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Fixed key/value credential source.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialSource {
    values: HashMap<String, String>,
}

impl StaticCredentialSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }
}

impl CredentialSource for StaticCredentialSource {
    fn resolve(&self) -> Credentials {
        Credentials::from_lookup(|key| self.values.get(key).cloned())
    }
}

/// Replace every occurrence of any secret in `text` with a mask.
pub fn redact(text: &str, secrets: &[&str]) -> String {
    let mut out = text.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        out = out.replace(secret, MASK);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_masked_in_debug_and_display() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), MASK);
        assert_eq!(format!("{secret}"), MASK);
        assert_eq!(secret.expose(), "hunter2");

        let creds = IndexCredentials {
            username: Secret::new("alice"),
            password: Secret::new("hunter2"),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_from_lookup_requires_both_halves() {
        let source = StaticCredentialSource::new().with(INDEX_USERNAME_VAR, "alice");
        let creds = source.resolve();
        assert!(creds.index.is_none());
        assert!(creds.store.is_none());

        let source = StaticCredentialSource::new()
            .with(INDEX_USERNAME_VAR, "alice")
            .with(INDEX_PASSWORD_VAR, "hunter2")
            .with(STORE_KEY_ID_VAR, "AKIA")
            .with(STORE_SECRET_VAR, "s3cr3t");
        let creds = source.resolve();
        assert!(creds.index.is_some());
        assert!(creds.store.is_some());
        assert_eq!(creds.secret_values().len(), 4);
    }

    #[test]
    fn test_redact_replaces_all_occurrences() {
        let out = redact("user alice pass hunter2 hunter2", &["hunter2", "alice", ""]);
        assert_eq!(out, "user **** pass **** ****");
    }
}
