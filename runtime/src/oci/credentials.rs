//! Registry credential providers.
//!
//! Credentials are looked up per registry host from, in order:
//! environment variables, the vmpull credential file
//! (`$VMPULL_HOME/auth/credentials.json`), and `~/.docker/config.json`.
//! When none has an entry the registry is accessed anonymously.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use vmpull_core::config::StorageConfig;
use vmpull_core::error::{Result, VmError};

use super::auth::Credentials;

pub const USERNAME_ENV: &str = "VMPULL_REGISTRY_USERNAME";
pub const PASSWORD_ENV: &str = "VMPULL_REGISTRY_PASSWORD";
pub const TOKEN_ENV: &str = "VMPULL_REGISTRY_TOKEN";

/// Source of registry credentials.
pub trait CredentialProvider: Send + Sync {
    /// Credentials for `host`, or `None` if this provider has no entry.
    fn credentials_for(&self, host: &str) -> Result<Option<Credentials>>;
}

/// Credentials injected through environment variables.
///
/// A token takes precedence over a username/password pair. The pair is only
/// used when both halves are set.
pub struct EnvCredentials {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl EnvCredentials {
    pub fn from_env() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }
}

impl CredentialProvider for EnvCredentials {
    fn credentials_for(&self, _host: &str) -> Result<Option<Credentials>> {
        let get = |key: &str| (self.lookup)(key).filter(|v| !v.is_empty());
        if let Some(token) = get(TOKEN_ENV) {
            return Ok(Some(Credentials::Token(token)));
        }
        match (get(USERNAME_ENV), get(PASSWORD_ENV)) {
            (Some(username), Some(password)) => Ok(Some(Credentials::basic(username, password))),
            _ => Ok(None),
        }
    }
}

/// Per-registry credential entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialEntry {
    username: String,
    password: String,
}

/// Persistent credential file format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    registries: HashMap<String, CredentialEntry>,
}

/// Persistent credential store at `$VMPULL_HOME/auth/credentials.json`.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Credential store inside the configured vmpull home.
    pub fn for_storage(storage: &StorageConfig) -> Self {
        Self::new(storage.credentials_path())
    }

    /// Create a credential store at a custom path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store credentials for a registry. Overwrites existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.load()?;
        file.registries.insert(
            normalize_registry(registry),
            CredentialEntry {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.save(&file)
    }

    /// Get credentials for a registry. Returns `(username, password)`.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file = self.load()?;
        Ok(file
            .registries
            .get(&normalize_registry(registry))
            .map(|e| (e.username.clone(), e.password.clone())))
    }

    /// Remove credentials for a registry. Returns true if entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.load()?;
        let removed = file
            .registries
            .remove(&normalize_registry(registry))
            .is_some();
        if removed {
            self.save(&file)?;
        }
        Ok(removed)
    }

    fn load(&self) -> Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            VmError::ConfigError(format!(
                "Failed to read credential store {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            VmError::ConfigError(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Write tmp, then rename over the real file.
    fn save(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VmError::ConfigError(format!(
                    "Failed to create credential store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let data = serde_json::to_string_pretty(file)?;
        std::fs::write(&tmp_path, &data).map_err(|e| {
            VmError::ConfigError(format!(
                "Failed to write credential store {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            VmError::ConfigError(format!(
                "Failed to rename credential store {} -> {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

impl CredentialProvider for CredentialStore {
    fn credentials_for(&self, host: &str) -> Result<Option<Credentials>> {
        Ok(self
            .get(host)?
            .map(|(username, password)| Credentials::basic(username, password)))
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "registrytoken")]
    registry_token: Option<String>,
}

/// Reads static `auths` entries from a docker-style `config.json`.
///
/// Credential helpers (`credsStore`, `credHelpers`) are not consulted.
pub struct DockerConfigCredentials {
    path: PathBuf,
}

impl DockerConfigCredentials {
    /// `~/.docker/config.json`, if a home directory exists.
    pub fn default_path() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(".docker").join("config.json")))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<DockerConfigFile> {
        if !self.path.exists() {
            return Ok(DockerConfigFile::default());
        }
        let data = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&data).map_err(|e| {
            VmError::ConfigError(format!(
                "Failed to parse docker config {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

impl CredentialProvider for DockerConfigCredentials {
    fn credentials_for(&self, host: &str) -> Result<Option<Credentials>> {
        let config = self.load()?;
        let wanted = normalize_registry(host);
        let entry = config.auths.iter().find_map(|(key, entry)| {
            (normalize_registry(docker_config_host(key)) == wanted).then_some(entry)
        });
        let Some(entry) = entry else {
            return Ok(None);
        };

        if let Some(token) = entry.registry_token.as_ref().filter(|t| !t.is_empty()) {
            return Ok(Some(Credentials::Token(token.clone())));
        }
        if let Some(encoded) = entry.auth.as_ref().filter(|a| !a.is_empty()) {
            let decoded = STANDARD.decode(encoded.trim()).map_err(|e| {
                VmError::ConfigError(format!("Invalid auth entry for {} in docker config: {}", host, e))
            })?;
            let decoded = String::from_utf8(decoded).map_err(|_| {
                VmError::ConfigError(format!("Auth entry for {} is not UTF-8", host))
            })?;
            return match decoded.split_once(':') {
                Some((username, password)) => Ok(Some(Credentials::basic(username, password))),
                None => Err(VmError::ConfigError(format!(
                    "Auth entry for {} is not in user:password form",
                    host
                ))),
            };
        }
        match (&entry.username, &entry.password) {
            (Some(username), Some(password)) => {
                Ok(Some(Credentials::basic(username.clone(), password.clone())))
            }
            _ => Ok(None),
        }
    }
}

/// Tries each provider in order; the first entry wins.
pub struct CredentialChain {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl CredentialChain {
    pub fn new(providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    /// Environment, vmpull credential store, then docker config.
    pub fn standard(storage: &StorageConfig) -> Self {
        let mut providers: Vec<Box<dyn CredentialProvider>> = vec![
            Box::new(EnvCredentials::from_env()),
            Box::new(CredentialStore::for_storage(storage)),
        ];
        if let Some(docker) = DockerConfigCredentials::default_path() {
            providers.push(Box::new(docker));
        }
        Self::new(providers)
    }

    /// Resolve credentials for `host`, falling back to anonymous.
    pub fn resolve(&self, host: &str) -> Result<Credentials> {
        Ok(self.credentials_for(host)?.unwrap_or(Credentials::Anonymous))
    }
}

impl CredentialProvider for CredentialChain {
    fn credentials_for(&self, host: &str) -> Result<Option<Credentials>> {
        for provider in &self.providers {
            if let Some(credentials) = provider.credentials_for(host)? {
                return Ok(Some(credentials));
            }
        }
        Ok(None)
    }
}

/// Docker config keys may be URLs (`https://index.docker.io/v1/`).
fn docker_config_host(key: &str) -> &str {
    let without_scheme = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    without_scheme.split('/').next().unwrap_or(without_scheme)
}

/// Normalize registry names (e.g., "docker.io" and "index.docker.io" → "index.docker.io").
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}
