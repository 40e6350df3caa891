//! Registry credentials and keychains.
//!
//! A [`Keychain`] maps a registry hostname to a [`RegistryAuth`]. The
//! [`DefaultKeychain`] consults, in order, the A3S credential store at
//! `~/.a3s/auth/credentials.json`, the Docker `config.json`, and the
//! `REGISTRY_USERNAME`/`REGISTRY_PASSWORD` environment variables before
//! falling back to anonymous access.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use a3s_rebase_core::error::{OciError, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Authentication material for a container registry.
#[derive(Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    /// No credentials
    Anonymous,
    /// Username and password
    Basic { username: String, password: String },
    /// Identity token presented to the token realm
    Bearer(String),
}

impl RegistryAuth {
    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Returns `None` unless both are set.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("REGISTRY_USERNAME").ok()?;
        let password = std::env::var("REGISTRY_PASSWORD").ok()?;
        Some(Self::basic(username, password))
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, RegistryAuth::Anonymous)
    }
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryAuth::Anonymous => write!(f, "Anonymous"),
            RegistryAuth::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
            RegistryAuth::Bearer(_) => write!(f, "Bearer(***)"),
        }
    }
}

/// Resolves a registry to the credentials used against it.
pub trait Keychain: Send + Sync {
    fn resolve(&self, registry: &str) -> Result<RegistryAuth>;
}

/// Keychain that always answers anonymously.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousKeychain;

impl Keychain for AnonymousKeychain {
    fn resolve(&self, _registry: &str) -> Result<RegistryAuth> {
        Ok(RegistryAuth::Anonymous)
    }
}

/// Fixed per-registry credentials, anonymous for everything else.
#[derive(Debug, Default, Clone)]
pub struct StaticKeychain {
    entries: HashMap<String, RegistryAuth>,
}

impl StaticKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, registry: &str, auth: RegistryAuth) -> Self {
        self.entries.insert(normalize_registry(registry), auth);
        self
    }
}

impl Keychain for StaticKeychain {
    fn resolve(&self, registry: &str) -> Result<RegistryAuth> {
        Ok(self
            .entries
            .get(&normalize_registry(registry))
            .cloned()
            .unwrap_or(RegistryAuth::Anonymous))
    }
}

/// Credential store, then Docker config, then environment, then anonymous.
pub struct DefaultKeychain {
    store: Option<CredentialStore>,
    docker_config: Option<PathBuf>,
}

impl DefaultKeychain {
    /// Keychain reading the default file locations.
    pub fn new() -> Self {
        Self {
            store: CredentialStore::default_path().ok(),
            docker_config: docker_config_path(),
        }
    }

    /// Keychain reading explicit file locations.
    pub fn with_paths(store: Option<CredentialStore>, docker_config: Option<PathBuf>) -> Self {
        Self {
            store,
            docker_config,
        }
    }
}

impl Default for DefaultKeychain {
    fn default() -> Self {
        Self::new()
    }
}

impl Keychain for DefaultKeychain {
    fn resolve(&self, registry: &str) -> Result<RegistryAuth> {
        if let Some(ref store) = self.store {
            if let Some(auth) = store.get(registry)? {
                tracing::debug!(registry, "Using credentials from credential store");
                return Ok(auth);
            }
        }
        if let Some(ref path) = self.docker_config {
            if let Some(auth) = DockerConfig::load(path)?.resolve(registry)? {
                tracing::debug!(registry, "Using credentials from docker config");
                return Ok(auth);
            }
        }
        Ok(RegistryAuth::from_env().unwrap_or(RegistryAuth::Anonymous))
    }
}

/// Location of Docker's `config.json`: `$DOCKER_CONFIG/config.json` or
/// `~/.docker/config.json`.
fn docker_config_path() -> Option<PathBuf> {
    match std::env::var_os("DOCKER_CONFIG") {
        Some(dir) => Some(PathBuf::from(dir).join("config.json")),
        None => dirs::home_dir().map(|h| h.join(".docker").join("config.json")),
    }
}

/// `auths` entry of a Docker config file.
#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

/// The subset of Docker's `config.json` used for credentials.
#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

impl DockerConfig {
    /// Load the config file. Returns empty if not found.
    fn load(path: &Path) -> Result<Self> {
        let Some(data) = read_optional(path)? else {
            return Ok(Self::default());
        };
        serde_json::from_str(&data).map_err(|e| {
            OciError::ConfigError(format!("docker config {} is corrupt: {}", path.display(), e))
        })
    }

    fn resolve(&self, registry: &str) -> Result<Option<RegistryAuth>> {
        let wanted = normalize_registry(registry);
        let entry = self
            .auths
            .iter()
            .find(|(key, _)| normalize_registry(&strip_url(key)) == wanted)
            .map(|(_, entry)| entry);
        let entry = match entry {
            Some(e) => e,
            None => return Ok(None),
        };

        if let Some(ref token) = entry.identitytoken {
            if !token.is_empty() {
                return Ok(Some(RegistryAuth::Bearer(token.clone())));
            }
        }
        if let (Some(u), Some(p)) = (&entry.username, &entry.password) {
            return Ok(Some(RegistryAuth::basic(u.clone(), p.clone())));
        }
        if let Some(ref auth) = entry.auth {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth.trim())
                .map_err(|e| OciError::ConfigError(format!("invalid auth entry for {}: {}", registry, e)))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|e| OciError::ConfigError(format!("invalid auth entry for {}: {}", registry, e)))?;
            let (username, password) = decoded.split_once(':').ok_or_else(|| {
                OciError::ConfigError(format!("invalid auth entry for {}: expected user:password", registry))
            })?;
            return Ok(Some(RegistryAuth::basic(username, password)));
        }
        Ok(None)
    }
}

/// Reduce `https://index.docker.io/v1/` style keys to a hostname.
fn strip_url(key: &str) -> String {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    key.split('/').next().unwrap_or(key).to_string()
}

/// Read `path`, treating a missing file as absent.
fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(OciError::IoError(std::io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredLogin {
    username: String,
    password: String,
}

/// On-disk layout of the credential store, keyed by normalized registry.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredLogins {
    #[serde(default)]
    registries: BTreeMap<String, StoredLogin>,
}

/// Logins saved by `a3s-rebase login`, one per registry.
///
/// Lives at `~/.a3s/auth/credentials.json`. Every change rewrites the
/// whole file through a sibling temp file and a rename, so readers never
/// see a half-written store. On Unix the file is readable by its owner only.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// The store under the user's home directory.
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            OciError::ConfigError("no home directory for the credential store".to_string())
        })?;
        Ok(Self::new(home.join(".a3s").join("auth").join("credentials.json")))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save a login for `registry`, replacing any previous one.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut logins = self.read()?;
        let login = StoredLogin {
            username: username.to_string(),
            password: password.to_string(),
        };
        logins.registries.insert(normalize_registry(registry), login);
        self.write(&logins)
    }

    /// The saved login for `registry` as basic credentials.
    pub fn get(&self, registry: &str) -> Result<Option<RegistryAuth>> {
        Ok(self
            .read()?
            .registries
            .remove(&normalize_registry(registry))
            .map(|login| RegistryAuth::basic(login.username, login.password)))
    }

    /// Forget the login for `registry`. `false` when there was none.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut logins = self.read()?;
        if logins.registries.remove(&normalize_registry(registry)).is_none() {
            return Ok(false);
        }
        self.write(&logins)?;
        Ok(true)
    }

    fn read(&self) -> Result<StoredLogins> {
        let Some(data) = read_optional(&self.path)? else {
            return Ok(StoredLogins::default());
        };
        serde_json::from_str(&data).map_err(|e| {
            OciError::ConfigError(format!(
                "credential store {} is corrupt: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn write(&self, logins: &StoredLogins) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let staging = self
            .path
            .with_extension(format!("{}.tmp", std::process::id()));
        std::fs::write(&staging, serde_json::to_vec_pretty(logins)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&staging, &self.path)?;
        tracing::debug!(
            path = %self.path.display(),
            entries = logins.registries.len(),
            "Credential store updated"
        );
        Ok(())
    }
}

/// Normalize registry names (e.g., "docker.io" and "registry-1.docker.io" → "index.docker.io").
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}
