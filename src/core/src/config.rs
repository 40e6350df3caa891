use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OciError, Result};

/// Registry used when a reference names none.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Options for one invocation: reference parsing plus transport policy.
///
/// Built once and passed by reference through the call chain; nothing
/// mutates it after construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Reference parsing options
    pub name: NameOptions,

    /// HTTP transport options
    pub transport: TransportOptions,
}

/// Reference parsing options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameOptions {
    /// Registry applied to references without an explicit registry
    pub default_registry: String,

    /// Talk plain HTTP to every registry
    pub insecure: bool,
}

impl Default for NameOptions {
    fn default() -> Self {
        Self {
            default_registry: DEFAULT_REGISTRY.to_string(),
            insecure: false,
        }
    }
}

/// HTTP transport options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Deadline for each HTTP exchange, in seconds
    pub timeout_secs: u64,

    /// Retry policy for transient failures
    pub retry: RetryPolicy,

    /// Platform selected from image indexes, as `os/arch[/variant]`.
    /// `None` selects linux on the host architecture.
    pub platform: Option<String>,

    /// User-Agent header
    pub user_agent: String,

    /// Blob transfers run concurrently during a push
    pub max_concurrent_transfers: usize,

    /// Upload blobs in chunks of this many bytes; monolithic when unset
    pub chunk_size: Option<usize>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            retry: RetryPolicy::default(),
            platform: None,
            user_agent: format!("a3s-rebase/{}", crate::VERSION),
            max_concurrent_transfers: 4,
            chunk_size: None,
        }
    }
}

impl TransportOptions {
    /// Per-request deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound on any single delay, in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl Options {
    /// Load options from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OciError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let options: Options = serde_yaml::from_str(&content)?;
        options.validate()?;
        Ok(options)
    }

    /// Load `~/.a3s/rebase.yaml` if present, defaults otherwise.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "Loading options");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Default options file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".a3s").join("rebase.yaml"))
    }

    /// Reject values the transport cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.name.default_registry.trim().is_empty() {
            return Err(OciError::ConfigError(
                "default_registry must not be empty".to_string(),
            ));
        }
        let transport = &self.transport;
        if transport.timeout_secs == 0 {
            return Err(OciError::ConfigError(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        if transport.retry.max_attempts == 0 {
            return Err(OciError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if transport.max_concurrent_transfers == 0 {
            return Err(OciError::ConfigError(
                "max_concurrent_transfers must be at least 1".to_string(),
            ));
        }
        if transport.chunk_size == Some(0) {
            return Err(OciError::ConfigError(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if let Some(ref platform) = transport.platform {
            let parts: Vec<&str> = platform.split('/').collect();
            if !(2..=3).contains(&parts.len()) || parts.iter().any(|p| p.is_empty()) {
                return Err(OciError::ConfigError(format!(
                    "Invalid platform '{}': expected os/arch[/variant]",
                    platform
                )));
            }
        }
        Ok(())
    }
}
