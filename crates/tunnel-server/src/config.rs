//! Forwarding configuration: TOML file with per-key defaults.

use crate::forwarding::ForwardingSettings;
use crate::policy::ForwardPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tunnel_core::{TunnelError, TunnelResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub forwarding: ForwardingSection,
    #[serde(default)]
    pub policy: PolicySection,
}

/// `[forwarding]` section of the config TOML. Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardingSection {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_accept_poll_secs")]
    pub accept_poll_secs: u64,
    #[serde(default = "default_channel_wait_secs")]
    pub channel_wait_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_unclaimed_ttl_secs")]
    pub unclaimed_ttl_secs: u64,
    #[serde(default = "default_max_forwards")]
    pub max_forwards: usize,
    #[serde(default = "default_max_direct")]
    pub max_direct: usize,
    #[serde(default = "default_max_connections_per_forward")]
    pub max_connections_per_forward: usize,
}

impl Default for ForwardingSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            accept_poll_secs: default_accept_poll_secs(),
            channel_wait_secs: default_channel_wait_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            unclaimed_ttl_secs: default_unclaimed_ttl_secs(),
            max_forwards: default_max_forwards(),
            max_direct: default_max_direct(),
            max_connections_per_forward: default_max_connections_per_forward(),
        }
    }
}

/// `[policy]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySection {
    #[serde(default = "default_true")]
    pub enable_remote_forwards: bool,
    #[serde(default = "default_true")]
    pub enable_direct: bool,
    #[serde(default = "default_wildcard")]
    pub allowed_bind_addresses: Vec<String>,
    #[serde(default = "default_wildcard")]
    pub allowed_destinations: Vec<String>,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            enable_remote_forwards: true,
            enable_direct: true,
            allowed_bind_addresses: default_wildcard(),
            allowed_destinations: default_wildcard(),
        }
    }
}

fn default_chunk_size() -> usize {
    crate::forwarding::pump::DEFAULT_CHUNK_SIZE
}
fn default_accept_poll_secs() -> u64 {
    10
}
fn default_channel_wait_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_unclaimed_ttl_secs() -> u64 {
    30
}
fn default_max_forwards() -> usize {
    64
}
fn default_max_direct() -> usize {
    256
}
fn default_max_connections_per_forward() -> usize {
    128
}
fn default_true() -> bool {
    true
}
fn default_wildcard() -> Vec<String> {
    vec!["*".to_string()]
}

/// Resolved tunnel configuration.
#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    pub file: ConfigFile,
}

impl TunnelConfig {
    /// Load config from a TOML file. A missing path or file gives defaults.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Io`] if the file exists but cannot be read,
    /// and [`TunnelError::Config`] if it does not parse or holds a zero
    /// chunk size or limit.
    pub fn load(config_path: Option<&Path>) -> TunnelResult<Self> {
        let file = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self { file };
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(content: &str) -> TunnelResult<Self> {
        let config = Self {
            file: Self::parse_file(content)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn parse_file(content: &str) -> TunnelResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| TunnelError::Config(format!("config parse error: {e}")))
    }

    fn validate(&self) -> TunnelResult<()> {
        let f = &self.file.forwarding;
        for (name, value) in [
            ("chunk_size", f.chunk_size),
            ("max_forwards", f.max_forwards),
            ("max_direct", f.max_direct),
            ("max_connections_per_forward", f.max_connections_per_forward),
        ] {
            if value == 0 {
                return Err(TunnelError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Runtime settings for [`crate::ForwardingCoordinator`].
    pub fn settings(&self) -> ForwardingSettings {
        let f = &self.file.forwarding;
        ForwardingSettings {
            chunk_size: f.chunk_size,
            accept_poll: Duration::from_secs(f.accept_poll_secs),
            channel_wait: Duration::from_secs(f.channel_wait_secs),
            connect_timeout: Duration::from_secs(f.connect_timeout_secs),
            unclaimed_ttl: Duration::from_secs(f.unclaimed_ttl_secs),
            max_forwards: f.max_forwards,
            max_direct: f.max_direct,
            max_connections_per_forward: f.max_connections_per_forward,
        }
    }

    /// Policy for [`crate::ForwardPolicyEnforcer`].
    pub fn policy(&self) -> ForwardPolicy {
        let p = &self.file.policy;
        ForwardPolicy {
            enable_remote_forwards: p.enable_remote_forwards,
            enable_direct: p.enable_direct,
            allowed_bind_addresses: p.allowed_bind_addresses.clone(),
            allowed_destinations: p.allowed_destinations.clone(),
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
