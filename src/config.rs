//! Agent configuration.
//!
//! Loaded from a TOML file resolved through a chain:
//!
//! 1. `--config <path>`: explicit per-invocation override
//! 2. `OTA_AGENT_CONFIG` env var: set by the service unit
//! 3. `/etc/ota-agent/config.toml`: system default
//!
//! Every section is optional; missing keys take the defaults below.

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::{Deserialize, Serialize};

use crate::delta;
use crate::model::TlsKeys;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "OTA_AGENT_CONFIG";

/// Config file used when neither `--config` nor [`CONFIG_ENV`] is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ota-agent/config.toml";

/// Agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub provision: ProvisionConfig,
    pub pacman: PacmanConfig,
    pub bootloader: BootloaderConfig,
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Device identity used to filter targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProvisionConfig {
    pub primary_hardware_id: String,
    /// Hardware ids of secondary ECUs whose targets are also accepted.
    pub secondary_hardware_ids: Vec<String>,
}

/// Rootfs package manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PacmanConfig {
    /// Only targets carrying one of these tags are considered. Empty accepts all.
    pub tags: Vec<String>,
    /// Base URL of the tree-store server; `file://` URLs refer to a local repo.
    pub ostree_server: String,
    pub sysroot: PathBuf,
    /// Deployment OS name under `<sysroot>/ostree/deploy/`.
    pub os: String,
    /// Refuse rootfs changes while a boot firmware update awaits confirmation.
    pub update_block: bool,
    /// Percentage of the sysroot volume updates may fill, clamped on load.
    pub storage_watermark: u32,
    pub tls: TlsConfig,
}

impl Default for PacmanConfig {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            ostree_server: String::new(),
            sysroot: PathBuf::from("/sysroot"),
            os: "lmp".to_string(),
            update_block: true,
            storage_watermark: delta::DEFAULT_WATERMARK,
            tls: TlsConfig::default(),
        }
    }
}

/// Client TLS material registered with the tree-store remote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Commands used to read and write the bootloader environment.
///
/// An empty `get-env-cmd` means boot firmware updates are not supported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BootloaderConfig {
    pub get_env_cmd: String,
    pub set_env_cmd: String,
}

/// Device gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfig {
    pub url: String,
}

/// Container registry access.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistryConfig {
    /// Where registry credentials are obtained. Derived from the tree-store
    /// server URL when empty.
    pub auth_creds_endpoint: String,
}

/// Local state locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StorageConfig {
    /// Install history and metadata cache.
    pub path: PathBuf,
    /// Application blob store. Empty on devices without applications.
    pub apps_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/sota"),
            apps_root: PathBuf::from("/var/sota/apps"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LoggingConfig {
    /// Default filter; `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Resolve the config path and load it.
    pub fn load(explicit: Option<&Path>) -> Result<Self, String> {
        let path = Self::resolve_path(explicit);
        let contents = fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        Self::parse(&contents).map_err(|e| format!("invalid config at {}: {e}", path.display()))
    }

    /// Parse config text, normalizing values that have safe fallbacks.
    pub fn parse(contents: &str) -> Result<Self, String> {
        let mut config: Self = toml::from_str(contents).map_err(|e| e.to_string())?;
        config.pacman.storage_watermark = delta::clamp_watermark(config.pacman.storage_watermark);
        if config.provision.primary_hardware_id.is_empty() {
            return Err("provision.primary-hardware-id must be set".to_string());
        }
        Ok(config)
    }

    fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        // 1. Explicit --config flag.
        if let Some(path) = explicit {
            return path.to_path_buf();
        }

        // 2. OTA_AGENT_CONFIG environment variable.
        if let Ok(path) = env::var(CONFIG_ENV)
            && !path.is_empty()
        {
            return PathBuf::from(path);
        }

        // 3. System default.
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    pub fn apps_enabled(&self) -> bool {
        !self.storage.apps_root.as_os_str().is_empty()
    }

    /// TLS material for the primary remote, if any is configured.
    pub fn tls_keys(&self) -> Option<TlsKeys> {
        let tls = &self.pacman.tls;
        if tls.ca_file.is_none() && tls.cert_file.is_none() && tls.key_file.is_none() {
            return None;
        }
        Some(TlsKeys {
            ca_file: tls.ca_file.clone(),
            cert_file: tls.cert_file.clone(),
            key_file: tls.key_file.clone(),
        })
    }

    /// Render the effective configuration, as reported to the gateway.
    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string(self).map_err(|e| e.to_string())
    }
}
