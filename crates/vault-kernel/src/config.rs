use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vault_core::constants::{DEFAULT_TICK_INTERVAL_SECS, VAULT_CONFIG_FILE};

use crate::error::{KernelError, Result};

/// Contents of `<vault>/.vault.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VaultConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default, alias = "plugins")]
    pub extensions: BTreeMap<String, ExtensionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtensionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub settings: toml::Table,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settings: toml::Table::new(),
        }
    }
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}

fn default_enabled() -> bool {
    true
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            version: default_version(),
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            extensions: BTreeMap::new(),
        }
    }
}

pub fn config_path(vault_path: &Path) -> PathBuf {
    vault_path.join(VAULT_CONFIG_FILE)
}

/// Fails unless `vault_path` exists and is a directory.
pub fn validate_vault_path(vault_path: &Path) -> Result<PathBuf> {
    if !vault_path.exists() {
        return Err(KernelError::InvalidVault {
            path: vault_path.to_path_buf(),
            reason: "path does not exist".to_string(),
        });
    }
    if !vault_path.is_dir() {
        return Err(KernelError::InvalidVault {
            path: vault_path.to_path_buf(),
            reason: "path is not a directory".to_string(),
        });
    }
    Ok(vault_path
        .canonicalize()
        .unwrap_or_else(|_| vault_path.to_path_buf()))
}

impl VaultConfig {
    /// Reads the vault config. A missing file yields defaults named after the
    /// vault directory; an unreadable or malformed file is an error.
    pub fn load(vault_path: &Path) -> Result<Self> {
        let path = config_path(vault_path);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                KernelError::Config(format!("failed to read {}: {}", path.display(), e))
            })?;
            toml::from_str::<VaultConfig>(&content).map_err(|e| {
                KernelError::Config(format!("failed to parse {}: {}", path.display(), e))
            })?
        } else {
            log::info!("No {} found, using defaults", VAULT_CONFIG_FILE);
            VaultConfig::default()
        };

        if config.id.is_empty() {
            config.id = vault_path.display().to_string();
        }
        if config.name.is_empty() {
            config.name = vault_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
        }
        if config.tick_interval_secs == 0 {
            config.tick_interval_secs = DEFAULT_TICK_INTERVAL_SECS;
        }
        Ok(config)
    }

    pub async fn save(&self, vault_path: &Path) -> Result<()> {
        let path = config_path(vault_path);
        let content = toml::to_string_pretty(self)?;
        let tmp = path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub fn is_enabled(&self, extension_id: &str) -> bool {
        self.extensions
            .get(extension_id)
            .map(|e| e.enabled)
            .unwrap_or(true)
    }

    /// Extension settings as JSON, `{}` when none are configured.
    pub fn settings_for(&self, extension_id: &str) -> Value {
        self.extensions
            .get(extension_id)
            .and_then(|e| serde_json::to_value(&e.settings).ok())
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    pub fn set_enabled(&mut self, extension_id: &str, enabled: bool) {
        self.extensions
            .entry(extension_id.to_string())
            .or_default()
            .enabled = enabled;
    }
}
