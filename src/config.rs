//! Updater configuration persistence
//!
//! Saved as JSON in the platform-local data directory so an operator can
//! point a deployment at a mirror of the release feed without rebuilding.

use std::fs;
use std::path::PathBuf;

use log::{info, warn};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "updater.json";
const APP_DIR: &str = "VeilTunnel";

fn default_update_check_url() -> String {
    "https://api.github.com/repos/veiltunnel/veiltunnel-app/releases/latest".to_string()
}

fn default_releases_url() -> String {
    "https://api.github.com/repos/veiltunnel/veiltunnel-app/releases".to_string()
}

fn default_installer_prefix() -> String {
    "VeilTunnel.Client-".to_string()
}

fn default_service_name() -> String {
    "veiltunnel".to_string()
}

fn default_service_exe() -> String {
    "veiltunnel-svc".to_string()
}

fn default_adapter_prefix() -> String {
    "veil".to_string()
}

fn default_dns_rule_tag() -> String {
    "Added by veiltunnel-svc".to_string()
}

fn default_service_wait_secs() -> u64 {
    60
}

fn default_kill_wait_secs() -> u64 {
    30
}

/// Configuration for the update pipeline and service supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Endpoint returning the latest release descriptor
    #[serde(default = "default_update_check_url")]
    pub update_check_url: String,
    /// Endpoint returning the full release list, newest first
    #[serde(default = "default_releases_url")]
    pub releases_url: String,
    /// Installer assets are selected by this name prefix, first match wins
    #[serde(default = "default_installer_prefix")]
    pub installer_prefix: String,
    /// Override for the artifact staging directory
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    /// Managed OS service name
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Executable name of the managed service process (without extension)
    #[serde(default = "default_service_exe")]
    pub service_exe: String,
    /// Virtual network adapters created by the service match this prefix
    #[serde(default = "default_adapter_prefix")]
    pub adapter_prefix: String,
    /// DNS policy rules created by the service carry this comment tag
    #[serde(default = "default_dns_rule_tag")]
    pub dns_rule_tag: String,
    /// Bounded wait for service start/stop transitions
    #[serde(default = "default_service_wait_secs")]
    pub service_wait_secs: u64,
    /// Bounded wait per forcibly terminated process
    #[serde(default = "default_kill_wait_secs")]
    pub kill_wait_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        UpdaterConfig {
            update_check_url: default_update_check_url(),
            releases_url: default_releases_url(),
            installer_prefix: default_installer_prefix(),
            staging_dir: None,
            service_name: default_service_name(),
            service_exe: default_service_exe(),
            adapter_prefix: default_adapter_prefix(),
            dns_rule_tag: default_dns_rule_tag(),
            service_wait_secs: default_service_wait_secs(),
            kill_wait_secs: default_kill_wait_secs(),
        }
    }
}

impl UpdaterConfig {
    /// Resolved staging directory for downloaded artifacts.
    pub fn staging_dir(&self) -> Option<PathBuf> {
        match &self.staging_dir {
            Some(dir) => Some(dir.clone()),
            None => dirs::data_local_dir().map(|d| d.join(APP_DIR).join("updates")),
        }
    }

    fn config_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load the config file, falling back to defaults when it is missing or
    /// unreadable.
    pub fn load() -> UpdaterConfig {
        let Some(path) = Self::config_path() else {
            warn!("could not resolve local data directory, using default config");
            return UpdaterConfig::default();
        };

        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => {
                    info!("loaded updater config from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("invalid updater config at {}: {}", path.display(), e);
                    UpdaterConfig::default()
                }
            },
            Err(_) => UpdaterConfig::default(),
        }
    }

    /// Persist the config as pretty JSON.
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no local data directory")
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        info!("saved updater config to {}", path.display());
        Ok(())
    }
}
