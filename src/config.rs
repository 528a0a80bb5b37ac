//! Daemon configuration.
//!
//! Lives at `~/.config/nimbus/config.json`. Created with a freshly minted
//! auth token on first run; written 0600 because it contains that token.
//! This is the only file the daemon owns on the host — everything else of
//! record lives inside the VMs or in the engine.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::network::NetworkConfig;

const CONFIG_DIR: &str = "nimbus";
const CONFIG_FILE: &str = "config.json";
const DEFAULT_CLOUD_INIT_FILE: &str = "cloud-init.yaml";

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shared bearer token protecting the management API and agent ports.
    pub auth_token: String,
    /// Defaults applied to VM creation when the request leaves fields empty.
    #[serde(default)]
    pub defaults: Defaults,
    /// Idle minutes before the watchdog stops a VM.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_mins: u64,
    /// True when a fronting proxy terminates TLS for this daemon.
    ///
    /// Controls the `X-Forwarded-Proto` value and whether auth cookies are
    /// marked `Secure`.
    #[serde(default)]
    pub behind_tls: bool,
    /// Public domain for subdomain-routed agent URLs
    /// (`https://<vm>-1234.<domain>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Default VM creation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_mem")]
    pub mem: String,
    #[serde(default = "default_disk")]
    pub disk: String,
    /// Path to a default cloud-init template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<PathBuf>,
    /// Default egress policy for new VMs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,
}

fn default_cpu() -> u32 {
    2
}
fn default_mem() -> String {
    "4G".into()
}
fn default_disk() -> String {
    "20G".into()
}
fn default_shutdown_timeout() -> u64 {
    5
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            mem: default_mem(),
            disk: default_disk(),
            cloud_init: None,
            network: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_token: Uuid::new_v4().to_string(),
            defaults: Defaults::default(),
            shutdown_timeout_mins: default_shutdown_timeout(),
            behind_tls: false,
            domain: None,
        }
    }
}

impl Config {
    /// Path of the config file.
    pub fn path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::config("locate", "no config directory found"))?;
        Ok(dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Path of the optional default cloud-init template.
    pub fn default_cloud_init_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::config("locate", "no config directory found"))?;
        Ok(dir.join(CONFIG_DIR).join(DEFAULT_CLOUD_INIT_FILE))
    }

    /// Load the configuration, creating a default one on first run.
    pub fn load() -> Result<Self> {
        let path = Self::path()?;
        match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| Error::config("parse", format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save()?;
                Ok(cfg)
            }
            Err(e) => Err(Error::config("load", format!("{}: {}", path.display(), e))),
        }
    }

    /// Persist the configuration with restrictive permissions.
    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| Error::config("save", format!("{}: {}", dir.display(), e)))?;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| Error::config("save", e.to_string()))?;
        }
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::config("serialize", e.to_string()))?;
        fs::write(&path, data)
            .map_err(|e| Error::config("save", format!("{}: {}", path.display(), e)))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::config("save", e.to_string()))?;
        Ok(())
    }

    /// Resolve the cloud-init template to use for a creation request.
    ///
    /// Priority: explicit request path, then the configured default, then
    /// `~/.config/nimbus/cloud-init.yaml` if present.
    pub fn cloud_init_path(&self, explicit: Option<&str>) -> Option<PathBuf> {
        if let Some(path) = explicit.filter(|p| !p.is_empty()) {
            return Some(PathBuf::from(path));
        }
        if let Some(path) = &self.defaults.cloud_init {
            if path.exists() {
                return Some(path.clone());
            }
        }
        match Self::default_cloud_init_path() {
            Ok(path) if path.exists() => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_mints_a_token() {
        let a = Config::default();
        let b = Config::default();
        assert!(!a.auth_token.is_empty());
        assert_ne!(a.auth_token, b.auth_token);
        assert_eq!(a.defaults.cpu, 2);
        assert_eq!(a.defaults.mem, "4G");
        assert_eq!(a.defaults.disk, "20G");
        assert_eq!(a.shutdown_timeout_mins, 5);
        assert!(!a.behind_tls);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"auth_token": "t"}"#).unwrap();
        assert_eq!(cfg.auth_token, "t");
        assert_eq!(cfg.defaults.cpu, 2);
        assert_eq!(cfg.shutdown_timeout_mins, 5);
    }

    #[test]
    fn explicit_cloud_init_wins() {
        let cfg = Config::default();
        let resolved = cfg.cloud_init_path(Some("/tmp/custom.yaml"));
        assert_eq!(resolved, Some(PathBuf::from("/tmp/custom.yaml")));
    }

    #[test]
    fn round_trip_preserves_network_defaults() {
        use crate::network::{NetworkMode, NetworkRule, RuleType};
        let mut cfg = Config::default();
        cfg.defaults.network = Some(NetworkConfig {
            mode: NetworkMode::Blocklist,
            rules: vec![NetworkRule {
                rule_type: RuleType::Cidr,
                value: "10.0.0.0/8".into(),
                comment: Some("private range".into()),
            }],
        });
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.defaults.network, cfg.defaults.network);
    }
}
