//! VM creation orchestration.
//!
//! Creation combines the user's spec, the daemon defaults, and the
//! cloud-init template (token substituted, policy section merged), writes
//! the result to a temp file, and hands it to the engine. Clone and delete
//! are thin pass-throughs; delete purges by default.

use tracing::info;

use crate::cloudinit;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::multipass::{Client, LaunchOptions};
use crate::network::{self, NetworkConfig};

/// A VM creation request after JSON decoding, before defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub name: String,
    /// 0 → use the configured default.
    pub cpu: u32,
    /// Empty → use the configured default.
    pub mem: String,
    /// Empty → use the configured default.
    pub disk: String,
    /// Explicit cloud-init template path.
    pub cloud_init: Option<String>,
    /// Image name or release; empty for the engine default.
    pub image: String,
    /// Egress policy; `None` falls back to the configured default policy.
    pub network: Option<NetworkConfig>,
}

/// Orchestrates launch, clone, and delete against the engine.
#[derive(Clone)]
pub struct Launcher {
    mp: Client,
}

impl Launcher {
    pub fn new(mp: Client) -> Self {
        Self { mp }
    }

    /// Create and start a new VM from a spec merged with daemon defaults.
    pub async fn launch(&self, cfg: &Config, spec: CreateSpec) -> Result<()> {
        if spec.name.is_empty() {
            return Err(Error::validation("name is required"));
        }

        let cpu = if spec.cpu > 0 { spec.cpu } else { cfg.defaults.cpu };
        let mem = if spec.mem.is_empty() {
            cfg.defaults.mem.clone()
        } else {
            spec.mem
        };
        let disk = if spec.disk.is_empty() {
            cfg.defaults.disk.clone()
        } else {
            spec.disk
        };

        // Request policy wins; otherwise a configured default policy applies.
        let policy = spec.network.or_else(|| {
            cfg.defaults
                .network
                .clone()
                .filter(|net| !net.is_none())
        });
        if let Some(policy) = &policy {
            network::validate(policy)?;
        }

        let base = match cfg.cloud_init_path(spec.cloud_init.as_deref()) {
            Some(path) => tokio::fs::read_to_string(&path).await.map_err(|e| {
                Error::config("read cloud-init", format!("{}: {}", path.display(), e))
            })?,
            None => cloudinit::DEFAULT_CLOUD_INIT.to_string(),
        };

        let mut content = cloudinit::inject_auth_token(&base, &cfg.auth_token);
        if let Some(policy) = &policy {
            content = cloudinit::merge_network_policy(&content, policy)?;
        }

        // The temp dir lives until launch returns; the engine reads the
        // file synchronously during `multipass launch`.
        let staging = tempfile::Builder::new()
            .prefix("nimbus-cloudinit-")
            .tempdir()
            .map_err(|e| Error::config("stage cloud-init", e.to_string()))?;
        let cloud_init_file = staging.path().join("cloud-init.yaml");
        tokio::fs::write(&cloud_init_file, &content)
            .await
            .map_err(|e| Error::config("stage cloud-init", e.to_string()))?;

        let opts = LaunchOptions {
            name: spec.name.clone(),
            cpus: cpu,
            memory: mem,
            disk,
            cloud_init: cloud_init_file.to_string_lossy().into_owned(),
            image: spec.image,
        };

        info!(vm = %spec.name, cpus = cpu, "launching vm");
        self.mp.launch(&opts).await?;

        // Policy already rides in via cloud-init on first boot; nothing
        // further to install here.
        Ok(())
    }

    /// Clone `source` into `dest`.
    pub async fn clone_vm(&self, source: &str, dest: &str) -> Result<()> {
        if dest.is_empty() {
            return Err(Error::validation("new name is required"));
        }
        self.mp.clone_vm(source, dest).await
    }

    /// Delete a VM; purges by default.
    pub async fn delete(&self, name: &str, purge: bool) -> Result<()> {
        self.mp.delete(name, purge).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::multipass::testing::MockExecutor;

    fn launcher_with(mock: Arc<MockExecutor>) -> Launcher {
        Launcher::new(Client::with_executor(mock))
    }

    #[tokio::test]
    async fn launch_fills_defaults_and_stages_cloud_init() {
        let mock = Arc::new(MockExecutor::new());
        mock.set_response_prefix(
            "multipass launch --name dev --cpus 2 --memory 4G --disk 20G --cloud-init ",
            "",
        );

        let cfg = Config::default();
        let spec = CreateSpec {
            name: "dev".into(),
            ..Default::default()
        };
        launcher_with(mock.clone()).launch(&cfg, spec).await.unwrap();

        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("--cloud-init"));
        assert!(calls[0].contains("cloud-init.yaml"));
    }

    #[tokio::test]
    async fn launch_respects_explicit_resources() {
        let mock = Arc::new(MockExecutor::new());
        mock.set_response_prefix(
            "multipass launch --name big --cpus 8 --memory 16G --disk 100G --cloud-init ",
            "",
        );
        let cfg = Config::default();
        let spec = CreateSpec {
            name: "big".into(),
            cpu: 8,
            mem: "16G".into(),
            disk: "100G".into(),
            ..Default::default()
        };
        launcher_with(mock).launch(&cfg, spec).await.unwrap();
    }

    #[tokio::test]
    async fn launch_requires_a_name() {
        let mock = Arc::new(MockExecutor::new());
        let err = launcher_with(mock.clone())
            .launch(&Config::default(), CreateSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn launch_rejects_invalid_policy_before_engine() {
        use crate::network::{NetworkConfig, NetworkMode};
        let mock = Arc::new(MockExecutor::new());
        let spec = CreateSpec {
            name: "dev".into(),
            network: Some(NetworkConfig {
                mode: NetworkMode::Allowlist,
                rules: vec![],
            }),
            ..Default::default()
        };
        let err = launcher_with(mock.clone())
            .launch(&Config::default(), spec)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn clone_passes_through() {
        let mock = Arc::new(MockExecutor::new());
        mock.set_response("multipass clone dev -n dev-copy", "");
        launcher_with(mock).clone_vm("dev", "dev-copy").await.unwrap();
    }

    #[tokio::test]
    async fn clone_requires_destination() {
        let mock = Arc::new(MockExecutor::new());
        let err = launcher_with(mock).clone_vm("dev", "").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn delete_purges() {
        let mock = Arc::new(MockExecutor::new());
        mock.set_response("multipass delete dev --purge", "");
        launcher_with(mock).delete("dev", true).await.unwrap();
    }
}
