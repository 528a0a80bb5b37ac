//! Installs rendered policy artifacts into a VM.
//!
//! Installation protocol: stage the three files in a host temp directory,
//! `transfer` each into `/tmp` inside the VM (transfer runs unprivileged),
//! then sudo-move them into place, reload units, enable the boot service,
//! and run the script once. Any failed step aborts with an error naming it.

use std::path::Path;

use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};
use crate::multipass::Client;

use super::{
    render_config_json, render_script, render_service_unit, validate, NetworkConfig,
    VM_CONFIG_FILE, VM_NETWORK_DIR, VM_SCRIPT_FILE, VM_SERVICE_FILE,
};

/// Applies egress policies to running VMs.
#[derive(Clone)]
pub struct Applier {
    mp: Client,
}

impl Applier {
    pub fn new(mp: Client) -> Self {
        Self { mp }
    }

    /// Validate, render, and install a policy into a running VM.
    pub async fn apply_to_vm(&self, vm_name: &str, config: &NetworkConfig) -> Result<()> {
        validate(config)?;

        let script = render_script(config);
        let config_json = render_config_json(config)?;
        let service = render_service_unit();

        let staging = tempfile::Builder::new()
            .prefix("nimbus-network-")
            .tempdir()
            .map_err(|e| Error::policy_step("create staging dir", e.to_string()))?;

        let config_path = staging.path().join("config.json");
        let script_path = staging.path().join("apply-rules.sh");
        let service_path = staging.path().join("nimbus-network.service");

        stage(&config_path, &config_json).await?;
        stage(&script_path, &script).await?;
        stage(&service_path, &service).await?;

        self.mp
            .exec(vm_name, &["sudo", "mkdir", "-p", VM_NETWORK_DIR])
            .await
            .map_err(|e| Error::policy_step("create network dir", e.to_string()))?;

        // Push to /tmp first; transfer runs as the unprivileged default user.
        self.push(vm_name, &config_path, "/tmp/nimbus-config.json", "config")
            .await?;
        self.push(vm_name, &script_path, "/tmp/nimbus-apply-rules.sh", "script")
            .await?;
        self.push(
            vm_name,
            &service_path,
            "/tmp/nimbus-network.service",
            "service",
        )
        .await?;

        self.sudo_step(vm_name, &["mv", "/tmp/nimbus-config.json", VM_CONFIG_FILE], "install config")
            .await?;
        self.sudo_step(vm_name, &["mv", "/tmp/nimbus-apply-rules.sh", VM_SCRIPT_FILE], "install script")
            .await?;
        self.sudo_step(vm_name, &["mv", "/tmp/nimbus-network.service", VM_SERVICE_FILE], "install service")
            .await?;
        self.sudo_step(vm_name, &["chmod", "+x", VM_SCRIPT_FILE], "mark script executable")
            .await?;
        self.sudo_step(vm_name, &["systemctl", "daemon-reload"], "reload systemd")
            .await?;
        self.sudo_step(
            vm_name,
            &["systemctl", "enable", "nimbus-network.service"],
            "enable service",
        )
        .await?;
        self.sudo_step(vm_name, &[VM_SCRIPT_FILE], "apply rules").await?;

        info!(vm = %vm_name, mode = config.mode.as_str(), "network policy applied");
        Ok(())
    }

    /// Read the canonical policy back from the VM.
    ///
    /// A missing descriptor means "no restrictions", not an error.
    pub async fn current_config(&self, vm_name: &str) -> Result<Option<NetworkConfig>> {
        let output = match self.mp.exec(vm_name, &["cat", VM_CONFIG_FILE]).await {
            Ok(out) => out,
            Err(e) if e.is_no_such_file() => return Ok(None),
            Err(e) => return Err(e),
        };

        let trimmed = output.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let config: NetworkConfig = serde_json::from_str(trimmed)
            .map_err(|e| Error::policy_step("parse config", e.to_string()))?;
        Ok(Some(config))
    }

    /// Drop all restrictions by applying the unrestricted policy.
    pub async fn remove_from_vm(&self, vm_name: &str) -> Result<()> {
        self.apply_to_vm(vm_name, &NetworkConfig::none()).await
    }

    /// Whether a policy descriptor is installed in the VM.
    ///
    /// Any failure (missing file, VM unreachable) reads as "not
    /// configured"; this is a status probe, not a health check.
    pub async fn is_configured(&self, vm_name: &str) -> bool {
        self.mp
            .exec(vm_name, &["test", "-f", VM_CONFIG_FILE])
            .await
            .is_ok()
    }

    async fn push(&self, vm_name: &str, src: &Path, dst: &str, what: &str) -> Result<()> {
        let target = format!("{}:{}", vm_name, dst);
        self.mp
            .transfer(&src.to_string_lossy(), &target)
            .await
            .map_err(|e| Error::policy_step(format!("transfer {}", what), e.to_string()))
    }

    async fn sudo_step(&self, vm_name: &str, cmd: &[&str], step: &str) -> Result<()> {
        let mut argv = vec!["sudo"];
        argv.extend_from_slice(cmd);
        self.mp
            .exec(vm_name, &argv)
            .await
            .map(|_| ())
            .map_err(|e| Error::policy_step(step, e.to_string()))
    }
}

async fn stage(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content)
        .await
        .map_err(|e| Error::policy_step("stage artifact", e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{NetworkMode, NetworkRule, RuleType};
    use super::*;
    use crate::multipass::testing::MockExecutor;
    use crate::multipass::Client;

    fn allowlist_github() -> NetworkConfig {
        NetworkConfig {
            mode: NetworkMode::Allowlist,
            rules: vec![NetworkRule {
                rule_type: RuleType::Domain,
                value: "github.com".into(),
                comment: None,
            }],
        }
    }

    /// Wire up every exec the install protocol issues. Transfers carry a
    /// random staging path, so those are matched by prefix afterwards.
    fn arm_install_execs(mock: &MockExecutor, vm: &str) {
        for cmd in [
            format!("multipass exec {} -- sudo mkdir -p {}", vm, VM_NETWORK_DIR),
            format!(
                "multipass exec {} -- sudo mv /tmp/nimbus-config.json {}",
                vm, VM_CONFIG_FILE
            ),
            format!(
                "multipass exec {} -- sudo mv /tmp/nimbus-apply-rules.sh {}",
                vm, VM_SCRIPT_FILE
            ),
            format!(
                "multipass exec {} -- sudo mv /tmp/nimbus-network.service {}",
                vm, VM_SERVICE_FILE
            ),
            format!("multipass exec {} -- sudo chmod +x {}", vm, VM_SCRIPT_FILE),
            format!("multipass exec {} -- sudo systemctl daemon-reload", vm),
            format!(
                "multipass exec {} -- sudo systemctl enable nimbus-network.service",
                vm
            ),
            format!("multipass exec {} -- sudo {}", vm, VM_SCRIPT_FILE),
        ] {
            mock.set_response(&cmd, "");
        }
    }

    #[tokio::test]
    async fn apply_runs_the_full_install_sequence() {
        let mock = Arc::new(MockExecutor::new());
        arm_install_execs(&mock, "alpha");
        // Transfers embed the random staging dir; match by prefix.
        mock.set_response_prefix("multipass transfer ", "");

        let applier = Applier::new(Client::with_executor(mock.clone()));
        applier
            .apply_to_vm("alpha", &allowlist_github())
            .await
            .unwrap();

        let calls = mock.calls();
        let pos = |needle: &str| {
            calls
                .iter()
                .position(|c| c.contains(needle))
                .unwrap_or_else(|| panic!("missing call containing {:?}", needle))
        };

        // One transfer per artifact.
        assert_eq!(mock.count_calls_with_prefix("multipass transfer"), 3);
        let transfers: Vec<&String> = calls
            .iter()
            .filter(|c| c.starts_with("multipass transfer"))
            .collect();
        assert!(transfers[0].ends_with("alpha:/tmp/nimbus-config.json"));
        assert!(transfers[1].ends_with("alpha:/tmp/nimbus-apply-rules.sh"));
        assert!(transfers[2].ends_with("alpha:/tmp/nimbus-network.service"));

        // mkdir, then transfers, then moves, chmod, systemd, run.
        assert!(pos("mkdir -p /opt/nimbus/network") < pos("transfer"));
        assert!(pos("transfer") < pos("mv /tmp/nimbus-config.json"));
        assert!(pos("mv /tmp/nimbus-config.json") < pos("chmod +x"));
        assert!(pos("chmod +x") < pos("daemon-reload"));
        assert!(pos("daemon-reload") < pos("systemctl enable nimbus-network.service"));
        assert!(
            pos("systemctl enable nimbus-network.service")
                < pos("sudo /opt/nimbus/network/apply-rules.sh")
        );
    }

    #[tokio::test]
    async fn invalid_config_mutates_nothing() {
        let mock = Arc::new(MockExecutor::new());
        let applier = Applier::new(Client::with_executor(mock.clone()));

        let bad = NetworkConfig {
            mode: NetworkMode::Allowlist,
            rules: vec![],
        };
        let err = applier.apply_to_vm("alpha", &bad).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(mock.calls().is_empty(), "no engine command may run");
    }

    #[tokio::test]
    async fn missing_config_file_means_unrestricted() {
        let mock = Arc::new(MockExecutor::new());
        mock.set_error(
            "multipass exec alpha -- cat /opt/nimbus/network/config.json",
            "cat: /opt/nimbus/network/config.json: No such file or directory",
        );
        let applier = Applier::new(Client::with_executor(mock));
        let config = applier.current_config("alpha").await.unwrap();
        assert!(config.is_none());
    }

    #[tokio::test]
    async fn current_config_round_trips() {
        let mock = Arc::new(MockExecutor::new());
        let stored = render_config_json(&allowlist_github()).unwrap();
        mock.set_response(
            "multipass exec alpha -- cat /opt/nimbus/network/config.json",
            stored,
        );
        let applier = Applier::new(Client::with_executor(mock));
        let config = applier.current_config("alpha").await.unwrap().unwrap();
        assert_eq!(config, allowlist_github());
    }

    #[tokio::test]
    async fn empty_config_file_means_unrestricted() {
        let mock = Arc::new(MockExecutor::new());
        mock.set_response(
            "multipass exec alpha -- cat /opt/nimbus/network/config.json",
            "  \n",
        );
        let applier = Applier::new(Client::with_executor(mock));
        assert!(applier.current_config("alpha").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn is_configured_probes_the_descriptor() {
        let mock = Arc::new(MockExecutor::new());
        mock.set_response(
            "multipass exec alpha -- test -f /opt/nimbus/network/config.json",
            "",
        );
        mock.set_error(
            "multipass exec bare -- test -f /opt/nimbus/network/config.json",
            "exec failed: test exited 1",
        );
        let applier = Applier::new(Client::with_executor(mock));

        assert!(applier.is_configured("alpha").await);
        assert!(!applier.is_configured("bare").await);
    }

    #[tokio::test]
    async fn other_exec_errors_propagate() {
        let mock = Arc::new(MockExecutor::new());
        mock.set_error(
            "multipass exec alpha -- cat /opt/nimbus/network/config.json",
            "exec failed: instance is not running",
        );
        let applier = Applier::new(Client::with_executor(mock));
        assert!(applier.current_config("alpha").await.is_err());
    }
}
