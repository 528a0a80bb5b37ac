//! The multipass CLI client.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;

use crate::error::{Error, Result};

use super::types::{
    InfoResponse, LaunchOptions, ListInstance, ListResponse, Snapshot, SnapshotsResponse, VmInfo,
};

/// Snapshot names are letter-initial, then letters/digits/dashes.
static SNAPSHOT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9-]*$").expect("snapshot name pattern"));

/// Runs a program and returns its stdout.
///
/// The seam the mock executor plugs into; production code uses
/// [`ShellCommandExecutor`].
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `program` with `args`, capturing stdout and stderr separately.
    ///
    /// A non-zero exit turns into [`Error::Engine`] carrying the full
    /// command line and stderr.
    async fn execute(&self, program: &str, args: &[&str]) -> Result<Vec<u8>>;
}

/// Executor that spawns real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellCommandExecutor;

#[async_trait]
impl CommandExecutor for ShellCommandExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let mut command = program.to_string();
            for arg in args {
                command.push(' ');
                command.push_str(arg);
            }
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::engine(command, stderr));
        }
        Ok(output.stdout)
    }
}

/// Stateless client for the multipass CLI.
///
/// Cheap to clone; safe to call concurrently — the engine serializes its
/// own operations.
#[derive(Clone)]
pub struct Client {
    exec: Arc<dyn CommandExecutor>,
}

impl Client {
    /// Client backed by the real `multipass` binary.
    pub fn new() -> Self {
        Self {
            exec: Arc::new(ShellCommandExecutor),
        }
    }

    /// Client backed by a custom executor (tests).
    pub fn with_executor(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        self.exec.execute("multipass", args).await
    }

    /// List all VMs known to the engine.
    pub async fn list(&self) -> Result<Vec<ListInstance>> {
        let out = self.run(&["list", "--format", "json"]).await?;
        let resp: ListResponse = serde_json::from_slice(&out)
            .map_err(|e| Error::engine_output("list", e.to_string()))?;
        Ok(resp.list)
    }

    /// Detailed descriptor for one VM.
    pub async fn info(&self, name: &str) -> Result<VmInfo> {
        let out = match self.run(&["info", name, "--format", "json"]).await {
            Ok(out) => out,
            Err(Error::Engine { stderr, .. }) if stderr.contains("does not exist") => {
                return Err(Error::vm_not_found(name));
            }
            Err(e) => return Err(e),
        };
        let mut resp: InfoResponse = serde_json::from_slice(&out)
            .map_err(|e| Error::engine_output("info", e.to_string()))?;
        if !resp.errors.is_empty() {
            return Err(Error::engine_output("info", resp.errors.join("; ")));
        }
        resp.info
            .remove(name)
            .ok_or_else(|| Error::vm_not_found(name))
    }

    /// Create and start a new VM.
    pub async fn launch(&self, opts: &LaunchOptions) -> Result<()> {
        let mut args: Vec<String> = vec!["launch".into(), "--name".into(), opts.name.clone()];
        if opts.cpus > 0 {
            args.push("--cpus".into());
            args.push(opts.cpus.to_string());
        }
        if !opts.memory.is_empty() {
            args.push("--memory".into());
            args.push(opts.memory.clone());
        }
        if !opts.disk.is_empty() {
            args.push("--disk".into());
            args.push(opts.disk.clone());
        }
        if !opts.cloud_init.is_empty() {
            args.push("--cloud-init".into());
            args.push(opts.cloud_init.clone());
        }
        if !opts.image.is_empty() {
            args.push(opts.image.clone());
        }
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&argv).await?;
        Ok(())
    }

    /// Start a stopped or suspended VM.
    pub async fn start(&self, name: &str) -> Result<()> {
        self.run(&["start", name]).await?;
        Ok(())
    }

    /// Stop a running VM.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.run(&["stop", name]).await?;
        Ok(())
    }

    /// Restart a VM.
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.run(&["restart", name]).await?;
        Ok(())
    }

    /// Delete a VM, optionally purging it immediately.
    pub async fn delete(&self, name: &str, purge: bool) -> Result<()> {
        if purge {
            self.run(&["delete", name, "--purge"]).await?;
        } else {
            self.run(&["delete", name]).await?;
        }
        Ok(())
    }

    /// Clone `source` into a new VM named `dest`.
    pub async fn clone_vm(&self, source: &str, dest: &str) -> Result<()> {
        self.run(&["clone", source, "-n", dest]).await?;
        Ok(())
    }

    /// All snapshots of a VM, keyed by snapshot name.
    ///
    /// A VM with no snapshots yields an empty map, not an error.
    pub async fn list_snapshots(
        &self,
        vm_name: &str,
    ) -> Result<std::collections::HashMap<String, Snapshot>> {
        let out = self
            .run(&["list", "--snapshots", "--format", "json"])
            .await?;
        let mut resp: SnapshotsResponse = serde_json::from_slice(&out)
            .map_err(|e| Error::engine_output("list snapshots", e.to_string()))?;
        Ok(resp.info.remove(vm_name).unwrap_or_default())
    }

    /// Snapshot a VM. The engine requires the VM to be stopped.
    ///
    /// An empty name lets the engine pick one; otherwise the name must be
    /// letter-initial `[a-zA-Z][a-zA-Z0-9-]*`.
    pub async fn create_snapshot(&self, vm_name: &str, snapshot_name: &str) -> Result<()> {
        if !snapshot_name.is_empty() && !SNAPSHOT_NAME.is_match(snapshot_name) {
            return Err(Error::validation(format!(
                "invalid snapshot name: {:?} (must start with a letter, then letters, digits, or dashes)",
                snapshot_name
            )));
        }
        if snapshot_name.is_empty() {
            self.run(&["snapshot", vm_name]).await?;
        } else {
            self.run(&["snapshot", vm_name, "--name", snapshot_name])
                .await?;
        }
        Ok(())
    }

    /// Restore a VM to a snapshot.
    pub async fn restore_snapshot(
        &self,
        vm_name: &str,
        snapshot_name: &str,
        destructive: bool,
    ) -> Result<()> {
        let target = format!("{}.{}", vm_name, snapshot_name);
        if destructive {
            self.run(&["restore", &target, "--destructive"]).await?;
        } else {
            self.run(&["restore", &target]).await?;
        }
        Ok(())
    }

    /// Delete a snapshot.
    pub async fn delete_snapshot(&self, vm_name: &str, snapshot_name: &str) -> Result<()> {
        let target = format!("{}.{}", vm_name, snapshot_name);
        self.run(&["delete", "--purge", &target]).await?;
        Ok(())
    }

    /// Copy files between host and VM; `vm:path` syntax on either side.
    pub async fn transfer(&self, src: &str, dst: &str) -> Result<()> {
        self.run(&["transfer", src, dst]).await?;
        Ok(())
    }

    /// Run a command in the VM synchronously (no TTY) and return stdout.
    pub async fn exec(&self, vm_name: &str, cmd: &[&str]) -> Result<String> {
        let mut args = vec!["exec", vm_name, "--"];
        args.extend_from_slice(cmd);
        let out = self.run(&args).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Mount a host directory into a VM.
    pub async fn mount(&self, vm_name: &str, host_path: &str, vm_path: &str) -> Result<()> {
        let target = format!("{}:{}", vm_name, vm_path);
        self.run(&["mount", host_path, &target]).await?;
        Ok(())
    }

    /// Remove a mount from a VM.
    pub async fn unmount(&self, vm_name: &str, vm_path: &str) -> Result<()> {
        let target = format!("{}:{}", vm_name, vm_path);
        self.run(&["umount", &target]).await?;
        Ok(())
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
