//! Idle-VM watchdog.
//!
//! A single task ticks once a minute, reads activity signals from inside
//! each running VM, and stops VMs that stay quiet past the configured
//! timeout. All activity truth lives in the VM itself (the checkpoint
//! file), so restarting the daemon changes nothing: the next tick picks up
//! where the last daemon left off.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::multipass::{Client, VmState};

/// Checkpoint file inside each VM.
pub const CHECKPOINT_PATH: &str = "/tmp/nimbus-activity.json";

/// 1-minute load average above this counts as activity.
const LOAD_THRESHOLD: f64 = 0.1;

/// Counter movement below this is background noise (DHCP, NTP, ARP).
const NETWORK_NOISE_BYTES: u64 = 100_000;

/// Combined probe: one exec prints three lines — aggregate rx/tx bytes,
/// minimum PTY idle seconds (-1 when no PTY exists), and the 1-minute load.
/// One command keeps the snapshot consistent and the engine cost low.
const ACTIVITY_SNIPPET: &str = "awk 'NR>2 {rx+=$2; tx+=$10} END {print rx, tx}' /proc/net/dev; \
     now=$(date +%s); idle=-1; for p in /dev/pts/[0-9]*; do [ -e \"$p\" ] && { t=$(stat -c %Y \"$p\"); i=$((now-t)); [ $idle -lt 0 ] || [ $i -lt $idle ] && idle=$i; }; done; echo $idle; \
     cut -d' ' -f1 /proc/loadavg";

/// Activity state persisted inside the VM.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    timestamp: String,
    rx_bytes: u64,
    tx_bytes: u64,
}

/// One consistent reading of a VM's activity signals.
#[derive(Debug, Clone, Copy)]
struct ActivitySample {
    rx_bytes: u64,
    tx_bytes: u64,
    /// Seconds since the freshest PTY was touched; -1 when none exist.
    pty_idle_secs: i64,
    load_1min: f64,
}

/// Monitors running VMs and stops the inactive ones.
#[derive(Clone)]
pub struct Watchdog {
    mp: Client,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Watchdog {
    pub fn new(mp: Client, timeout: Duration) -> Self {
        Self {
            mp,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// The configured inactivity timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start the tick loop.
    pub fn spawn(&self) -> JoinHandle<()> {
        let wd = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            // The immediate first tick would race VM boot; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = wd.cancel.cancelled() => return,
                    _ = ticker.tick() => wd.check_all_vms().await,
                }
            }
        })
    }

    /// Stop the tick loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn check_all_vms(&self) {
        let vms = match self.mp.list().await {
            Ok(vms) => vms,
            Err(e) => {
                warn!(error = %e, "watchdog list failed, skipping tick");
                return;
            }
        };

        for vm in vms {
            if vm.state == VmState::Running {
                // A failure only skips this VM's tick; others are unaffected.
                if let Err(e) = self.check_vm(&vm.name).await {
                    debug!(vm = %vm.name, error = %e, "activity check failed");
                }
            }
        }
    }

    async fn check_vm(&self, vm_name: &str) -> Result<()> {
        let sample = self.sample(vm_name).await?;

        if self.has_immediate_activity(&sample) {
            self.write_checkpoint(vm_name, &sample).await;
            return Ok(());
        }

        let prev = match self.read_checkpoint(vm_name).await {
            Ok(prev) => prev,
            Err(_) => {
                // Absent or unparseable: start the clock now, never stop.
                self.write_checkpoint(vm_name, &sample).await;
                return Ok(());
            }
        };

        let checkpoint_time = match DateTime::parse_from_rfc3339(&prev.timestamp) {
            Ok(t) => t.with_timezone(&Utc),
            Err(_) => {
                self.write_checkpoint(vm_name, &sample).await;
                return Ok(());
            }
        };

        // Absolute diff: some engines reset counters across suspend.
        let delta = sample.rx_bytes.abs_diff(prev.rx_bytes) + sample.tx_bytes.abs_diff(prev.tx_bytes);
        if delta > NETWORK_NOISE_BYTES {
            self.write_checkpoint(vm_name, &sample).await;
            return Ok(());
        }

        let idle_for = Utc::now().signed_duration_since(checkpoint_time);
        if idle_for.to_std().unwrap_or_default() > self.timeout {
            info!(vm = %vm_name, idle_secs = idle_for.num_seconds(), "stopping inactive vm");
            if let Err(e) = self.mp.stop(vm_name).await {
                // Re-evaluated next tick; a failed stop is not fatal.
                debug!(vm = %vm_name, error = %e, "stop failed");
            }
        }
        Ok(())
    }

    fn has_immediate_activity(&self, sample: &ActivitySample) -> bool {
        if sample.pty_idle_secs >= 0 && (sample.pty_idle_secs as u64) < self.timeout.as_secs() {
            return true;
        }
        sample.load_1min > LOAD_THRESHOLD
    }

    async fn sample(&self, vm_name: &str) -> Result<ActivitySample> {
        let output = self.mp.exec(vm_name, &["sh", "-c", ACTIVITY_SNIPPET]).await?;

        let lines: Vec<&str> = output.trim().lines().collect();
        if lines.len() != 3 {
            return Err(Error::engine_output(
                "activity sample",
                format!("expected 3 lines, got {}", lines.len()),
            ));
        }

        let mut sample = ActivitySample {
            rx_bytes: 0,
            tx_bytes: 0,
            pty_idle_secs: -1,
            load_1min: 0.0,
        };
        let counters: Vec<&str> = lines[0].split_whitespace().collect();
        if counters.len() == 2 {
            sample.rx_bytes = counters[0].parse().unwrap_or(0);
            sample.tx_bytes = counters[1].parse().unwrap_or(0);
        }
        sample.pty_idle_secs = lines[1].trim().parse().unwrap_or(-1);
        sample.load_1min = lines[2].trim().parse().unwrap_or(0.0);

        Ok(sample)
    }

    async fn read_checkpoint(&self, vm_name: &str) -> Result<Checkpoint> {
        let output = self.mp.exec(vm_name, &["cat", CHECKPOINT_PATH]).await?;
        serde_json::from_str(output.trim())
            .map_err(|e| Error::engine_output("read checkpoint", e.to_string()))
    }

    /// Best-effort: a failed write just means the clock restarts later.
    async fn write_checkpoint(&self, vm_name: &str, sample: &ActivitySample) {
        let cp = Checkpoint {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            rx_bytes: sample.rx_bytes,
            tx_bytes: sample.tx_bytes,
        };
        let json = match serde_json::to_string(&cp) {
            Ok(json) => json,
            Err(_) => return,
        };
        let cmd = format!("echo '{}' > {}", json, CHECKPOINT_PATH);
        let _ = self.mp.exec(vm_name, &["sh", "-c", &cmd]).await;
    }
}
