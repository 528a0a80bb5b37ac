//! Wire types for multipass JSON output.
//!
//! Only `name` and `state` are guaranteed present; everything else defaults
//! so partial output (stopped VMs report no IPs, no load, no disks) still
//! parses.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// VM lifecycle state as reported by the engine.
///
/// Unrecognized strings deserialize to [`VmState::Unknown`] so a newer
/// multipass cannot break routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VmState {
    Running,
    Stopped,
    Suspended,
    Starting,
    Restarting,
    Suspending,
    Deleted,
    #[serde(other)]
    #[default]
    Unknown,
}

impl VmState {
    /// State name exactly as the engine spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Running => "Running",
            VmState::Stopped => "Stopped",
            VmState::Suspended => "Suspended",
            VmState::Starting => "Starting",
            VmState::Restarting => "Restarting",
            VmState::Suspending => "Suspending",
            VmState::Deleted => "Deleted",
            VmState::Unknown => "Unknown",
        }
    }

    /// True for states wake-on-request treats as dormant.
    ///
    /// Transitioning states count as dormant for routing purposes: the
    /// caller gets the placeholder page while the ticket map makes sure no
    /// second start is issued.
    pub fn is_dormant(&self) -> bool {
        !matches!(self, VmState::Running | VmState::Deleted)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One VM in `multipass list --format json` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListInstance {
    pub name: String,
    pub state: VmState,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub release: String,
}

/// Envelope of `multipass list --format json`.
#[derive(Debug, Deserialize)]
pub(crate) struct ListResponse {
    #[serde(default)]
    pub list: Vec<ListInstance>,
}

/// Detailed VM descriptor from `multipass info <vm> --format json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmInfo {
    /// CPU count — the engine sends this as a string, kept verbatim.
    #[serde(default)]
    pub cpu_count: String,
    /// Disk usage keyed by device name (e.g. "sda1").
    #[serde(default)]
    pub disks: HashMap<String, Disk>,
    #[serde(default)]
    pub image_hash: String,
    #[serde(default)]
    pub image_release: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    /// 1/5/15-minute load averages.
    #[serde(default)]
    pub load: Vec<f64>,
    #[serde(default)]
    pub memory: Memory,
    /// Mounts keyed by target path inside the VM.
    #[serde(default)]
    pub mounts: HashMap<String, VmMount>,
    #[serde(default)]
    pub release: String,
    /// Snapshot count — string on the wire, kept verbatim.
    #[serde(default)]
    pub snapshot_count: String,
    #[serde(default)]
    pub state: VmState,
}

impl VmInfo {
    /// First IPv4 address, the one nimbus dials.
    pub fn primary_ip(&self) -> Option<&str> {
        self.ipv4.first().map(String::as_str)
    }
}

/// Envelope of `multipass info --format json`.
#[derive(Debug, Deserialize)]
pub(crate) struct InfoResponse {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub info: HashMap<String, VmInfo>,
}

/// Disk usage; both fields are byte counts as strings on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Disk {
    #[serde(default)]
    pub total: String,
    #[serde(default)]
    pub used: String,
}

/// Memory usage in bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Memory {
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub used: i64,
}

/// A mount entry from the info output.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmMount {
    #[serde(default)]
    pub source_path: String,
}

/// Envelope of `multipass list --snapshots --format json`.
#[derive(Debug, Deserialize)]
pub(crate) struct SnapshotsResponse {
    #[serde(default)]
    pub errors: Vec<String>,
    /// vm name → snapshot name → snapshot.
    #[serde(default)]
    pub info: HashMap<String, HashMap<String, Snapshot>>,
}

/// A VM snapshot; `parent` is empty for children of the base image.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Snapshot {
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub parent: String,
}

/// Options for creating a new VM.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub name: String,
    /// 0 means let the engine pick.
    pub cpus: u32,
    /// e.g. "4G"; empty means engine default.
    pub memory: String,
    /// e.g. "20G"; empty means engine default.
    pub disk: String,
    /// Path to a cloud-init file on the host; empty to skip.
    pub cloud_init: String,
    /// Image name or release (e.g. "24.04"); empty means engine default.
    pub image: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_engine_spelling() {
        for (s, expected) in [
            ("\"Running\"", VmState::Running),
            ("\"Stopped\"", VmState::Stopped),
            ("\"Suspended\"", VmState::Suspended),
            ("\"Starting\"", VmState::Starting),
            ("\"Restarting\"", VmState::Restarting),
            ("\"Suspending\"", VmState::Suspending),
            ("\"Deleted\"", VmState::Deleted),
        ] {
            let parsed: VmState = serde_json::from_str(s).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(serde_json::to_string(&parsed).unwrap(), s);
        }
    }

    #[test]
    fn unrecognized_state_becomes_unknown() {
        let parsed: VmState = serde_json::from_str("\"Hibernating\"").unwrap();
        assert_eq!(parsed, VmState::Unknown);
    }

    #[test]
    fn dormant_states_for_routing() {
        assert!(VmState::Stopped.is_dormant());
        assert!(VmState::Suspended.is_dormant());
        assert!(VmState::Starting.is_dormant());
        assert!(VmState::Unknown.is_dormant());
        assert!(!VmState::Running.is_dormant());
        assert!(!VmState::Deleted.is_dormant());
    }

    #[test]
    fn info_parses_string_typed_numerics() {
        let raw = r#"{
            "cpu_count": "2",
            "disks": {"sda1": {"total": "4081515520", "used": "2184845824"}},
            "image_hash": "abc123",
            "image_release": "24.04 LTS",
            "ipv4": ["192.168.2.3"],
            "load": [0.1, 0.05, 0.01],
            "memory": {"total": 472784896, "used": 180793344},
            "mounts": {},
            "release": "Ubuntu 24.04.3 LTS",
            "snapshot_count": "2",
            "state": "Running"
        }"#;
        let info: VmInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.cpu_count, "2");
        assert_eq!(info.snapshot_count, "2");
        assert_eq!(info.disks["sda1"].total, "4081515520");
        assert_eq!(info.disks["sda1"].used, "2184845824");
        assert_eq!(info.state, VmState::Running);
        assert_eq!(info.primary_ip(), Some("192.168.2.3"));
    }

    #[test]
    fn info_tolerates_absent_optional_fields() {
        // A stopped VM reports little more than its state.
        let raw = r#"{"state": "Stopped"}"#;
        let info: VmInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.state, VmState::Stopped);
        assert!(info.ipv4.is_empty());
        assert!(info.disks.is_empty());
        assert!(info.mounts.is_empty());
        assert_eq!(info.primary_ip(), None);
        assert_eq!(info.memory.total, 0);
    }

    #[test]
    fn snapshot_parent_defaults_to_base() {
        let raw = r#"{"comment": "before upgrade"}"#;
        let snap: Snapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snap.parent, "");
        assert_eq!(snap.comment, "before upgrade");
    }
}
