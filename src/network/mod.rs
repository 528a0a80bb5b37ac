//! Per-VM egress policy: rendering, validation, and installation.
//!
//! A policy is rendered to three artifacts — an iptables script, a systemd
//! oneshot unit that re-applies it on boot, and a JSON descriptor — and
//! installed into the VM. The VM's copy of the descriptor is canonical: the
//! daemon holds no policy state of its own.

mod applier;
mod rules;

pub use applier::Applier;
pub use rules::{render_config_json, render_script, render_service_unit, validate};

use serde::{Deserialize, Serialize};

/// Where the policy artifacts live inside each VM.
pub const VM_NETWORK_DIR: &str = "/opt/nimbus/network";
/// Canonical policy descriptor inside the VM.
pub const VM_CONFIG_FILE: &str = "/opt/nimbus/network/config.json";
/// Executable rules script inside the VM.
pub const VM_SCRIPT_FILE: &str = "/opt/nimbus/network/apply-rules.sh";
/// Boot-time unit file inside the VM.
pub const VM_SERVICE_FILE: &str = "/etc/systemd/system/nimbus-network.service";
/// Name of the dedicated iptables chain the script owns.
pub const CHAIN_NAME: &str = "NIMBUS_OUT";

/// Egress restriction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No restrictions.
    #[default]
    None,
    /// Default deny, allow listed hosts.
    Allowlist,
    /// Default allow, block listed hosts.
    Blocklist,
    /// No network access beyond loopback and the host bridge.
    Isolated,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Allowlist => "allowlist",
            NetworkMode::Blocklist => "blocklist",
            NetworkMode::Isolated => "isolated",
        }
    }
}

/// What a rule's value denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Ip,
    Cidr,
    /// Resolved via `dig` at apply time; one iptables rule per answer.
    Domain,
}

/// A single allow/block entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// A complete egress policy for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<NetworkRule>,
}

impl NetworkConfig {
    /// The unrestricted policy.
    pub fn none() -> Self {
        Self::default()
    }

    /// True when the policy imposes no restrictions.
    pub fn is_none(&self) -> bool {
        self.mode == NetworkMode::None
    }
}
