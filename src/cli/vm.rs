//! Local VM commands.

use clap::Args;

use nimbus::launcher::{CreateSpec, Launcher};
use nimbus::multipass::VmState;
use nimbus::network::{self, NetworkConfig, NetworkMode, NetworkRule, RuleType};
use nimbus::{Client, Config, Error, Result};

/// List all VMs in a table.
pub async fn list() -> Result<()> {
    let vms = Client::new().list().await?;
    if vms.is_empty() {
        println!("No VMs found");
        return Ok(());
    }

    println!("{:<20} {:<12} {:<16} {}", "NAME", "STATE", "IPV4", "RELEASE");
    for vm in &vms {
        let ipv4 = vm
            .ipv4
            .first()
            .map(String::as_str)
            .filter(|ip| !ip.is_empty())
            .unwrap_or("-");
        println!(
            "{:<20} {:<12} {:<16} {}",
            vm.name, vm.state, ipv4, vm.release
        );
    }
    Ok(())
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Name for the new VM
    pub name: String,

    /// CPU count (defaults from config)
    #[arg(long, default_value_t = 0)]
    pub cpu: u32,

    /// Memory size, e.g. 4G (defaults from config)
    #[arg(long, default_value = "")]
    pub mem: String,

    /// Disk size, e.g. 20G (defaults from config)
    #[arg(long, default_value = "")]
    pub disk: String,

    /// Cloud-init template path
    #[arg(long)]
    pub cloud_init: Option<String>,

    /// Image name or release, e.g. 24.04
    #[arg(long, default_value = "")]
    pub image: String,

    /// Egress mode: none, allowlist, blocklist, isolated
    #[arg(long)]
    pub network_mode: Option<String>,

    /// Host to allow (repeatable; allowlist mode)
    #[arg(long = "allow", value_name = "HOST")]
    pub allow: Vec<String>,

    /// Host to block (repeatable; blocklist mode)
    #[arg(long = "block", value_name = "HOST")]
    pub block: Vec<String>,
}

/// Create a new VM, filling unset options from the daemon config.
pub async fn create(args: CreateArgs) -> Result<()> {
    let cfg = Config::load()?;

    let network = match args.network_mode.as_deref() {
        None => None,
        Some(mode) => Some(build_network_config(mode, &args.allow, &args.block)?),
    };

    let spec = CreateSpec {
        name: args.name.clone(),
        cpu: args.cpu,
        mem: args.mem,
        disk: args.disk,
        cloud_init: args.cloud_init,
        image: args.image,
        network,
    };

    println!("Creating VM '{}'...", args.name);
    Launcher::new(Client::new()).launch(&cfg, spec).await?;
    println!("VM '{}' created", args.name);
    Ok(())
}

/// Start a stopped VM.
pub async fn start(name: &str) -> Result<()> {
    println!("Starting VM '{}'...", name);
    Client::new().start(name).await?;
    println!("VM '{}' started", name);
    Ok(())
}

/// Stop a running VM.
pub async fn stop(name: &str) -> Result<()> {
    println!("Stopping VM '{}'...", name);
    Client::new().stop(name).await?;
    println!("VM '{}' stopped", name);
    Ok(())
}

/// Restart a VM.
pub async fn restart(name: &str) -> Result<()> {
    println!("Restarting VM '{}'...", name);
    Client::new().restart(name).await?;
    println!("VM '{}' restarted", name);
    Ok(())
}

/// Delete a VM; purges unless asked to keep it recoverable.
pub async fn delete(name: &str, keep_recoverable: bool) -> Result<()> {
    println!("Deleting VM '{}'...", name);
    Launcher::new(Client::new())
        .delete(name, !keep_recoverable)
        .await?;
    println!("VM '{}' deleted", name);
    Ok(())
}

/// Print the browser shell endpoint for a VM.
pub async fn shell_url(name: &str, daemon: &str) -> Result<()> {
    let vm = Client::new().info(name).await?;
    if vm.state != VmState::Running {
        eprintln!(
            "note: VM '{}' is {}; the shell requires it to be running",
            name, vm.state
        );
    }
    println!("ws://{}/api/vms/{}/shell?cols=80&rows=24", daemon, name);
    Ok(())
}

fn build_network_config(mode: &str, allow: &[String], block: &[String]) -> Result<NetworkConfig> {
    let mode = match mode {
        "none" => NetworkMode::None,
        "allowlist" => NetworkMode::Allowlist,
        "blocklist" => NetworkMode::Blocklist,
        "isolated" => NetworkMode::Isolated,
        other => {
            return Err(Error::validation(format!(
                "invalid network mode: {:?}",
                other
            )));
        }
    };

    let rules = match mode {
        NetworkMode::Allowlist => allow.iter().map(|h| parse_network_host(h)).collect(),
        NetworkMode::Blocklist => block.iter().map(|h| parse_network_host(h)).collect(),
        _ => Vec::new(),
    };

    let config = NetworkConfig { mode, rules };
    network::validate(&config)?;
    Ok(config)
}

/// Classify a host argument: anything with a `/` is a CIDR, an all-digit
/// dotted quad is an IP, everything else a domain.
fn parse_network_host(host: &str) -> NetworkRule {
    let rule_type = if host.contains('/') {
        RuleType::Cidr
    } else if is_dotted_quad(host) {
        RuleType::Ip
    } else {
        RuleType::Domain
    };
    NetworkRule {
        rule_type,
        value: host.to_string(),
        comment: None,
    }
}

fn is_dotted_quad(host: &str) -> bool {
    let parts: Vec<&str> = host.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_arguments_classify_by_shape() {
        let cases = [
            ("10.0.0.0/8", RuleType::Cidr),
            ("192.168.1.1", RuleType::Ip),
            ("github.com", RuleType::Domain),
            // Four dotted parts but not all digits: a hostname.
            ("a.b.c.d", RuleType::Domain),
            ("api.v2.github.com", RuleType::Domain),
        ];
        for (host, expected) in cases {
            let rule = parse_network_host(host);
            assert_eq!(rule.rule_type, expected, "{:?}", host);
            assert_eq!(rule.value, host);
        }
    }

    #[test]
    fn allowlist_takes_allow_hosts() {
        let config = build_network_config(
            "allowlist",
            &["github.com".to_string(), "10.0.0.0/8".to_string()],
            &[],
        )
        .unwrap();
        assert_eq!(config.mode, NetworkMode::Allowlist);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].rule_type, RuleType::Domain);
        assert_eq!(config.rules[1].rule_type, RuleType::Cidr);
    }

    #[test]
    fn allowlist_without_hosts_is_rejected() {
        let err = build_network_config("allowlist", &[], &[]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = build_network_config("firewall", &[], &[]).unwrap_err();
        assert!(err.to_string().contains("invalid network mode"));
    }

    #[test]
    fn isolated_needs_no_hosts() {
        let config = build_network_config("isolated", &[], &[]).unwrap();
        assert_eq!(config.mode, NetworkMode::Isolated);
        assert!(config.rules.is_empty());
    }
}
