//! Rendering and validation of egress policies.

use crate::error::{Error, Result};

use super::{NetworkConfig, NetworkMode, NetworkRule, RuleType, CHAIN_NAME, VM_SCRIPT_FILE};

/// Validate a policy before any side effect.
///
/// An invalid rule aborts the entire apply with no mutation: this runs
/// before anything is rendered, staged, or transferred.
pub fn validate(config: &NetworkConfig) -> Result<()> {
    match config.mode {
        NetworkMode::None | NetworkMode::Isolated => return Ok(()),
        NetworkMode::Allowlist | NetworkMode::Blocklist => {
            if config.rules.is_empty() {
                return Err(Error::validation(format!(
                    "mode {:?} requires at least one rule",
                    config.mode.as_str()
                )));
            }
        }
    }

    for (i, rule) in config.rules.iter().enumerate() {
        validate_rule(rule).map_err(|e| Error::validation(format!("rule {}: {}", i + 1, e)))?;
    }
    Ok(())
}

fn validate_rule(rule: &NetworkRule) -> std::result::Result<(), String> {
    if rule.value.is_empty() {
        return Err("rule value cannot be empty".into());
    }
    match rule.rule_type {
        RuleType::Ip => {
            if !is_valid_ipv4(&rule.value) {
                return Err(format!("invalid ip address: {:?}", rule.value));
            }
        }
        RuleType::Cidr => {
            if !rule.value.contains('/') {
                return Err(format!("cidr must contain /: {:?}", rule.value));
            }
        }
        RuleType::Domain => {
            if rule.value.chars().any(char::is_whitespace) {
                return Err(format!("domain cannot contain whitespace: {:?}", rule.value));
            }
        }
    }
    Ok(())
}

/// Strict dotted-quad check: four octets in 0..=255, no leading zeros.
fn is_valid_ipv4(ip: &str) -> bool {
    let parts: Vec<&str> = ip.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    for part in parts {
        if part.is_empty() || part.len() > 3 {
            return false;
        }
        if !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        // "0" is fine, "01" is not.
        if part.len() > 1 && part.starts_with('0') {
            return false;
        }
        if part.parse::<u16>().map(|v| v > 255).unwrap_or(true) {
            return false;
        }
    }
    true
}

/// Render the iptables script for a policy.
pub fn render_script(config: &NetworkConfig) -> String {
    let mut s = String::with_capacity(2048);
    s.push_str("#!/bin/bash\n");
    s.push_str("# Nimbus network rules\n");
    s.push_str(&format!("# Mode: {}\n", config.mode.as_str()));
    s.push_str("# Generated automatically - do not edit manually\n\n");
    s.push_str("set -e\n\n");

    s.push_str("# Flush existing rules\n");
    s.push_str("iptables -F OUTPUT 2>/dev/null || true\n");
    s.push_str("iptables -F INPUT 2>/dev/null || true\n");
    s.push_str(&format!("iptables -F {} 2>/dev/null || true\n\n", CHAIN_NAME));

    s.push_str("# Delete and recreate the dedicated chain\n");
    s.push_str(&format!("iptables -X {} 2>/dev/null || true\n", CHAIN_NAME));
    s.push_str(&format!("iptables -N {} 2>/dev/null || true\n\n", CHAIN_NAME));

    match config.mode {
        NetworkMode::Isolated => {
            s.push_str("# ISOLATED MODE - no network access\n");
            s.push_str("iptables -P OUTPUT DROP\n");
            s.push_str("iptables -P INPUT DROP\n\n");
            push_baseline_allows(&mut s);
        }
        NetworkMode::Allowlist => {
            s.push_str("# ALLOWLIST MODE - default deny, allow listed hosts\n");
            s.push_str("iptables -P OUTPUT DROP\n");
            s.push_str("iptables -P INPUT DROP\n\n");
            push_baseline_allows(&mut s);

            s.push_str("# Allow DNS so domain rules can resolve\n");
            s.push_str("iptables -A OUTPUT -p udp --dport 53 -j ACCEPT\n");
            s.push_str("iptables -A OUTPUT -p tcp --dport 53 -j ACCEPT\n\n");

            s.push_str(&format!("iptables -A OUTPUT -j {}\n\n", CHAIN_NAME));
            for rule in &config.rules {
                push_rule(&mut s, rule, "ACCEPT");
            }
        }
        NetworkMode::Blocklist => {
            s.push_str("# BLOCKLIST MODE - default allow, block listed hosts\n");
            s.push_str("iptables -P OUTPUT ACCEPT\n");
            s.push_str("iptables -P INPUT ACCEPT\n\n");
            push_baseline_allows(&mut s);

            s.push_str(&format!("iptables -A OUTPUT -j {}\n\n", CHAIN_NAME));
            for rule in &config.rules {
                push_rule(&mut s, rule, "DROP");
            }
        }
        NetworkMode::None => {
            s.push_str("# NONE MODE - no restrictions\n");
            s.push_str("iptables -P OUTPUT ACCEPT\n");
            s.push_str("iptables -P INPUT ACCEPT\n");
        }
    }

    s.push_str(&format!(
        "\necho \"Network rules applied (mode: {})\"\n",
        config.mode.as_str()
    ));
    s
}

/// Loopback, established/related, and the auto-detected gateway subnet are
/// always permitted so the host can keep talking to the VM.
fn push_baseline_allows(s: &mut String) {
    s.push_str("# Allow loopback\n");
    s.push_str("iptables -A OUTPUT -o lo -j ACCEPT\n");
    s.push_str("iptables -A INPUT -i lo -j ACCEPT\n\n");

    s.push_str("# Allow established connections\n");
    s.push_str("iptables -A INPUT -m state --state ESTABLISHED,RELATED -j ACCEPT\n");
    s.push_str("iptables -A OUTPUT -m state --state ESTABLISHED,RELATED -j ACCEPT\n\n");

    s.push_str("# Allow the bridge network (host-VM communication)\n");
    s.push_str("GATEWAY_IP=$(ip route | grep default | awk '{print $3}')\n");
    s.push_str("if [ -n \"$GATEWAY_IP\" ]; then\n");
    s.push_str("    GATEWAY_NET=$(echo \"$GATEWAY_IP\" | sed 's/\\.[0-9]*$/.0\\/24/')\n");
    s.push_str("    iptables -A OUTPUT -d \"$GATEWAY_NET\" -j ACCEPT\n");
    s.push_str("    iptables -A INPUT -s \"$GATEWAY_NET\" -j ACCEPT\n");
    s.push_str("fi\n\n");
}

fn push_rule(s: &mut String, rule: &NetworkRule, verdict: &str) {
    let label = match verdict {
        "ACCEPT" => "Allow",
        _ => "Block",
    };
    let comment = rule
        .comment
        .as_deref()
        .map(|c| format!(" - {}", c))
        .unwrap_or_default();
    match rule.rule_type {
        RuleType::Ip | RuleType::Cidr => {
            let kind = if rule.rule_type == RuleType::Ip {
                "IP"
            } else {
                "CIDR"
            };
            s.push_str(&format!("# {} {}: {}{}\n", label, kind, rule.value, comment));
            s.push_str(&format!(
                "iptables -A {} -d {} -j {}\n\n",
                CHAIN_NAME, rule.value, verdict
            ));
        }
        RuleType::Domain => {
            s.push_str(&format!(
                "# {} domain: {}{}\n# Resolve and {} every address for this domain\n",
                label,
                rule.value,
                comment,
                label.to_lowercase()
            ));
            s.push_str(&format!(
                "for ip in $(dig +short {} A 2>/dev/null | grep -E '^[0-9]+\\.[0-9]+\\.[0-9]+\\.[0-9]+$'); do\n",
                rule.value
            ));
            s.push_str(&format!(
                "    iptables -A {} -d \"$ip\" -j {} 2>/dev/null || true\ndone\n",
                CHAIN_NAME, verdict
            ));
            s.push_str(&format!(
                "for ip in $(dig +short {} AAAA 2>/dev/null | grep -v '\\.$'); do\n",
                rule.value
            ));
            s.push_str(&format!(
                "    ip6tables -A {} -d \"$ip\" -j {} 2>/dev/null || true\ndone\n\n",
                CHAIN_NAME, verdict
            ));
        }
    }
}

/// The systemd oneshot unit that re-applies rules on boot.
pub fn render_service_unit() -> String {
    format!(
        "[Unit]\n\
         Description=Nimbus Network Rules\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart={}\n\
         RemainAfterExit=yes\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        VM_SCRIPT_FILE
    )
}

/// The canonical JSON descriptor stored inside the VM.
pub fn render_config_json(config: &NetworkConfig) -> Result<String> {
    serde_json::to_string_pretty(config)
        .map_err(|e| Error::policy_step("render config", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(rule_type: RuleType, value: &str) -> NetworkRule {
        NetworkRule {
            rule_type,
            value: value.into(),
            comment: None,
        }
    }

    #[test]
    fn none_and_isolated_need_no_rules() {
        validate(&NetworkConfig::none()).unwrap();
        validate(&NetworkConfig {
            mode: NetworkMode::Isolated,
            rules: vec![],
        })
        .unwrap();
    }

    #[test]
    fn allowlist_requires_rules() {
        let err = validate(&NetworkConfig {
            mode: NetworkMode::Allowlist,
            rules: vec![],
        })
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = validate(&NetworkConfig {
            mode: NetworkMode::Blocklist,
            rules: vec![],
        })
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn ip_rule_validation() {
        let valid = ["192.168.1.1", "0.0.0.0", "255.255.255.255", "8.8.8.8"];
        for ip in valid {
            validate(&NetworkConfig {
                mode: NetworkMode::Blocklist,
                rules: vec![rule(RuleType::Ip, ip)],
            })
            .unwrap_or_else(|e| panic!("{} should be valid: {}", ip, e));
        }

        let invalid = [
            "256.0.0.1",   // octet out of range
            "01.02.03.04", // leading zeros
            "1.2.3",       // too few octets
            "1.2.3.4.5",   // too many
            "a.b.c.d",     // not numeric
            "",            // empty
            "1.2.3.-4",    // sign
        ];
        for ip in invalid {
            let err = validate(&NetworkConfig {
                mode: NetworkMode::Blocklist,
                rules: vec![rule(RuleType::Ip, ip)],
            });
            assert!(err.is_err(), "{:?} should be invalid", ip);
        }
    }

    #[test]
    fn cidr_rule_needs_slash() {
        validate(&NetworkConfig {
            mode: NetworkMode::Allowlist,
            rules: vec![rule(RuleType::Cidr, "10.0.0.0/8")],
        })
        .unwrap();

        let err = validate(&NetworkConfig {
            mode: NetworkMode::Allowlist,
            rules: vec![rule(RuleType::Cidr, "10.0.0.0")],
        });
        assert!(err.is_err());
    }

    #[test]
    fn domain_rule_rejects_whitespace() {
        validate(&NetworkConfig {
            mode: NetworkMode::Allowlist,
            rules: vec![rule(RuleType::Domain, "github.com")],
        })
        .unwrap();

        let err = validate(&NetworkConfig {
            mode: NetworkMode::Allowlist,
            rules: vec![rule(RuleType::Domain, "github .com")],
        });
        assert!(err.is_err());
    }

    #[test]
    fn first_invalid_rule_aborts_with_index() {
        let err = validate(&NetworkConfig {
            mode: NetworkMode::Blocklist,
            rules: vec![rule(RuleType::Ip, "8.8.8.8"), rule(RuleType::Ip, "999.1.1.1")],
        })
        .unwrap_err();
        assert!(err.to_string().contains("rule 2"));
    }

    #[test]
    fn isolated_script_drops_by_default() {
        let script = render_script(&NetworkConfig {
            mode: NetworkMode::Isolated,
            rules: vec![],
        });
        assert!(script.contains("iptables -P OUTPUT DROP"));
        assert!(script.contains("iptables -P INPUT DROP"));
        assert!(script.contains("-o lo -j ACCEPT"));
        assert!(script.contains("ESTABLISHED,RELATED"));
        assert!(script.contains("GATEWAY_IP=$(ip route"));
        // No DNS hole in isolated mode.
        assert!(!script.contains("--dport 53"));
    }

    #[test]
    fn allowlist_script_opens_dns_and_appends_accepts() {
        let script = render_script(&NetworkConfig {
            mode: NetworkMode::Allowlist,
            rules: vec![
                rule(RuleType::Ip, "140.82.112.3"),
                rule(RuleType::Domain, "github.com"),
            ],
        });
        assert!(script.contains("iptables -P OUTPUT DROP"));
        assert!(script.contains("--dport 53 -j ACCEPT"));
        assert!(script.contains("iptables -A OUTPUT -j NIMBUS_OUT"));
        assert!(script.contains("iptables -A NIMBUS_OUT -d 140.82.112.3 -j ACCEPT"));
        assert!(script.contains("dig +short github.com A"));
        assert!(script.contains("-j ACCEPT 2>/dev/null || true"));
    }

    #[test]
    fn blocklist_script_drops_listed_hosts() {
        let script = render_script(&NetworkConfig {
            mode: NetworkMode::Blocklist,
            rules: vec![rule(RuleType::Cidr, "10.0.0.0/8")],
        });
        assert!(script.contains("iptables -P OUTPUT ACCEPT"));
        assert!(script.contains("iptables -A NIMBUS_OUT -d 10.0.0.0/8 -j DROP"));
    }

    #[test]
    fn script_always_resets_the_chain() {
        for mode in [
            NetworkMode::None,
            NetworkMode::Allowlist,
            NetworkMode::Blocklist,
            NetworkMode::Isolated,
        ] {
            let mut config = NetworkConfig {
                mode,
                rules: vec![rule(RuleType::Ip, "1.1.1.1")],
            };
            if matches!(mode, NetworkMode::None | NetworkMode::Isolated) {
                config.rules.clear();
            }
            let script = render_script(&config);
            assert!(script.contains("iptables -X NIMBUS_OUT"), "{:?}", mode);
            assert!(script.contains("iptables -N NIMBUS_OUT"), "{:?}", mode);
        }
    }

    #[test]
    fn service_unit_runs_the_script() {
        let unit = render_service_unit();
        assert!(unit.contains("Type=oneshot"));
        assert!(unit.contains("ExecStart=/opt/nimbus/network/apply-rules.sh"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn config_json_round_trips() {
        let config = NetworkConfig {
            mode: NetworkMode::Allowlist,
            rules: vec![NetworkRule {
                rule_type: RuleType::Domain,
                value: "github.com".into(),
                comment: Some("code hosting".into()),
            }],
        };
        let json = render_config_json(&config).unwrap();
        let parsed: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
        assert!(json.contains("\"allowlist\""));
        assert!(json.contains("\"domain\""));
    }
}
