//! Cloud-init template handling for VM creation.
//!
//! Launch merges three inputs: the base template (user-supplied or the
//! built-in default), the daemon's auth token (textual substitution of
//! [`AUTH_TOKEN_PLACEHOLDER`]), and optionally the rendered network-policy
//! artifacts spliced into the template's first `runcmd:` block.

use crate::error::Result;
use crate::network::{
    self, NetworkConfig, VM_CONFIG_FILE, VM_NETWORK_DIR, VM_SCRIPT_FILE, VM_SERVICE_FILE,
};

/// Placeholder replaced with the daemon's auth token at launch time.
pub const AUTH_TOKEN_PLACEHOLDER: &str = "__NIMBUS_AUTH_TOKEN__";

/// The built-in cloud-init used when no template is configured.
///
/// Sets up the default user, a baseline tool set, and the in-VM agent
/// service on port 1234 with the daemon token as its password.
pub const DEFAULT_CLOUD_INIT: &str = r#"#cloud-config
# Default nimbus cloud-init configuration
# Edit ~/.config/nimbus/cloud-init.yaml to customize all new VMs

package_update: true

packages:
  - git
  - curl
  - wget
  - jq
  - tmux
  - bash-completion

users:
  - default
  - name: ubuntu
    sudo: ALL=(ALL) NOPASSWD:ALL
    shell: /bin/bash

timezone: UTC

runcmd:
  - mkdir -p /home/ubuntu/.local/bin
  - chown -R ubuntu:ubuntu /home/ubuntu
  # Fallback for terminals the guest has no terminfo for
  - |
    cat >> /home/ubuntu/.bashrc << 'NIMBUSRC'
    if ! infocmp "$TERM" >/dev/null 2>&1; then
      export TERM=xterm-256color
    fi
    export NIMBUS_AGENT_PASSWORD="__NIMBUS_AUTH_TOKEN__"
    NIMBUSRC
  - chown ubuntu:ubuntu /home/ubuntu/.bashrc
  # In-VM agent web service, protected by the daemon token
  - |
    cat > /etc/systemd/system/nimbus-agent.service << 'NIMBUSAGENT'
    [Unit]
    Description=Nimbus Agent Web Server
    After=network.target

    [Service]
    Type=simple
    User=ubuntu
    WorkingDirectory=/home/ubuntu
    Environment="HOME=/home/ubuntu"
    Environment="NIMBUS_AGENT_PASSWORD=__NIMBUS_AUTH_TOKEN__"
    ExecStart=/home/ubuntu/.local/bin/nimbus-agent serve --port 1234 --hostname 0.0.0.0
    Restart=always
    RestartSec=10

    [Install]
    WantedBy=multi-user.target
    NIMBUSAGENT
  - systemctl daemon-reload
  - systemctl enable nimbus-agent.service
  - systemctl start nimbus-agent.service || true
"#;

/// Substitute the daemon's auth token into a template.
pub fn inject_auth_token(base: &str, auth_token: &str) -> String {
    base.replace(AUTH_TOKEN_PLACEHOLDER, auth_token)
}

/// Splice the rendered network-policy setup into a template's `runcmd:`.
///
/// Policies with mode `none` leave the template untouched. The merge is
/// deterministic: the same inputs always produce the same output, and every
/// line outside the inserted section is preserved verbatim.
pub fn merge_network_policy(base: &str, config: &NetworkConfig) -> Result<String> {
    if config.is_none() {
        return Ok(base.to_string());
    }
    network::validate(config)?;

    let script = network::render_script(config);
    let service = network::render_service_unit();
    let config_json = network::render_config_json(config)?;
    let section = build_network_section(&script, &service, &config_json);

    Ok(splice_into_runcmd(base, &section))
}

/// Build the runcmd items that install the policy on first boot.
///
/// Heredoc delimiters are quoted, so the embedded script's `$` variables
/// reach the installed file unexpanded.
fn build_network_section(script: &str, service: &str, config_json: &str) -> String {
    let mut s = String::with_capacity(script.len() + service.len() + config_json.len() + 512);
    s.push_str("\n  # Nimbus network restrictions setup\n");
    s.push_str(&format!("  - mkdir -p {}\n", VM_NETWORK_DIR));
    s.push_str("  - |\n");
    s.push_str(&format!("    cat > {} << 'NIMBUSCONFIG'\n", VM_CONFIG_FILE));
    s.push_str(config_json);
    s.push_str("\nNIMBUSCONFIG\n");
    s.push_str("  - |\n");
    s.push_str(&format!("    cat > {} << 'NIMBUSSCRIPT'\n", VM_SCRIPT_FILE));
    s.push_str(script);
    s.push_str("\nNIMBUSSCRIPT\n");
    s.push_str(&format!("  - chmod +x {}\n", VM_SCRIPT_FILE));
    s.push_str("  - |\n");
    s.push_str(&format!("    cat > {} << 'NIMBUSSERVICE'\n", VM_SERVICE_FILE));
    s.push_str(service);
    s.push_str("\nNIMBUSSERVICE\n");
    s.push_str("  - systemctl daemon-reload\n");
    s.push_str("  - systemctl enable nimbus-network.service\n");
    s.push_str(&format!("  - {}\n", VM_SCRIPT_FILE));
    s
}

/// Insert `section` inside the first `runcmd:` block, or append a new block.
fn splice_into_runcmd(base: &str, section: &str) -> String {
    let mut result: Vec<&str> = Vec::new();
    let mut in_runcmd = false;
    let mut inserted = false;

    for line in base.lines() {
        if !inserted && line.trim_start().starts_with("runcmd:") {
            in_runcmd = true;
            result.push(line);
            continue;
        }

        if in_runcmd && !inserted {
            let trimmed = line.trim();
            let is_item = trimmed.starts_with('-')
                || trimmed.starts_with('#')
                || line.starts_with(' ')
                || line.starts_with('\t');
            if !trimmed.is_empty() && !is_item {
                // Next top-level key: the runcmd block ended here.
                result.push(section);
                inserted = true;
                in_runcmd = false;
            }
        }

        result.push(line);
    }

    if in_runcmd && !inserted {
        result.push(section);
        inserted = true;
    }

    if !inserted {
        result.push("\nruncmd:");
        result.push(section);
    }

    result.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{NetworkMode, NetworkRule, RuleType};

    fn isolated() -> NetworkConfig {
        NetworkConfig {
            mode: NetworkMode::Isolated,
            rules: vec![],
        }
    }

    #[test]
    fn token_substitution_replaces_every_occurrence() {
        let out = inject_auth_token(DEFAULT_CLOUD_INIT, "secret-token");
        assert!(!out.contains(AUTH_TOKEN_PLACEHOLDER));
        assert!(out.matches("secret-token").count() >= 2);
    }

    #[test]
    fn none_mode_leaves_template_untouched() {
        let base = "#cloud-config\npackages:\n  - git\n";
        let out = merge_network_policy(base, &NetworkConfig::none()).unwrap();
        assert_eq!(out, base);
    }

    #[test]
    fn section_lands_inside_existing_runcmd() {
        let base = "#cloud-config\nruncmd:\n  - echo first\n  - echo second\nfinal_message: done\n";
        let out = merge_network_policy(base, &isolated()).unwrap();

        let runcmd_pos = out.find("runcmd:").unwrap();
        let section_pos = out.find("Nimbus network restrictions setup").unwrap();
        let final_pos = out.find("final_message:").unwrap();
        assert!(runcmd_pos < section_pos);
        assert!(section_pos < final_pos, "section must precede the next key");

        // Existing items preserved verbatim.
        assert!(out.contains("  - echo first"));
        assert!(out.contains("  - echo second"));
    }

    #[test]
    fn runcmd_at_end_of_file_gets_section_appended() {
        let base = "#cloud-config\nruncmd:\n  - echo only\n";
        let out = merge_network_policy(base, &isolated()).unwrap();
        assert!(out.contains("Nimbus network restrictions setup"));
        assert!(out.contains("  - echo only"));
    }

    #[test]
    fn missing_runcmd_block_is_created() {
        let base = "#cloud-config\npackages:\n  - git\n";
        let out = merge_network_policy(base, &isolated()).unwrap();
        assert!(out.contains("runcmd:"));
        assert!(out.contains("/opt/nimbus/network/apply-rules.sh"));
    }

    #[test]
    fn merge_is_deterministic() {
        let base = "#cloud-config\nruncmd:\n  - echo hi\n";
        let a = merge_network_policy(base, &isolated()).unwrap();
        let b = merge_network_policy(base, &isolated()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_policy_fails_merge() {
        let bad = NetworkConfig {
            mode: NetworkMode::Allowlist,
            rules: vec![NetworkRule {
                rule_type: RuleType::Ip,
                value: "999.1.1.1".into(),
                comment: None,
            }],
        };
        assert!(merge_network_policy("#cloud-config\n", &bad).is_err());
    }

    #[test]
    fn section_installs_all_three_artifacts() {
        let out = merge_network_policy("#cloud-config\n", &isolated()).unwrap();
        assert!(out.contains("cat > /opt/nimbus/network/config.json"));
        assert!(out.contains("cat > /opt/nimbus/network/apply-rules.sh"));
        assert!(out.contains("cat > /etc/systemd/system/nimbus-network.service"));
        assert!(out.contains("systemctl enable nimbus-network.service"));
    }
}
