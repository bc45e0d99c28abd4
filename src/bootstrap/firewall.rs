//! Firewall egress rules for container registry traffic.
//!
//! Restrictive egress policies are a common cause of silent `docker pull`
//! hangs: DNS and HTTPS must be allowed out before the runtime can reach a
//! registry. Rules are probed with `iptables -C` and inserted with
//! `iptables -I` only when absent, so reruns never duplicate them.

use crate::bootstrap::{BootstrapError, HostState};
use crate::runner::{CommandRunner, HostCommand};
use tracing::{debug, info};

/// One OUTPUT-chain accept rule, expressed as iptables match arguments.
#[derive(Debug, Clone)]
pub struct EgressRule {
    /// Human label used in logs.
    pub label: &'static str,
    /// Arguments after the chain name, shared by check and insert.
    pub matches: &'static [&'static str],
}

/// Egress traffic a container runtime needs for registry pulls.
pub const EGRESS_RULES: [EgressRule; 3] = [
    EgressRule {
        label: "DNS over UDP",
        matches: &["-p", "udp", "--dport", "53", "-j", "ACCEPT"],
    },
    EgressRule {
        label: "DNS over TCP",
        matches: &["-p", "tcp", "--dport", "53", "-j", "ACCEPT"],
    },
    EgressRule {
        label: "registry HTTPS",
        matches: &["-p", "tcp", "--dport", "443", "-j", "ACCEPT"],
    },
];

/// Ensure all egress rules exist. Returns how many were inserted.
///
/// Hosts without iptables are left untouched: no firewall means nothing
/// is blocking egress.
///
/// # Errors
///
/// Returns [`BootstrapError`] when a rule insert fails.
pub async fn ensure_egress_rules(
    runner: &dyn CommandRunner,
    state: &HostState,
) -> Result<usize, BootstrapError> {
    if !state.iptables_present {
        debug!("iptables not present; skipping egress rules");
        return Ok(0);
    }

    let mut inserted = 0;
    for rule in EGRESS_RULES {
        let mut check_args = vec!["-C", "OUTPUT"];
        check_args.extend_from_slice(rule.matches);
        let check = runner.run(HostCommand::new("iptables", check_args)).await?;
        if check.success() {
            debug!("egress rule already present: {}", rule.label);
            continue;
        }

        let mut insert_args = vec!["-I", "OUTPUT"];
        insert_args.extend_from_slice(rule.matches);
        let insert = runner.run(HostCommand::new("iptables", insert_args)).await?;
        if !insert.success() {
            return Err(BootstrapError::step(
                "firewall egress",
                &format!("failed to insert rule for {}: {}", rule.label, insert.combined()),
            ));
        }
        info!("inserted egress rule: {}", rule.label);
        inserted += 1;
    }
    Ok(inserted)
}
