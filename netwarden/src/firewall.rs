//! Strict-mode DNS firewall rules
//!
//! Strict mode lets plaintext DNS reach only the target resolver and closes
//! the usual escape hatches: DNS-over-TLS and DNS-over-HTTPS to the big public
//! resolvers. Windows Firewall evaluates block rules before allow rules, so
//! the "everything else" block is expressed as the address ranges on either
//! side of the target rather than `any`.
//!
//! Rules are applied and removed one `netsh` invocation at a time; a failure
//! in one rule never stops the others.

use crate::command::{ActionOutcome, Actuator, CommandExecutor, CommandRequest};
use std::fmt;
use std::net::Ipv4Addr;

/// Prefix shared by every rule this crate installs
pub const RULE_PREFIX: &str = "NetWarden";

/// Well-known public resolvers reachable over DoH on port 443
pub const PUBLIC_RESOLVERS: &[Ipv4Addr] = &[
    Ipv4Addr::new(1, 1, 1, 1),
    Ipv4Addr::new(1, 0, 0, 1),
    Ipv4Addr::new(8, 8, 8, 8),
    Ipv4Addr::new(8, 8, 4, 4),
    Ipv4Addr::new(9, 9, 9, 9),
    Ipv4Addr::new(149, 112, 112, 112),
    Ipv4Addr::new(208, 67, 222, 222),
    Ipv4Addr::new(208, 67, 220, 220),
    Ipv4Addr::new(94, 140, 14, 14),
    Ipv4Addr::new(94, 140, 15, 15),
    Ipv4Addr::new(185, 228, 168, 9),
    Ipv4Addr::new(76, 76, 2, 0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleAction::Allow => "allow",
            RuleAction::Block => "block",
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        })
    }
}

/// One outbound firewall rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: String,
    pub action: RuleAction,
    pub protocol: Protocol,
    pub port: u16,
    /// netsh `remoteip` value: `any`, an address, or a range list
    pub remote: String,
}

impl FirewallRule {
    fn new(name: String, action: RuleAction, protocol: Protocol, port: u16, remote: String) -> Self {
        Self {
            name,
            action,
            protocol,
            port,
            remote,
        }
    }

    pub fn add_request(&self) -> CommandRequest {
        CommandRequest::new("netsh").args([
            "advfirewall".to_string(),
            "firewall".to_string(),
            "add".to_string(),
            "rule".to_string(),
            format!("name={}", self.name),
            "dir=out".to_string(),
            format!("action={}", self.action),
            format!("protocol={}", self.protocol),
            format!("remoteport={}", self.port),
            format!("remoteip={}", self.remote),
        ])
    }
}

/// Request that deletes every rule called `name`
pub fn delete_request(name: &str) -> CommandRequest {
    CommandRequest::new("netsh").args([
        "advfirewall".to_string(),
        "firewall".to_string(),
        "delete".to_string(),
        "rule".to_string(),
        format!("name={}", name),
    ])
}

/// Every IPv4 address except `target`, as netsh ranges
pub fn complement_ranges(target: Ipv4Addr) -> String {
    let value = u32::from(target);
    let mut ranges = Vec::with_capacity(2);

    if value > 0 {
        ranges.push(format!("0.0.0.0-{}", Ipv4Addr::from(value - 1)));
    }
    if value < u32::MAX {
        ranges.push(format!("{}-255.255.255.255", Ipv4Addr::from(value + 1)));
    }

    ranges.join(",")
}

/// Full strict-mode rule set for `target`
pub fn strict_mode_rules(target: Ipv4Addr) -> Vec<FirewallRule> {
    let others = complement_ranges(target);
    let mut rules = Vec::new();

    for protocol in [Protocol::Udp, Protocol::Tcp] {
        rules.push(FirewallRule::new(
            format!("{}-DNS-Allow-{}", RULE_PREFIX, protocol),
            RuleAction::Allow,
            protocol,
            53,
            target.to_string(),
        ));
        rules.push(FirewallRule::new(
            format!("{}-DNS-Block-{}", RULE_PREFIX, protocol),
            RuleAction::Block,
            protocol,
            53,
            others.clone(),
        ));
    }

    rules.push(FirewallRule::new(
        format!("{}-DoT-Block", RULE_PREFIX),
        RuleAction::Block,
        Protocol::Tcp,
        853,
        "any".to_string(),
    ));

    for resolver in PUBLIC_RESOLVERS.iter().filter(|ip| **ip != target) {
        rules.push(FirewallRule::new(
            format!("{}-DoH-Block-{}", RULE_PREFIX, resolver),
            RuleAction::Block,
            Protocol::Tcp,
            443,
            resolver.to_string(),
        ));
    }

    rules
}

/// Install every rule; returns how many did not fail
pub async fn apply_rules<E: CommandExecutor>(
    actuator: &Actuator<E>,
    rules: &[FirewallRule],
) -> usize {
    let mut ok = 0;
    for rule in rules {
        let outcome = actuator
            .enforce(&format!("Add firewall rule {}", rule.name), rule.add_request())
            .await;
        if outcome != ActionOutcome::Failed {
            ok += 1;
        }
    }
    log::info!("Strict mode: {}/{} firewall rules in place", ok, rules.len());
    ok
}

/// Delete every rule by name; returns how many did not fail
pub async fn remove_rules<E: CommandExecutor>(
    actuator: &Actuator<E>,
    rules: &[FirewallRule],
) -> usize {
    let mut ok = 0;
    for rule in rules {
        let outcome = actuator
            .enforce(&format!("Remove firewall rule {}", rule.name), delete_request(&rule.name))
            .await;
        if outcome != ActionOutcome::Failed {
            ok += 1;
        }
    }
    log::info!("Strict mode: removed {}/{} firewall rules", ok, rules.len());
    ok
}
