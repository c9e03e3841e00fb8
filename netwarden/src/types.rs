// Shared types for the enforcement core

//! Shared data structures
//!
//! This module defines the policy and run-state records shared between the
//! enforcers, the interface snapshot produced by the system probe, and the
//! configuration structures deserialized from the TOML file.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Resolver every physical uplink should point at
pub const DEFAULT_TARGET_DNS: Ipv4Addr = Ipv4Addr::new(192, 168, 50, 100);

/// Desired DNS posture, fixed for the lifetime of a guardian
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsPolicy {
    pub target_dns: Ipv4Addr,
    /// DNS-over-HTTPS template registered for `target_dns`, if any
    pub doh_template: Option<String>,
    /// Install firewall rules that only let DNS reach `target_dns`
    pub strict_mode: bool,
}

impl DnsPolicy {
    /// Plain policy: restore the resolver, no DoH, no firewalling
    pub fn new(target_dns: Ipv4Addr) -> Self {
        Self {
            target_dns,
            doh_template: None,
            strict_mode: false,
        }
    }
}

/// Adapter classification used by the interface selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Ethernet,
    Wireless,
    Virtual,
    Loopback,
    Other,
}

/// Point-in-time view of one network adapter
///
/// Produced fresh on every check, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSnapshot {
    pub name: String,
    pub description: String,
    pub is_up: bool,
    pub kind: AdapterKind,
    /// Link speed in bits per second
    pub link_speed: u64,
    pub has_gateway: bool,
    /// Configured resolvers, in the order the OS uses them
    pub dns_servers: Vec<IpAddr>,
}

impl InterfaceSnapshot {
    /// First configured IPv4 resolver
    pub fn first_ipv4_dns(&self) -> Option<Ipv4Addr> {
        self.dns_servers.iter().find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }
}

/// Mutable state of the DNS guardian
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardianRunState {
    pub running: bool,
    /// Last divergent resolver seen, kept for diagnostics
    pub last_anomalous_dns: Option<Ipv4Addr>,
    pub firewall_rules_applied: bool,
}

/// Mutable state of the VPN orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VpnRunState {
    pub process_active: bool,
    pub link_up: bool,
    pub connected: bool,
    pub current_vpn_ip: Option<Ipv4Addr>,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub vpn: VpnConfig,
    #[serde(default)]
    pub work_off: WorkOffConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Append logs to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub dns_guardian_enabled: bool,
    #[serde(default = "default_true")]
    pub vpn_monitor_enabled: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            dns_guardian_enabled: false,
            vpn_monitor_enabled: true,
        }
    }
}

/// DNS guardian options
#[derive(Debug, Deserialize, Clone)]
pub struct DnsConfig {
    #[serde(default = "default_target_dns")]
    pub target: Ipv4Addr,
    #[serde(default)]
    pub doh_template: Option<String>,
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_dns_settle_delay")]
    pub settle_delay_ms: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            target: default_target_dns(),
            doh_template: None,
            strict_mode: false,
            check_interval_secs: default_check_interval(),
            settle_delay_ms: default_dns_settle_delay(),
        }
    }
}

impl DnsConfig {
    /// Policy handed to the guardian at construction
    pub fn policy(&self) -> DnsPolicy {
        DnsPolicy {
            target_dns: self.target,
            doh_template: self.doh_template.clone(),
            strict_mode: self.strict_mode,
        }
    }
}

/// VPN client options
#[derive(Debug, Deserialize, Clone)]
pub struct VpnConfig {
    /// Case-insensitive substrings identifying client processes
    #[serde(default = "default_process_contains")]
    pub process_contains: Vec<String>,
    /// Case-insensitive prefixes identifying client processes
    #[serde(default = "default_process_prefixes")]
    pub process_prefixes: Vec<String>,
    /// Substring identifying the vendor's virtual adapter
    #[serde(default = "default_adapter_match")]
    pub adapter_match: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_client_dir")]
    pub client_dir: PathBuf,
    #[serde(default = "default_client_exe")]
    pub client_exe: String,
    #[serde(default = "default_vpn_settle_delay")]
    pub settle_delay_ms: u64,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            process_contains: default_process_contains(),
            process_prefixes: default_process_prefixes(),
            adapter_match: default_adapter_match(),
            service_name: default_service_name(),
            client_dir: default_client_dir(),
            client_exe: default_client_exe(),
            settle_delay_ms: default_vpn_settle_delay(),
        }
    }
}

/// Work-off cleanup options
#[derive(Debug, Deserialize, Clone)]
pub struct WorkOffConfig {
    /// Shut down the WSL2 VM as part of the sequence
    #[serde(default = "default_true")]
    pub shutdown_wsl: bool,
    /// Desktop processes force-stopped by the sequence
    #[serde(default = "default_stop_processes")]
    pub stop_processes: Vec<String>,
}

impl Default for WorkOffConfig {
    fn default() -> Self {
        Self {
            shutdown_wsl: true,
            stop_processes: default_stop_processes(),
        }
    }
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_target_dns() -> Ipv4Addr {
    DEFAULT_TARGET_DNS
}

fn default_check_interval() -> u64 {
    300 // 5 minutes
}

fn default_dns_settle_delay() -> u64 {
    2000
}

fn default_process_contains() -> Vec<String> {
    vec!["forti".to_string()]
}

fn default_process_prefixes() -> Vec<String> {
    vec!["fc".to_string()]
}

fn default_adapter_match() -> String {
    "forti".to_string()
}

fn default_service_name() -> String {
    "FA_Scheduler".to_string()
}

fn default_client_dir() -> PathBuf {
    PathBuf::from(r"C:\Program Files\Fortinet\FortiClient")
}

fn default_client_exe() -> String {
    "FortiClient.exe".to_string()
}

fn default_vpn_settle_delay() -> u64 {
    1500
}

fn default_stop_processes() -> Vec<String> {
    vec!["LM Studio".to_string(), "Docker Desktop".to_string()]
}
