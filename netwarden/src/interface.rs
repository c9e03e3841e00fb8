//! Network interface enumeration and primary-interface selection
//!
//! The DNS guardian only ever acts on one adapter: the fastest up, physical,
//! gateway-bearing one. Adapter facts (kind, link speed, gateway, resolvers)
//! come from a single PowerShell query emitted as JSON; the VPN orchestrator
//! uses the much cheaper in-process adapter table from `netdev` instead,
//! since it samples twice a second.

use crate::command::{CommandExecutor, CommandRequest, COMMAND_TIMEOUT};
use crate::types::{AdapterKind, InterfaceSnapshot};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Description fragments that mark an adapter as virtual
pub const VIRTUAL_ADAPTER_MARKERS: &[&str] =
    &["virtual", "vmware", "virtualbox", "hyper-v", "docker"];

const ADAPTER_QUERY: &str = r#"$ErrorActionPreference = 'SilentlyContinue'
Get-NetAdapter | ForEach-Object {
    $cfg = Get-NetIPConfiguration -InterfaceIndex $_.ifIndex
    $dns = Get-DnsClientServerAddress -InterfaceIndex $_.ifIndex | Sort-Object AddressFamily
    [pscustomobject]@{
        Name        = $_.Name
        Description = $_.InterfaceDescription
        Status      = [string]$_.Status
        MediaType   = [string]$_.PhysicalMediaType
        Virtual     = [bool]$_.Virtual
        LinkSpeed   = [uint64]$_.ReceiveLinkSpeed
        HasGateway  = [bool]$cfg.IPv4DefaultGateway
        Dns         = @($dns.ServerAddresses)
    }
} | ConvertTo-Json -Depth 3 -Compress"#;

/// Source of fresh interface snapshots
pub trait InterfaceProbe: Send + Sync + 'static {
    fn interfaces(&self) -> impl Future<Output = Result<Vec<InterfaceSnapshot>>> + Send;
}

/// Pick the adapter DNS policy applies to
///
/// Keeps adapters that are up, ethernet or wireless, carry a default gateway
/// and whose description matches none of the virtual markers or
/// `vendor_exclusions`; the fastest wins, ties keep enumeration order.
pub fn select_primary_physical(
    interfaces: &[InterfaceSnapshot],
    vendor_exclusions: &[&str],
) -> Option<InterfaceSnapshot> {
    let mut candidates: Vec<&InterfaceSnapshot> = interfaces
        .iter()
        .filter(|iface| iface.is_up && iface.has_gateway)
        .filter(|iface| matches!(iface.kind, AdapterKind::Ethernet | AdapterKind::Wireless))
        .filter(|iface| {
            let description = iface.description.to_lowercase();
            !VIRTUAL_ADAPTER_MARKERS
                .iter()
                .chain(vendor_exclusions.iter())
                .any(|marker| !marker.is_empty() && description.contains(&marker.to_lowercase()))
        })
        .collect();

    candidates.sort_by(|a, b| b.link_speed.cmp(&a.link_speed));
    candidates.first().map(|iface| (*iface).clone())
}

/// PowerShell emits a bare object instead of a one-element array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawAdapter {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    media_type: String,
    #[serde(default, rename = "Virtual")]
    is_virtual: bool,
    #[serde(default)]
    link_speed: u64,
    #[serde(default)]
    has_gateway: bool,
    #[serde(default)]
    dns: Option<OneOrMany<String>>,
}

fn classify(raw: &RawAdapter) -> AdapterKind {
    let description = raw.description.to_lowercase();
    if description.contains("loopback") {
        return AdapterKind::Loopback;
    }
    if raw.is_virtual {
        return AdapterKind::Virtual;
    }

    let media = raw.media_type.to_lowercase();
    if media.contains("802.11") || media.contains("wireless") {
        AdapterKind::Wireless
    } else if media.contains("802.3") {
        AdapterKind::Ethernet
    } else {
        AdapterKind::Other
    }
}

/// Parse the JSON emitted by the adapter query
#[doc(hidden)]
pub fn parse_adapter_json(json: &str) -> Result<Vec<InterfaceSnapshot>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    let raw: OneOrMany<RawAdapter> =
        serde_json::from_str(json.trim()).context("Failed to parse adapter JSON")?;

    Ok(raw
        .into_vec()
        .into_iter()
        .map(|adapter| {
            let kind = classify(&adapter);
            let dns_servers = adapter
                .dns
                .map(OneOrMany::into_vec)
                .unwrap_or_default()
                .iter()
                .filter_map(|s| s.parse::<IpAddr>().ok())
                .collect();

            InterfaceSnapshot {
                is_up: adapter.status.eq_ignore_ascii_case("up"),
                name: adapter.name,
                description: adapter.description,
                kind,
                link_speed: adapter.link_speed,
                has_gateway: adapter.has_gateway,
                dns_servers,
            }
        })
        .collect())
}

/// Interface probe backed by PowerShell's NetAdapter cmdlets
pub struct SystemProbe<E> {
    executor: Arc<E>,
}

impl<E: CommandExecutor> SystemProbe<E> {
    pub fn new(executor: Arc<E>) -> Self {
        Self { executor }
    }
}

impl<E: CommandExecutor> InterfaceProbe for SystemProbe<E> {
    async fn interfaces(&self) -> Result<Vec<InterfaceSnapshot>> {
        let request = CommandRequest::powershell_script(ADAPTER_QUERY).timeout(COMMAND_TIMEOUT);
        let output = self.executor.run(request).await;
        anyhow::ensure!(
            output.success,
            "Adapter query failed (exit={:?}): {}",
            output.exit_code,
            output.stderr.trim()
        );
        parse_adapter_json(&output.stdout)
    }
}

/// One adapter from the host's in-process adapter table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterEntry {
    /// Friendly name where the OS has one ("Ethernet 3"), else the system name
    pub name: String,
    pub description: String,
    /// Operational status is Up
    pub up: bool,
    pub loopback: bool,
    pub ipv4: Vec<Ipv4Addr>,
}

/// Current host adapter table
pub fn host_adapters() -> Vec<AdapterEntry> {
    netdev::get_interfaces()
        .into_iter()
        .map(|iface| AdapterEntry {
            up: iface.is_up(),
            loopback: iface.is_loopback(),
            ipv4: iface.ipv4.iter().map(|net| net.addr()).collect(),
            description: iface.description.unwrap_or_default(),
            name: iface.friendly_name.unwrap_or(iface.name),
        })
        .collect()
}

/// Vendor adapters are recognised by name or by driver description, since
/// the friendly name is often a generic "Ethernet N"
fn adapter_matches(entry: &AdapterEntry, adapter_match: &str) -> bool {
    if entry.loopback || adapter_match.is_empty() {
        return false;
    }
    let needle = adapter_match.to_lowercase();
    entry.name.to_lowercase().contains(&needle)
        || entry.description.to_lowercase().contains(&needle)
}

/// Whether an adapter matching `adapter_match` is operationally up
pub fn adapter_link_up(entries: &[AdapterEntry], adapter_match: &str) -> bool {
    entries
        .iter()
        .any(|e| e.up && adapter_matches(e, adapter_match))
}

/// Routable IPv4 held by an up adapter matching `adapter_match`
pub fn adapter_routable_ipv4(entries: &[AdapterEntry], adapter_match: &str) -> Option<Ipv4Addr> {
    entries
        .iter()
        .filter(|e| e.up && adapter_matches(e, adapter_match))
        .flat_map(|e| e.ipv4.iter().copied())
        .find(|ip| is_routable(*ip))
}

fn is_routable(ip: Ipv4Addr) -> bool {
    !(ip.is_unspecified() || ip.is_loopback() || ip.is_link_local() || ip.is_broadcast())
}
