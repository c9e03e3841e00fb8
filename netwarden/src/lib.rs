// NetWarden network policy library
// Shared modules for the daemon and tests

//! NetWarden network policy core
//!
//! This library keeps a workstation's network posture in line with a fixed
//! policy: the primary physical adapter always resolves through the
//! configured DNS server, and a vendor VPN client can be started, stopped and
//! monitored on demand.
//!
//! # Main Components
//!
//! - [`command`]: External command execution and privilege-gated actions
//! - [`interface`]: Adapter enumeration and primary-interface selection
//! - [`dns_guardian`]: Resolver reconciliation and strict-mode firewalling
//! - [`change_monitor`]: OS network configuration change notifications
//! - [`scheduler`]: Periodic and event-driven loop scaffolding
//! - [`vpn`]: VPN client lifecycle and link monitoring
//! - [`status`]: Status notifications for observers
//! - [`config`]: Configuration file parsing and validation

pub mod change_monitor;
pub mod command;
pub mod config;
pub mod dns_guardian;
pub mod firewall;
pub mod interface;
pub mod logging;
pub mod privilege;
pub mod process;
pub mod scheduler;
pub mod script;
pub mod status;
pub mod types;
pub mod vpn;
pub mod work;

#[cfg(test)]
mod testing;
