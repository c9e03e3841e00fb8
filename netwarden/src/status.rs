//! Status notifications for the presentation layer
//!
//! Enforcers publish state transitions here; any number of observers can
//! subscribe. Publishing never blocks and never fails, even with no
//! subscribers or with a subscriber that stopped reading.

use std::fmt;
use std::net::Ipv4Addr;
use tokio::sync::broadcast;

/// Size of the broadcast buffer; slow observers lose the oldest events
const STATUS_CHANNEL_SIZE: usize = 64;

/// A state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// DNS guardian started or stopped
    DnsGuardian { running: bool },
    /// VPN client process appeared or disappeared
    VpnActive { active: bool },
    /// VPN adapter gained or lost a routable address
    VpnConnection {
        connected: bool,
        ip: Option<Ipv4Addr>,
    },
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::DnsGuardian { running } => {
                write!(f, "DNS guardian {}", if *running { "running" } else { "stopped" })
            }
            StatusEvent::VpnActive { active } => {
                write!(f, "VPN client {}", if *active { "active" } else { "inactive" })
            }
            StatusEvent::VpnConnection {
                connected: true,
                ip: Some(ip),
            } => write!(f, "VPN connected ({})", ip),
            StatusEvent::VpnConnection { connected, .. } => {
                write!(f, "VPN {}", if *connected { "connected" } else { "disconnected" })
            }
        }
    }
}

/// Fan-out channel for [`StatusEvent`]s
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CHANNEL_SIZE);
        Self { tx }
    }

    /// Register an observer
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StatusEvent) {
        log::debug!("Status: {}", event);
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}
