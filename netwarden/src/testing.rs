// Test doubles shared by the unit tests

use crate::change_monitor::ChangeSource;
use crate::command::{CommandExecutor, CommandOutput, CommandRequest};
use crate::interface::InterfaceProbe;
use crate::scheduler::Shutdown;
use crate::types::{AdapterKind, InterfaceSnapshot};
use crate::vpn::VpnProbe;
use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

type Responder = Box<dyn Fn(&CommandRequest) -> CommandOutput + Send + Sync>;

/// Records every request and answers with a canned response
pub struct FakeExecutor {
    calls: Mutex<Vec<CommandRequest>>,
    responder: Responder,
    delay: Duration,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::with_responder(|_| CommandOutput::ok(""))
    }

    pub fn failing() -> Self {
        Self::with_responder(|_| CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: "Access is denied.".to_string(),
            exit_code: Some(1),
        })
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&CommandRequest) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            delay: Duration::ZERO,
        }
    }

    /// Make every call take this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<CommandRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Decoded bodies of every PowerShell script run so far
    pub fn scripts(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.decoded_script())
            .collect()
    }
}

impl CommandExecutor for FakeExecutor {
    async fn run(&self, request: CommandRequest) -> CommandOutput {
        let output = (self.responder)(&request);
        self.calls.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        output
    }
}

/// Serves a fixed interface list
pub struct FakeInterfaces {
    interfaces: Mutex<Vec<InterfaceSnapshot>>,
    delay: Duration,
    queries: AtomicUsize,
}

impl FakeInterfaces {
    pub fn new(interfaces: Vec<InterfaceSnapshot>) -> Self {
        Self {
            interfaces: Mutex::new(interfaces),
            delay: Duration::ZERO,
            queries: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set(&self, interfaces: Vec<InterfaceSnapshot>) {
        *self.interfaces.lock().unwrap() = interfaces;
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl InterfaceProbe for FakeInterfaces {
    async fn interfaces(&self) -> Result<Vec<InterfaceSnapshot>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.interfaces.lock().unwrap().clone())
    }
}

/// Scriptable process list and VPN adapter state
#[derive(Default)]
pub struct FakeVpnProbe {
    processes: Mutex<Vec<String>>,
    link_up: Mutex<bool>,
    ipv4: Mutex<Option<Ipv4Addr>>,
    ip_samples: AtomicUsize,
}

impl FakeVpnProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_processes(&self, names: &[&str]) {
        *self.processes.lock().unwrap() = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn set_link(&self, up: bool, ipv4: Option<Ipv4Addr>) {
        *self.link_up.lock().unwrap() = up;
        *self.ipv4.lock().unwrap() = ipv4;
    }

    pub fn ip_samples(&self) -> usize {
        self.ip_samples.load(Ordering::SeqCst)
    }
}

impl VpnProbe for FakeVpnProbe {
    fn process_names(&self) -> Result<Vec<String>> {
        Ok(self.processes.lock().unwrap().clone())
    }

    fn link_up(&self, _adapter_match: &str) -> Result<bool> {
        Ok(*self.link_up.lock().unwrap())
    }

    fn adapter_ipv4(&self, _adapter_match: &str) -> Result<Option<Ipv4Addr>> {
        self.ip_samples.fetch_add(1, Ordering::SeqCst);
        Ok(*self.ipv4.lock().unwrap())
    }
}

/// Change source driven by the test through [`FakeChanges::notify`]
#[derive(Default)]
pub struct FakeChanges {
    notify: Notify,
    fail: bool,
}

impl FakeChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose subscription can never be registered
    pub fn failing() -> Self {
        Self {
            notify: Notify::new(),
            fail: true,
        }
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }
}

impl ChangeSource for FakeChanges {
    async fn watch(&self, tx: mpsc::Sender<()>, mut shutdown: Shutdown) -> Result<()> {
        anyhow::ensure!(!self.fail, "Access denied registering for change events");
        loop {
            tokio::select! {
                _ = shutdown.fired() => return Ok(()),
                _ = self.notify.notified() => {
                    if tx.send(()).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Up, gateway-bearing physical adapter
pub fn physical(name: &str, kind: AdapterKind, speed: u64, dns: &[&str]) -> InterfaceSnapshot {
    InterfaceSnapshot {
        name: name.to_string(),
        description: format!("{} adapter", name),
        is_up: true,
        kind,
        link_speed: speed,
        has_gateway: true,
        dns_servers: dns.iter().map(|d| d.parse::<IpAddr>().unwrap()).collect(),
    }
}
