// VPN client lifecycle and monitoring

//! VPN client orchestration
//!
//! [`VpnOrchestrator`] owns two things:
//! - `toggle()`, which starts or tears down the vendor client depending on
//!   whether its processes are currently running. Only one toggle can be in
//!   flight; a second call returns [`ToggleOutcome::Busy`] immediately.
//! - a 500 ms monitor loop that tracks process activity, the vendor adapter's
//!   link, and (every tenth tick while the client runs) whether the adapter
//!   holds a routable IPv4. Transitions are published on the [`StatusBus`].
//!
//! The monitor skips its work entirely while a toggle is in flight, so it never
//! reports the half-torn-down state a lifecycle script passes through.

use crate::command::{ActionOutcome, Actuator, CommandExecutor, CommandRequest};
use crate::interface::{adapter_link_up, adapter_routable_ipv4, host_adapters};
use crate::process::{running_process_names, ProcessMatcher};
use crate::scheduler::{lock, run_periodic, shutdown_channel, spawn_supervised, ShutdownTrigger};
use crate::script;
use crate::status::{StatusBus, StatusEvent};
use crate::types::{VpnConfig, VpnRunState};
use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Monitor loop period
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Active ticks between two connectivity samples
pub const CONNECTIVITY_SAMPLE_TICKS: u32 = 10;

/// Blocking view of the host used by the orchestrator
///
/// Methods run on the blocking pool.
pub trait VpnProbe: Send + Sync + 'static {
    fn process_names(&self) -> Result<Vec<String>>;
    /// The vendor adapter, matched by name or description, is operationally up
    fn link_up(&self, adapter_match: &str) -> Result<bool>;
    /// Routable IPv4 currently held by the vendor adapter
    fn adapter_ipv4(&self, adapter_match: &str) -> Result<Option<Ipv4Addr>>;
}

/// Probe backed by the live process table and adapter table
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemVpnProbe;

impl VpnProbe for SystemVpnProbe {
    fn process_names(&self) -> Result<Vec<String>> {
        Ok(running_process_names())
    }

    fn link_up(&self, adapter_match: &str) -> Result<bool> {
        Ok(adapter_link_up(&host_adapters(), adapter_match))
    }

    fn adapter_ipv4(&self, adapter_match: &str) -> Result<Option<Ipv4Addr>> {
        Ok(adapter_routable_ipv4(&host_adapters(), adapter_match))
    }
}

/// Fixed settings of an orchestrator
#[derive(Debug, Clone)]
pub struct VpnSettings {
    pub matcher: ProcessMatcher,
    pub adapter_match: String,
    pub service_name: String,
    pub client_dir: PathBuf,
    pub client_exe: String,
    /// Wait after a lifecycle script before re-sampling
    pub settle_delay: Duration,
    /// Where the client's stdout is discarded to
    pub client_log: PathBuf,
}

impl VpnSettings {
    pub fn from_config(config: &VpnConfig) -> Self {
        Self {
            matcher: ProcessMatcher::new(&config.process_contains, &config.process_prefixes),
            adapter_match: config.adapter_match.clone(),
            service_name: config.service_name.clone(),
            client_dir: config.client_dir.clone(),
            client_exe: config.client_exe.clone(),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            client_log: std::env::temp_dir().join("netwarden-vpn-client.log"),
        }
    }

    fn startup_script(&self) -> Result<String> {
        let client_dir = self.client_dir.to_string_lossy();
        let log = self.client_log.to_string_lossy();
        let patterns = self.matcher.ps_patterns();
        script::VPN_STARTUP.render(&[
            ("SERVICE", self.service_name.as_str()),
            ("CLIENT_DIR", &*client_dir),
            ("CLIENT_EXE", self.client_exe.as_str()),
            ("LOG", &*log),
            ("PROCESS_PATTERNS", patterns.as_str()),
        ])
    }

    fn shutdown_script(&self) -> Result<String> {
        let patterns = self.matcher.ps_patterns();
        script::VPN_SHUTDOWN.render(&[
            ("SERVICE", self.service_name.as_str()),
            ("PROCESS_PATTERNS", patterns.as_str()),
        ])
    }

    fn gui_launch_script(&self) -> Result<String> {
        let client_dir = self.client_dir.to_string_lossy();
        let log = self.client_log.to_string_lossy();
        script::VPN_GUI_LAUNCH.render(&[
            ("CLIENT_DIR", &*client_dir),
            ("CLIENT_EXE", self.client_exe.as_str()),
            ("LOG", &*log),
        ])
    }
}

/// Result of [`VpnOrchestrator::toggle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// Another toggle was in flight; nothing was done
    Busy,
    Toggled {
        /// Whether the startup (rather than shutdown) script was chosen
        started: bool,
        outcome: ActionOutcome,
        /// Process activity sampled after the settle delay
        active: bool,
    },
}

struct Sample {
    process_active: bool,
    link_up: bool,
}

struct Inner<E, P> {
    settings: VpnSettings,
    actuator: Actuator<E>,
    probe: Arc<P>,
    bus: StatusBus,
    state: Mutex<VpnRunState>,
    /// Active ticks since the last connectivity sample
    ticks_since_sample: Mutex<u32>,
    toggle_gate: Semaphore,
    monitor: Mutex<Option<(ShutdownTrigger, JoinHandle<()>)>>,
}

/// VPN client lifecycle manager and link monitor
pub struct VpnOrchestrator<E, P> {
    inner: Arc<Inner<E, P>>,
}

impl<E, P> Clone for VpnOrchestrator<E, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: CommandExecutor, P: VpnProbe> VpnOrchestrator<E, P> {
    pub fn new(settings: VpnSettings, actuator: Actuator<E>, probe: Arc<P>, bus: StatusBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                actuator,
                probe,
                bus,
                state: Mutex::new(VpnRunState::default()),
                ticks_since_sample: Mutex::new(0),
                toggle_gate: Semaphore::new(1),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Snapshot of the tracked state
    pub fn state(&self) -> VpnRunState {
        lock(&self.inner.state).clone()
    }

    /// Whether a toggle is currently running
    pub fn is_toggling(&self) -> bool {
        self.inner.toggle_gate.available_permits() == 0
    }

    async fn on_probe<T, F>(&self, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&P, &str) -> Result<T> + Send + 'static,
    {
        let probe = Arc::clone(&self.inner.probe);
        let adapter_match = self.inner.settings.adapter_match.clone();
        tokio::task::spawn_blocking(move || query(&probe, &adapter_match))
            .await
            .context("VPN probe task failed")?
    }

    /// Whether any client process is running right now
    pub async fn is_active(&self) -> Result<bool> {
        let names = self.on_probe(|probe, _| probe.process_names()).await?;
        Ok(self.inner.settings.matcher.any_active(&names))
    }

    async fn sample(&self) -> Result<Sample> {
        let process_active = self.is_active().await?;
        let link_up = self
            .on_probe(|probe, adapter_match| probe.link_up(adapter_match))
            .await?;
        Ok(Sample {
            process_active,
            link_up,
        })
    }

    /// Start the client if it is not running, tear it down if it is
    pub async fn toggle(&self) -> ToggleOutcome {
        let Ok(_permit) = self.inner.toggle_gate.try_acquire() else {
            log::info!("VPN toggle already in progress, ignoring request");
            return ToggleOutcome::Busy;
        };

        let was_active = match self.is_active().await {
            Ok(active) => active,
            Err(e) => {
                log::warn!("Failed to read VPN client state: {:#}", e);
                self.state().process_active
            }
        };
        let started = !was_active;

        let (action, rendered) = if started {
            ("Start VPN client", self.inner.settings.startup_script())
        } else {
            ("Stop VPN client", self.inner.settings.shutdown_script())
        };

        let outcome = match rendered {
            Ok(body) => {
                self.inner
                    .actuator
                    .enforce(action, CommandRequest::powershell_script(&body))
                    .await
            }
            Err(e) => {
                log::error!("{}: could not build script: {:#}", action, e);
                ActionOutcome::Failed
            }
        };

        tokio::time::sleep(self.inner.settings.settle_delay).await;

        let sample = match self.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                log::warn!("Failed to re-sample VPN state after toggle: {:#}", e);
                Sample {
                    process_active: was_active,
                    link_up: self.state().link_up,
                }
            }
        };

        let mut events = vec![StatusEvent::VpnActive {
            active: sample.process_active,
        }];
        {
            let mut state = lock(&self.inner.state);
            state.process_active = sample.process_active;
            state.link_up = sample.link_up;
            if !sample.process_active && (state.connected || state.current_vpn_ip.is_some()) {
                state.connected = false;
                state.current_vpn_ip = None;
                events.push(StatusEvent::VpnConnection {
                    connected: false,
                    ip: None,
                });
            }
        }
        for event in events {
            self.inner.bus.publish(event);
        }

        log::info!(
            "{} finished ({:?}); client {}",
            action,
            outcome,
            if sample.process_active { "active" } else { "inactive" }
        );

        ToggleOutcome::Toggled {
            started,
            outcome,
            active: sample.process_active,
        }
    }

    /// One monitor step
    pub async fn tick(&self) {
        if self.is_toggling() {
            return;
        }

        let sample = match self.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                log::warn!("VPN monitor sample failed: {:#}", e);
                return;
            }
        };

        let due = {
            let mut ticks = lock(&self.inner.ticks_since_sample);
            if sample.process_active {
                *ticks += 1;
                if *ticks >= CONNECTIVITY_SAMPLE_TICKS {
                    *ticks = 0;
                    true
                } else {
                    false
                }
            } else {
                *ticks = 0;
                false
            }
        };

        let sampled_ip = if due {
            match self
                .on_probe(|probe, adapter_match| probe.adapter_ipv4(adapter_match))
                .await
            {
                Ok(ip) => Some(ip),
                Err(e) => {
                    log::warn!("VPN connectivity sample failed: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut events = Vec::new();
        let link_rose;
        {
            let mut state = lock(&self.inner.state);

            if state.process_active != sample.process_active {
                state.process_active = sample.process_active;
                events.push(StatusEvent::VpnActive {
                    active: sample.process_active,
                });
            }

            link_rose = sample.link_up && !state.link_up;
            state.link_up = sample.link_up;

            if !sample.process_active {
                if state.connected || state.current_vpn_ip.is_some() {
                    state.connected = false;
                    state.current_vpn_ip = None;
                    events.push(StatusEvent::VpnConnection {
                        connected: false,
                        ip: None,
                    });
                }
            } else if let Some(ip) = sampled_ip {
                if ip != state.current_vpn_ip {
                    state.connected = ip.is_some();
                    state.current_vpn_ip = ip;
                    events.push(StatusEvent::VpnConnection {
                        connected: ip.is_some(),
                        ip,
                    });
                }
            }
        }

        for event in events {
            self.inner.bus.publish(event);
        }

        if link_rose {
            log::info!("VPN tunnel established, bringing client to front");
            self.launch_gui();
        }
    }

    fn launch_gui(&self) {
        let body = match self.inner.settings.gui_launch_script() {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Could not build client launch script: {:#}", e);
                return;
            }
        };
        let executor = Arc::clone(self.inner.actuator.executor());
        tokio::spawn(async move {
            let output = executor.run(CommandRequest::powershell_script(&body)).await;
            if !output.success {
                log::debug!("Client launch script failed: {}", output.stderr.trim());
            }
        });
    }

    /// Start the monitor loop; no-op if it is already running
    pub fn start(&self) {
        let mut monitor = lock(&self.inner.monitor);
        if monitor.is_some() {
            return;
        }

        let (trigger, shutdown) = shutdown_channel();
        let this = self.clone();
        let handle = spawn_supervised("vpn-monitor", async move {
            run_periodic(MONITOR_INTERVAL, shutdown, move || {
                let this = this.clone();
                async move { this.tick().await }
            })
            .await;
        });
        *monitor = Some((trigger, handle));
        log::info!("VPN monitor started");
    }

    /// Stop the monitor loop and wait for it to exit
    pub async fn stop(&self) {
        let Some((trigger, handle)) = lock(&self.inner.monitor).take() else {
            return;
        };
        trigger.fire();
        if let Err(e) = handle.await {
            log::warn!("VPN monitor task did not exit cleanly: {}", e);
        }
        log::info!("VPN monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::testing::{FakeExecutor, FakeVpnProbe};
    use tokio::sync::broadcast;

    type Orchestrator = VpnOrchestrator<FakeExecutor, FakeVpnProbe>;

    const VPN_IP: Ipv4Addr = Ipv4Addr::new(10, 212, 134, 7);

    fn settings() -> VpnSettings {
        VpnSettings::from_config(&VpnConfig {
            settle_delay_ms: 0,
            ..VpnConfig::default()
        })
    }

    fn orchestrator(
        executor: &Arc<FakeExecutor>,
        probe: &Arc<FakeVpnProbe>,
        elevated: bool,
    ) -> (Orchestrator, broadcast::Receiver<StatusEvent>) {
        let bus = StatusBus::new();
        let rx = bus.subscribe();
        let orchestrator = VpnOrchestrator::new(
            settings(),
            Actuator::new(Arc::clone(executor), elevated),
            Arc::clone(probe),
            bus,
        );
        (orchestrator, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_rendered_scripts_use_settings() {
        let settings = settings();
        let startup = settings.startup_script().unwrap();
        assert!(startup.contains("$svc = 'FA_Scheduler'"));
        assert!(startup.contains("start= demand"));
        assert!(startup.contains("'*forti*,fc*' -split ','"));
        assert!(startup.contains(r"C:\Program Files\Fortinet\FortiClient"));

        let shutdown = settings.shutdown_script().unwrap();
        assert!(shutdown.contains("start= disabled"));
        assert!(shutdown.contains("taskkill"));

        assert!(settings.gui_launch_script().unwrap().contains("Test-Path $exe"));
    }

    #[tokio::test]
    async fn test_toggle_is_exclusive() {
        let executor = Arc::new(FakeExecutor::new().with_delay(Duration::from_millis(100)));
        let probe = Arc::new(FakeVpnProbe::new());
        let (vpn, _rx) = orchestrator(&executor, &probe, true);

        let (first, second) = tokio::join!(vpn.toggle(), vpn.toggle());

        let outcomes = [first, second];
        assert_eq!(
            outcomes.iter().filter(|o| **o == ToggleOutcome::Busy).count(),
            1
        );
        assert_eq!(executor.call_count(), 1);
        assert!(!vpn.is_toggling());
    }

    #[tokio::test]
    async fn test_toggle_starts_inactive_client() {
        let executor = Arc::new(FakeExecutor::new());
        let probe = Arc::new(FakeVpnProbe::new());
        let (vpn, mut rx) = orchestrator(&executor, &probe, true);

        let outcome = vpn.toggle().await;

        assert_eq!(
            outcome,
            ToggleOutcome::Toggled {
                started: true,
                outcome: ActionOutcome::Applied,
                active: false,
            }
        );
        let scripts = executor.scripts();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains("start= demand"));
        assert_eq!(drain(&mut rx), vec![StatusEvent::VpnActive { active: false }]);
    }

    #[tokio::test]
    async fn test_toggle_stops_active_client_and_clears_connection() {
        let probe = Arc::new(FakeVpnProbe::new());
        probe.set_processes(&["FortiClient.exe"]);
        probe.set_link(true, Some(VPN_IP));

        // The fake client exits once the shutdown script runs
        let client = Arc::clone(&probe);
        let executor = Arc::new(FakeExecutor::with_responder(move |req| {
            if req.decoded_script().is_some_and(|s| s.contains("start= disabled")) {
                client.set_processes(&[]);
            }
            CommandOutput::ok("")
        }));
        let (vpn, mut rx) = orchestrator(&executor, &probe, true);

        for _ in 0..CONNECTIVITY_SAMPLE_TICKS {
            vpn.tick().await;
        }
        assert!(vpn.state().connected);
        drain(&mut rx);

        let outcome = vpn.toggle().await;

        assert_eq!(
            outcome,
            ToggleOutcome::Toggled {
                started: false,
                outcome: ActionOutcome::Applied,
                active: false,
            }
        );
        assert_eq!(
            drain(&mut rx),
            vec![
                StatusEvent::VpnActive { active: false },
                StatusEvent::VpnConnection {
                    connected: false,
                    ip: None
                },
            ]
        );
        let state = vpn.state();
        assert!(!state.process_active);
        assert!(!state.connected);
        assert!(state.current_vpn_ip.is_none());
    }

    #[tokio::test]
    async fn test_toggle_simulated_without_privilege() {
        let executor = Arc::new(FakeExecutor::new());
        let probe = Arc::new(FakeVpnProbe::new());
        let (vpn, _rx) = orchestrator(&executor, &probe, false);

        let outcome = vpn.toggle().await;

        assert!(matches!(
            outcome,
            ToggleOutcome::Toggled {
                outcome: ActionOutcome::Simulated,
                ..
            }
        ));
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_connectivity_debounce_and_immediate_clear() {
        let executor = Arc::new(FakeExecutor::new());
        let probe = Arc::new(FakeVpnProbe::new());
        probe.set_processes(&["FortiTray.exe"]);
        probe.set_link(true, Some(VPN_IP));
        let (vpn, mut rx) = orchestrator(&executor, &probe, true);

        for _ in 0..CONNECTIVITY_SAMPLE_TICKS - 1 {
            vpn.tick().await;
        }
        assert!(!vpn.state().connected);
        assert_eq!(probe.ip_samples(), 0);

        vpn.tick().await;
        let state = vpn.state();
        assert!(state.connected);
        assert_eq!(state.current_vpn_ip, Some(VPN_IP));
        assert_eq!(probe.ip_samples(), 1);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                StatusEvent::VpnActive { active: true },
                StatusEvent::VpnConnection {
                    connected: true,
                    ip: Some(VPN_IP)
                },
            ]
        );

        // Process gone: cleared on the very next tick, no IP sample needed
        probe.set_processes(&[]);
        vpn.tick().await;
        let state = vpn.state();
        assert!(!state.connected);
        assert!(state.current_vpn_ip.is_none());
        assert_eq!(probe.ip_samples(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![
                StatusEvent::VpnActive { active: false },
                StatusEvent::VpnConnection {
                    connected: false,
                    ip: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_unchanged_state_is_not_republished() {
        let executor = Arc::new(FakeExecutor::new());
        let probe = Arc::new(FakeVpnProbe::new());
        probe.set_processes(&["fcappdb.exe"]);
        let (vpn, mut rx) = orchestrator(&executor, &probe, true);

        for _ in 0..3 {
            vpn.tick().await;
        }

        assert_eq!(drain(&mut rx), vec![StatusEvent::VpnActive { active: true }]);
    }

    #[tokio::test]
    async fn test_link_rise_launches_client_once() {
        let executor = Arc::new(FakeExecutor::new());
        let probe = Arc::new(FakeVpnProbe::new());
        probe.set_link(true, None);
        let (vpn, _rx) = orchestrator(&executor, &probe, true);

        vpn.tick().await;
        vpn.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let launches = executor
            .scripts()
            .iter()
            .filter(|s| s.contains("Test-Path $exe"))
            .count();
        assert_eq!(launches, 1);
        assert!(vpn.state().link_up);
    }

    #[tokio::test]
    async fn test_monitor_skips_while_toggling() {
        let executor = Arc::new(FakeExecutor::new().with_delay(Duration::from_millis(200)));
        let probe = Arc::new(FakeVpnProbe::new());
        let (vpn, _rx) = orchestrator(&executor, &probe, true);

        let toggler = vpn.clone();
        let toggle = tokio::spawn(async move { toggler.toggle().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(vpn.is_toggling());

        probe.set_processes(&["FortiClient.exe"]);
        vpn.tick().await;
        assert!(!vpn.state().process_active);

        toggle.await.unwrap();
        assert!(vpn.state().process_active);
    }

    #[tokio::test]
    async fn test_start_samples_immediately_and_stops() {
        let executor = Arc::new(FakeExecutor::new());
        let probe = Arc::new(FakeVpnProbe::new());
        probe.set_processes(&["FortiClient.exe"]);
        let (vpn, _rx) = orchestrator(&executor, &probe, true);

        vpn.start();
        vpn.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(vpn.state().process_active);

        vpn.stop().await;
        vpn.stop().await;
    }
}
