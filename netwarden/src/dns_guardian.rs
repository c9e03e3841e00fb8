// DNS policy enforcement

//! DNS guardian
//!
//! Keeps the primary physical interface pointed at the configured resolver.
//! A reconciliation step is triggered two ways: by the OS change listener
//! (after a settle delay, so the change has finished applying) and by a
//! periodic timer that also runs once at start. Both paths call
//! [`DnsGuardian::check_and_restore`], which holds a single-slot try-lock so
//! steps never interleave; a trigger that finds a step in flight is dropped.
//!
//! In strict mode the guardian also installs the firewall rule set from
//! [`crate::firewall`] on start and removes it on stop.

use crate::change_monitor::ChangeSource;
use crate::command::{validate_name, ActionOutcome, Actuator, CommandExecutor, CommandRequest};
use crate::firewall;
use crate::interface::{select_primary_physical, InterfaceProbe};
use crate::scheduler::{
    lock, run_periodic, run_triggered, shutdown_channel, spawn_supervised, ShutdownTrigger,
};
use crate::script::DOH_REGISTRATION;
use crate::status::{StatusBus, StatusEvent};
use crate::types::{Config, DnsPolicy, GuardianRunState};
use anyhow::{Context, Result};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Buffered change notifications; bursts beyond this are coalesced anyway
const CHANGE_CHANNEL_SIZE: usize = 16;

/// Fixed settings of a guardian
#[derive(Debug, Clone)]
pub struct GuardianSettings {
    pub policy: DnsPolicy,
    pub check_interval: Duration,
    /// Wait between a change notification and the check it triggers
    pub settle_delay: Duration,
    /// Extra adapter description fragments never treated as physical
    pub vendor_exclusions: Vec<String>,
}

impl GuardianSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.dns.policy(),
            check_interval: Duration::from_secs(config.dns.check_interval_secs),
            settle_delay: Duration::from_millis(config.dns.settle_delay_ms),
            vendor_exclusions: vec![config.vpn.adapter_match.clone()],
        }
    }
}

/// What triggered a reconciliation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckSource {
    Timer,
    ConfigChange,
    Manual,
}

impl fmt::Display for CheckSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckSource::Timer => "timer",
            CheckSource::ConfigChange => "config change",
            CheckSource::Manual => "manual",
        })
    }
}

/// Result of one reconciliation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Another step was in flight
    Busy,
    NoInterface,
    /// Resolver already matches; nothing was run
    Compliant,
    Restored {
        interface: String,
        previous: Option<Ipv4Addr>,
        outcome: ActionOutcome,
    },
    /// The step aborted; the next trigger retries
    Failed,
}

/// The `netsh` call that pins `interface` to `target` as its only resolver
pub fn restore_request(interface: &str, target: Ipv4Addr) -> CommandRequest {
    CommandRequest::new("netsh").args([
        "interface".to_string(),
        "ipv4".to_string(),
        "set".to_string(),
        "dnsservers".to_string(),
        interface.to_string(),
        "static".to_string(),
        target.to_string(),
        "primary".to_string(),
        "validate=no".to_string(),
    ])
}

struct Running {
    trigger: ShutdownTrigger,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner<E, P, C> {
    settings: GuardianSettings,
    actuator: Actuator<E>,
    probe: Arc<P>,
    changes: Arc<C>,
    bus: StatusBus,
    state: Mutex<GuardianRunState>,
    /// Single slot for reconciliation steps
    reconcile: tokio::sync::Mutex<()>,
    /// Serializes start/stop
    lifecycle: tokio::sync::Mutex<()>,
    running: Mutex<Option<Running>>,
}

/// Resolver policy enforcer for the primary physical interface
pub struct DnsGuardian<E, P, C> {
    inner: Arc<Inner<E, P, C>>,
}

impl<E, P, C> Clone for DnsGuardian<E, P, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E, P, C> DnsGuardian<E, P, C>
where
    E: CommandExecutor,
    P: InterfaceProbe,
    C: ChangeSource,
{
    pub fn new(
        settings: GuardianSettings,
        actuator: Actuator<E>,
        probe: Arc<P>,
        changes: Arc<C>,
        bus: StatusBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                actuator,
                probe,
                changes,
                bus,
                state: Mutex::new(GuardianRunState::default()),
                reconcile: tokio::sync::Mutex::new(()),
                lifecycle: tokio::sync::Mutex::new(()),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn policy(&self) -> &DnsPolicy {
        &self.inner.settings.policy
    }

    pub fn state(&self) -> GuardianRunState {
        lock(&self.inner.state).clone()
    }

    /// Start the listener and timer; no-op if already running
    pub async fn start(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if lock(&self.inner.state).running {
            return;
        }

        let (trigger, shutdown) = shutdown_channel();
        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_SIZE);
        let mut tasks = Vec::with_capacity(3);

        let changes = Arc::clone(&self.inner.changes);
        let listener_shutdown = shutdown.clone();
        tasks.push(spawn_supervised("dns-change-listener", async move {
            if let Err(e) = changes.watch(tx, listener_shutdown).await {
                log::warn!(
                    "Network change subscription unavailable: {:#}. Relying on periodic checks",
                    e
                );
            }
        }));

        let this = self.clone();
        let settle = self.inner.settings.settle_delay;
        let event_shutdown = shutdown.clone();
        tasks.push(spawn_supervised("dns-change-checks", async move {
            run_triggered(rx, settle, event_shutdown, move || {
                let this = this.clone();
                async move {
                    this.check_and_restore(CheckSource::ConfigChange).await;
                }
            })
            .await;
        }));

        let this = self.clone();
        let period = self.inner.settings.check_interval;
        tasks.push(spawn_supervised("dns-periodic-checks", async move {
            run_periodic(period, shutdown, move || {
                let this = this.clone();
                async move {
                    this.check_and_restore(CheckSource::Timer).await;
                }
            })
            .await;
        }));

        *lock(&self.inner.running) = Some(Running { trigger, tasks });

        let provision = {
            let mut state = lock(&self.inner.state);
            state.running = true;
            self.inner.settings.policy.strict_mode && !state.firewall_rules_applied
        };

        if provision {
            let rules = firewall::strict_mode_rules(self.inner.settings.policy.target_dns);
            firewall::apply_rules(&self.inner.actuator, &rules).await;
            // Marked even when simulated so that stop() mirrors what start() did
            lock(&self.inner.state).firewall_rules_applied = true;
        }

        log::info!(
            "DNS guardian started (target {}, strict mode {})",
            self.inner.settings.policy.target_dns,
            if self.inner.settings.policy.strict_mode { "on" } else { "off" }
        );
        self.inner.bus.publish(StatusEvent::DnsGuardian { running: true });
    }

    /// Stop every loop and remove firewall rules; no-op if not running
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let Some(running) = lock(&self.inner.running).take() else {
            return;
        };

        running.trigger.fire();
        for task in running.tasks {
            if let Err(e) = task.await {
                log::warn!("DNS guardian task did not exit cleanly: {}", e);
            }
        }

        let remove = {
            let mut state = lock(&self.inner.state);
            state.running = false;
            std::mem::take(&mut state.firewall_rules_applied)
        };

        if remove {
            let rules = firewall::strict_mode_rules(self.inner.settings.policy.target_dns);
            firewall::remove_rules(&self.inner.actuator, &rules).await;
        }

        log::info!("DNS guardian stopped");
        self.inner.bus.publish(StatusEvent::DnsGuardian { running: false });
    }

    /// Run one reconciliation step unless another is in flight
    pub async fn check_and_restore(&self, source: CheckSource) -> CheckOutcome {
        let Ok(_slot) = self.inner.reconcile.try_lock() else {
            log::debug!("DNS check ({}) skipped: another check is running", source);
            return CheckOutcome::Busy;
        };

        match self.reconcile(source).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("DNS check ({}) failed: {:#}", source, e);
                CheckOutcome::Failed
            }
        }
    }

    async fn reconcile(&self, source: CheckSource) -> Result<CheckOutcome> {
        let policy = &self.inner.settings.policy;

        let interfaces = self
            .inner
            .probe
            .interfaces()
            .await
            .context("Failed to enumerate network adapters")?;

        let exclusions: Vec<&str> = self
            .inner
            .settings
            .vendor_exclusions
            .iter()
            .map(String::as_str)
            .collect();
        let Some(primary) = select_primary_physical(&interfaces, &exclusions) else {
            log::info!("DNS check ({}): no primary physical interface", source);
            return Ok(CheckOutcome::NoInterface);
        };

        let current = primary.first_ipv4_dns();
        if current == Some(policy.target_dns) {
            log::debug!(
                "DNS check ({}): {} uses {}",
                source,
                primary.name,
                policy.target_dns
            );
            return Ok(CheckOutcome::Compliant);
        }

        match current {
            Some(found) => {
                log::warn!(
                    "DNS on {} is {}, expected {}; restoring",
                    primary.name,
                    found,
                    policy.target_dns
                );
                lock(&self.inner.state).last_anomalous_dns = Some(found);
            }
            None => log::warn!(
                "No IPv4 resolver on {}, expected {}; restoring",
                primary.name,
                policy.target_dns
            ),
        }

        validate_name(&primary.name, "Interface name")?;

        let outcome = self
            .inner
            .actuator
            .enforce(
                &format!("Restore DNS on {}", primary.name),
                restore_request(&primary.name, policy.target_dns),
            )
            .await;

        if let Some(template) = &policy.doh_template {
            let server = policy.target_dns.to_string();
            let script = DOH_REGISTRATION.render(&[
                ("SERVER", server.as_str()),
                ("TEMPLATE", template.as_str()),
                ("INTERFACE", primary.name.as_str()),
            ])?;
            self.inner
                .actuator
                .enforce(
                    &format!("Register DoH template for {}", server),
                    CommandRequest::powershell_script(&script),
                )
                .await;
        }

        Ok(CheckOutcome::Restored {
            interface: primary.name,
            previous: current,
            outcome,
        })
    }
}
