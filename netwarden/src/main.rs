// NetWarden network policy daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netwarden::{
    change_monitor::WmiChangeSource,
    command::{Actuator, SystemExecutor},
    config::load_config,
    dns_guardian::{CheckSource, DnsGuardian, GuardianSettings},
    interface::{select_primary_physical, InterfaceProbe, SystemProbe},
    logging, privilege,
    status::StatusBus,
    types::Config,
    vpn::{SystemVpnProbe, VpnOrchestrator, VpnProbe, VpnSettings},
    work::work_off,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

type Guardian = DnsGuardian<SystemExecutor, SystemProbe<SystemExecutor>, WmiChangeSource>;
type Vpn = VpnOrchestrator<SystemExecutor, SystemVpnProbe>;

#[derive(Parser)]
#[command(name = "netwarden")]
#[command(about = "DNS policy guardian and VPN client orchestrator", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "netwarden.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Run the enabled enforcers until interrupted
    Run,
    /// Run one DNS reconciliation step
    CheckDns,
    /// Start the VPN client if it is stopped, stop it if it is running
    ToggleVpn,
    /// Stop the VPN and clean up for the day
    WorkOff,
    /// Print the current network state
    Status,
}

struct Services {
    config: Config,
    actuator: Actuator<SystemExecutor>,
    probe: Arc<SystemProbe<SystemExecutor>>,
    bus: StatusBus,
    guardian: Guardian,
    vpn: Vpn,
}

impl Services {
    fn new(config: Config, elevated: bool) -> Self {
        let executor = Arc::new(SystemExecutor);
        let actuator = Actuator::new(Arc::clone(&executor), elevated);
        let probe = Arc::new(SystemProbe::new(executor));
        let bus = StatusBus::new();

        let guardian = DnsGuardian::new(
            GuardianSettings::from_config(&config),
            actuator.clone(),
            Arc::clone(&probe),
            Arc::new(WmiChangeSource),
            bus.clone(),
        );
        let vpn = VpnOrchestrator::new(
            VpnSettings::from_config(&config.vpn),
            actuator.clone(),
            Arc::new(SystemVpnProbe),
            bus.clone(),
        );

        Self {
            config,
            actuator,
            probe,
            bus,
            guardian,
            vpn,
        }
    }
}

fn main() -> Result<()> {
    // Two workers cover the loops; blocking probes go to the blocking pool
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("netwarden")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    logging::init(&config.general.log_level, config.general.log_file.as_deref())?;

    let elevated = privilege::is_elevated().await;
    if !elevated {
        log::warn!("Not running elevated: enforcement actions will be simulated");
    }

    let services = Services::new(config, elevated);

    match args.command {
        Command::Run => run_daemon(&services).await,
        Command::CheckDns => {
            let outcome = services.guardian.check_and_restore(CheckSource::Manual).await;
            println!("{:?}", outcome);
            Ok(())
        }
        Command::ToggleVpn => {
            let outcome = services.vpn.toggle().await;
            println!("{:?}", outcome);
            Ok(())
        }
        Command::WorkOff => {
            let report = work_off(&services.config.work_off, &services.vpn, &services.actuator).await;
            println!("{:?}", report);
            Ok(())
        }
        Command::Status => print_status(&services).await,
    }
}

async fn run_daemon(services: &Services) -> Result<()> {
    log::info!("Starting netwarden daemon");

    let mut status_rx = services.bus.subscribe();
    let status_logger = tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => log::info!("{}", event),
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Status logger fell behind, {} events dropped", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let general = &services.config.general;
    if general.dns_guardian_enabled {
        services.guardian.start().await;
    } else {
        log::info!("DNS guardian disabled in config");
    }
    if general.vpn_monitor_enabled {
        services.vpn.start();
    }

    log::info!("Daemon started successfully");
    wait_for_shutdown().await?;

    log::info!("Shutting down gracefully...");
    services.guardian.stop().await;
    services.vpn.stop().await;
    status_logger.abort();

    log::info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;

    tokio::select! {
        _ = sigterm.recv() => log::info!("Received SIGTERM"),
        result = signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            log::info!("Received Ctrl-C");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Received Ctrl-C");
    Ok(())
}

async fn print_status(services: &Services) -> Result<()> {
    let policy = services.guardian.policy();
    println!("Target DNS:       {}", policy.target_dns);
    println!(
        "Strict mode:      {}",
        if policy.strict_mode { "on" } else { "off" }
    );

    let interfaces = services.probe.interfaces().await?;
    let exclusions = [services.config.vpn.adapter_match.as_str()];
    match select_primary_physical(&interfaces, &exclusions) {
        Some(primary) => {
            let dns = primary
                .first_ipv4_dns()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "none".to_string());
            println!("Primary adapter:  {} ({})", primary.name, primary.description);
            println!("Active DNS:       {}", dns);
        }
        None => println!("Primary adapter:  none"),
    }

    let adapter_match = services.config.vpn.adapter_match.clone();
    let (link_up, vpn_ip) = tokio::task::spawn_blocking(move || {
        let probe = SystemVpnProbe;
        Ok::<_, anyhow::Error>((
            probe.link_up(&adapter_match)?,
            probe.adapter_ipv4(&adapter_match)?,
        ))
    })
    .await
    .context("VPN probe task failed")??;

    let active = services.vpn.is_active().await?;
    println!("VPN client:       {}", if active { "active" } else { "inactive" });
    println!("VPN link:         {}", if link_up { "up" } else { "down" });
    match vpn_ip {
        Some(ip) => println!("VPN address:      {}", ip),
        None => println!("VPN address:      none"),
    }

    Ok(())
}
