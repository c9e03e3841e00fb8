//! End-of-day "work off" sequence: take the VPN down if it is up, then shut
//! down WSL and force-stop heavy desktop apps. Every step is best effort.
//!
//! Only the VPN toggle is privilege gated. The cleanup acts on the user's own
//! session, so it always runs.

use crate::command::{validate_name, ActionOutcome, Actuator, CommandExecutor, CommandRequest};
use crate::script::WORK_OFF_CLEANUP;
use crate::types::WorkOffConfig;
use crate::vpn::{ToggleOutcome, VpnOrchestrator, VpnProbe};
use anyhow::Result;

/// What the sequence did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkOffReport {
    /// `None` when the VPN was already inactive
    pub vpn: Option<ToggleOutcome>,
    pub cleanup: ActionOutcome,
}

fn cleanup_script(config: &WorkOffConfig) -> Result<String> {
    for name in &config.stop_processes {
        validate_name(name, "work_off.stop_processes entry")?;
    }
    let processes = config.stop_processes.join(",");
    WORK_OFF_CLEANUP.render(&[
        ("SHUTDOWN_WSL", if config.shutdown_wsl { "1" } else { "0" }),
        ("PROCESSES", processes.as_str()),
    ])
}

/// Run the sequence
pub async fn work_off<E, P>(
    config: &WorkOffConfig,
    vpn: &VpnOrchestrator<E, P>,
    actuator: &Actuator<E>,
) -> WorkOffReport
where
    E: CommandExecutor,
    P: VpnProbe,
{
    let vpn_outcome = match vpn.is_active().await {
        Ok(true) => Some(vpn.toggle().await),
        Ok(false) => None,
        Err(e) => {
            log::warn!("Could not read VPN state, skipping VPN shutdown: {:#}", e);
            None
        }
    };

    let cleanup = match cleanup_script(config) {
        Ok(script) => {
            let output = actuator
                .executor()
                .run(CommandRequest::powershell_script(&script))
                .await;
            if output.success {
                log::info!("Work-off cleanup done");
                ActionOutcome::Applied
            } else {
                log::warn!("Work-off cleanup failed: {}", output.stderr.trim());
                ActionOutcome::Failed
            }
        }
        Err(e) => {
            log::error!("Work-off cleanup skipped: {:#}", e);
            ActionOutcome::Failed
        }
    };

    WorkOffReport {
        vpn: vpn_outcome,
        cleanup,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusBus;
    use crate::testing::{FakeExecutor, FakeVpnProbe};
    use crate::types::VpnConfig;
    use crate::vpn::VpnSettings;
    use std::sync::Arc;

    fn setup(
        processes: &[&str],
        elevated: bool,
    ) -> (
        Arc<FakeExecutor>,
        Actuator<FakeExecutor>,
        VpnOrchestrator<FakeExecutor, FakeVpnProbe>,
    ) {
        let executor = Arc::new(FakeExecutor::new());
        let actuator = Actuator::new(Arc::clone(&executor), elevated);
        let probe = Arc::new(FakeVpnProbe::new());
        probe.set_processes(processes);
        let settings = VpnSettings::from_config(&VpnConfig {
            settle_delay_ms: 0,
            ..VpnConfig::default()
        });
        let vpn = VpnOrchestrator::new(settings, actuator.clone(), probe, StatusBus::new());
        (executor, actuator, vpn)
    }

    #[test]
    fn test_cleanup_script() {
        let script = cleanup_script(&WorkOffConfig::default()).unwrap();
        assert!(script.contains("if ('1' -eq '1') { & wsl.exe --shutdown }"));
        assert!(script.contains("'LM Studio,Docker Desktop' -split ','"));

        let no_wsl = WorkOffConfig {
            shutdown_wsl: false,
            stop_processes: vec![],
        };
        assert!(cleanup_script(&no_wsl).unwrap().contains("if ('0' -eq '1')"));
    }

    #[test]
    fn test_cleanup_script_rejects_bad_process_name() {
        let config = WorkOffConfig {
            shutdown_wsl: true,
            stop_processes: vec!["x,y".to_string()],
        };
        assert!(cleanup_script(&config).is_err());
    }

    #[tokio::test]
    async fn test_work_off_stops_active_vpn_first() {
        let (executor, actuator, vpn) = setup(&["FortiClient.exe"], true);

        let report = work_off(&WorkOffConfig::default(), &vpn, &actuator).await;

        assert!(matches!(
            report.vpn,
            Some(ToggleOutcome::Toggled { started: false, .. })
        ));
        assert_eq!(report.cleanup, ActionOutcome::Applied);

        let scripts = executor.scripts();
        assert_eq!(scripts.len(), 2);
        assert!(scripts[0].contains("start= disabled"));
        assert!(scripts[1].contains("wsl.exe --shutdown"));
    }

    #[tokio::test]
    async fn test_work_off_leaves_inactive_vpn_alone() {
        let (executor, actuator, vpn) = setup(&[], true);

        let report = work_off(&WorkOffConfig::default(), &vpn, &actuator).await;

        assert_eq!(report.vpn, None);
        assert_eq!(executor.scripts().len(), 1);
    }

    #[tokio::test]
    async fn test_work_off_cleanup_runs_without_elevation() {
        let (executor, actuator, vpn) = setup(&["FortiClient.exe"], false);

        let report = work_off(&WorkOffConfig::default(), &vpn, &actuator).await;

        // The VPN shutdown is simulated, the cleanup still happens
        assert!(matches!(
            report.vpn,
            Some(ToggleOutcome::Toggled { started: false, .. })
        ));
        assert_eq!(report.cleanup, ActionOutcome::Applied);
        assert_eq!(executor.call_count(), 1);
        assert!(executor.scripts()[0].contains("wsl.exe --shutdown"));
    }

    #[tokio::test]
    async fn test_work_off_reports_failed_cleanup() {
        let executor = Arc::new(FakeExecutor::failing());
        let actuator = Actuator::new(Arc::clone(&executor), true);
        let vpn = VpnOrchestrator::new(
            VpnSettings::from_config(&VpnConfig::default()),
            actuator.clone(),
            Arc::new(FakeVpnProbe::new()),
            StatusBus::new(),
        );

        let report = work_off(&WorkOffConfig::default(), &vpn, &actuator).await;

        assert_eq!(report.vpn, None);
        assert_eq!(report.cleanup, ActionOutcome::Failed);
    }
}
