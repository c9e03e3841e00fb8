// Network configuration change notifications

//! Network configuration change detection
//!
//! This module subscribes to the OS notification raised whenever a network
//! adapter's configuration is modified and forwards one `()` per change to
//! the DNS guardian. On Windows the subscription is a WMI event query held
//! open by a long-lived PowerShell child that prints a line per event.
//!
//! A failed subscription (typically missing rights for WMI events) is not
//! fatal: the guardian's periodic check keeps running without it.

use crate::command::encode_script;
use crate::scheduler::Shutdown;
use anyhow::{Context, Result};
use std::future::Future;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

const READY_MARKER: &str = "READY";
const CHANGED_MARKER: &str = "CHANGED";

const WMI_SUBSCRIPTION: &str = r#"$ErrorActionPreference = 'Stop'
$query = "SELECT * FROM __InstanceModificationEvent WITHIN 2 WHERE TargetInstance ISA 'Win32_NetworkAdapterConfiguration'"
Register-CimIndicationEvent -Query $query -SourceIdentifier 'NetWardenAdapterConfig' | Out-Null
[Console]::Out.WriteLine('READY'); [Console]::Out.Flush()
while ($true) {
    $evt = Wait-Event -SourceIdentifier 'NetWardenAdapterConfig'
    Remove-Event -EventIdentifier $evt.EventIdentifier
    [Console]::Out.WriteLine('CHANGED'); [Console]::Out.Flush()
}"#;

/// A push-style source of configuration change notifications
pub trait ChangeSource: Send + Sync + 'static {
    /// Forward one `()` per change to `tx` until `shutdown` fires.
    ///
    /// Returns an error if the subscription cannot be established or dies.
    fn watch(
        &self,
        tx: mpsc::Sender<()>,
        shutdown: Shutdown,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// What one line of listener output means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerLine {
    Ready,
    Changed,
    Other,
}

/// Classify a line printed by the subscription script
pub fn classify_line(line: &str) -> ListenerLine {
    match line.trim() {
        READY_MARKER => ListenerLine::Ready,
        CHANGED_MARKER => ListenerLine::Changed,
        _ => ListenerLine::Other,
    }
}

/// WMI-backed change source
#[derive(Debug, Clone, Copy, Default)]
pub struct WmiChangeSource;

impl ChangeSource for WmiChangeSource {
    async fn watch(&self, tx: mpsc::Sender<()>, mut shutdown: Shutdown) -> Result<()> {
        let mut cmd = Command::new("powershell.exe");
        cmd.args([
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-EncodedCommand",
        ])
        .arg(encode_script(WMI_SUBSCRIPTION))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(crate::command::CREATE_NO_WINDOW);

        let mut child = cmd
            .spawn()
            .context("Failed to start configuration change listener")?;
        let stdout = child
            .stdout
            .take()
            .context("Change listener has no stdout")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut registered = false;

        loop {
            tokio::select! {
                _ = shutdown.fired() => {
                    log::debug!("Stopping configuration change listener");
                    let _ = child.kill().await;
                    return Ok(());
                }
                line = lines.next_line() => {
                    let line = line.context("Failed to read change listener output")?;
                    let Some(line) = line else { break };

                    match classify_line(&line) {
                        ListenerLine::Ready => {
                            registered = true;
                            log::info!("Subscribed to network configuration changes");
                        }
                        ListenerLine::Changed => {
                            log::debug!("Network configuration change notified");
                            if tx.send(()).await.is_err() {
                                let _ = child.kill().await;
                                return Ok(());
                            }
                        }
                        ListenerLine::Other => log::trace!("Change listener: {}", line),
                    }
                }
            }
        }

        // stdout closed: the child exited or is about to
        let mut stderr = String::new();
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr).await;
        }
        let status = child.wait().await.ok();

        if registered {
            anyhow::bail!("Change listener exited unexpectedly ({:?})", status);
        }
        anyhow::bail!(
            "Change subscription could not be registered ({:?}): {}",
            status,
            stderr.trim()
        )
    }
}
