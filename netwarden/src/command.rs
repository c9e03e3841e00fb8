// External command runner

//! External command execution
//!
//! Every OS-level action in the crate (netsh, PowerShell, sc.exe, wsl) goes
//! through [`CommandExecutor`]. The production [`SystemExecutor`] applies a
//! timeout, captures output, and converts every failure into an unsuccessful
//! [`CommandOutput`] instead of an error, so enforcement loops never abort on
//! a misbehaving child process.
//!
//! [`Actuator`] sits on top of the executor and decides whether an enforcing
//! action actually runs or is only logged as simulated, depending on whether
//! the process holds elevated rights.

use anyhow::Result;
use base64::Engine as _;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Default timeout for one-shot configuration commands (netsh, sc.exe)
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for generated PowerShell scripts
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(45);

#[cfg(windows)]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Validates that a name (adapter, service, process) is safe to embed in a
/// command line or script.
///
/// Windows adapter names routinely contain spaces and parentheses
/// ("Ethernet 2", "Wi-Fi (Intel)"), so those are allowed; quotes, shell
/// metacharacters and control characters are not.
pub fn validate_name(name: &str, field_name: &str) -> Result<()> {
    if name.trim().is_empty() {
        anyhow::bail!("{} cannot be empty", field_name);
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '(' | ')' | '#'))
    {
        anyhow::bail!(
            "{} contains invalid characters: '{}'. Only letters, digits, spaces and -_.()# are allowed",
            field_name,
            name
        );
    }

    Ok(())
}

/// Encode a script body for PowerShell's `-EncodedCommand` (base64 of UTF-16LE)
pub fn encode_script(script: &str) -> String {
    let utf16: Vec<u8> = script.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(utf16)
}

/// A single external command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Redirect the child's stdin from this file
    pub stdin_file: Option<PathBuf>,
    pub timeout: Duration,
    /// Visible window, inherited streams, prompts allowed
    pub interactive: bool,
}

impl CommandRequest {
    /// Non-interactive request with the default command timeout
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            stdin_file: None,
            timeout: COMMAND_TIMEOUT,
            interactive: false,
        }
    }

    /// Run a multi-line PowerShell script without ever placing the raw body on
    /// the command line
    pub fn powershell_script(script: &str) -> Self {
        Self::new("powershell.exe")
            .args([
                "-NoProfile",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-WindowStyle",
                "Hidden",
                "-EncodedCommand",
            ])
            .arg(encode_script(script))
            .timeout(SCRIPT_TIMEOUT)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Decoded body of an `-EncodedCommand` request, if this is one
    pub fn decoded_script(&self) -> Option<String> {
        let pos = self.args.iter().position(|a| a == "-EncodedCommand")?;
        let encoded = self.args.get(pos + 1)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).ok()
    }
}

impl fmt::Display for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        let mut hide_next = false;
        for arg in &self.args {
            if hide_next {
                write!(f, " <{} bytes>", arg.len())?;
                hide_next = false;
                continue;
            }
            write!(f, " {}", arg)?;
            hide_next = arg == "-EncodedCommand";
        }
        Ok(())
    }
}

/// Result of a command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process could not be spawned or timed out
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// Failed invocation that never produced an exit code
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: reason.into(),
            exit_code: None,
        }
    }
}

/// Something that can run external commands
///
/// Implementations must not return errors or panic for failing commands;
/// failure is reported through [`CommandOutput::success`].
pub trait CommandExecutor: Send + Sync + 'static {
    fn run(&self, request: CommandRequest) -> impl Future<Output = CommandOutput> + Send;
}

/// Executor backed by real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl SystemExecutor {
    fn build(request: &CommandRequest) -> std::io::Result<Command> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args);

        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        if request.interactive {
            cmd.env("GIT_TERMINAL_PROMPT", "1")
                .env("GCM_INTERACTIVE", "always")
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            #[cfg(windows)]
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        match &request.stdin_file {
            Some(path) => {
                cmd.stdin(Stdio::from(std::fs::File::open(path)?));
            }
            None if request.interactive => {
                cmd.stdin(Stdio::inherit());
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        Ok(cmd)
    }

    async fn run_captured(request: &CommandRequest, mut cmd: Command) -> CommandOutput {
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::warn!("Failed to spawn {}: {}", request.program, e);
                return CommandOutput::failed(e.to_string());
            }
        };

        // Dropping the future on timeout leaves the child running
        match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => CommandOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
            },
            Ok(Err(e)) => {
                log::warn!("Failed to collect output of {}: {}", request.program, e);
                CommandOutput::failed(e.to_string())
            }
            Err(_) => {
                log::warn!(
                    "{} did not finish within {:.0}s, leaving it running",
                    request.program,
                    request.timeout.as_secs_f32()
                );
                CommandOutput::failed("timed out")
            }
        }
    }

    async fn run_interactive(request: &CommandRequest, mut cmd: Command) -> CommandOutput {
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::warn!("Failed to spawn {}: {}", request.program, e);
                return CommandOutput::failed(e.to_string());
            }
        };

        match tokio::time::timeout(request.timeout, child.wait()).await {
            Ok(Ok(status)) => CommandOutput {
                success: status.success(),
                stdout: String::new(),
                stderr: String::new(),
                exit_code: status.code(),
            },
            Ok(Err(e)) => CommandOutput::failed(e.to_string()),
            Err(_) => {
                log::warn!("Interactive {} is still running after timeout", request.program);
                CommandOutput::failed("timed out")
            }
        }
    }
}

impl CommandExecutor for SystemExecutor {
    async fn run(&self, request: CommandRequest) -> CommandOutput {
        log::debug!("Running: {}", request);

        let cmd = match Self::build(&request) {
            Ok(cmd) => cmd,
            Err(e) => {
                log::warn!("Failed to prepare {}: {}", request.program, e);
                return CommandOutput::failed(e.to_string());
            }
        };

        let output = if request.interactive {
            Self::run_interactive(&request, cmd).await
        } else {
            Self::run_captured(&request, cmd).await
        };

        if !output.success {
            log::debug!(
                "{} failed (exit={:?}): {}",
                request.program,
                output.exit_code,
                output.stderr.trim()
            );
        }
        output
    }
}

/// What happened to an enforcing action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Applied,
    /// Not executed because the process lacks elevated rights
    Simulated,
    Failed,
}

/// Runs enforcing commands, or logs them as simulated without privilege
pub struct Actuator<E> {
    executor: Arc<E>,
    elevated: bool,
}

impl<E> Clone for Actuator<E> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            elevated: self.elevated,
        }
    }
}

impl<E: CommandExecutor> Actuator<E> {
    pub fn new(executor: Arc<E>, elevated: bool) -> Self {
        Self { executor, elevated }
    }

    /// Whether actions actually execute
    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    /// Executor for read-only queries, which run regardless of privilege
    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// Run an enforcing command
    pub async fn enforce(&self, action: &str, request: CommandRequest) -> ActionOutcome {
        if !self.elevated {
            log::info!("[SIMULATED] {} (not elevated): {}", action, request);
            return ActionOutcome::Simulated;
        }

        let output = self.executor.run(request).await;
        if output.success {
            log::info!("{}: done", action);
            ActionOutcome::Applied
        } else {
            log::warn!(
                "{}: failed (exit={:?}) {}",
                action,
                output.exit_code,
                output.stderr.trim()
            );
            ActionOutcome::Failed
        }
    }
}
