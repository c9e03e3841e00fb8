//! Elevation check
//!
//! Enforcement commands only run when the process holds administrator
//! (Windows) or root (Unix) rights; everything else is simulated.

/// Whether the current process can run enforcement commands
#[cfg(windows)]
pub async fn is_elevated() -> bool {
    use crate::command::{CommandExecutor, CommandRequest, SystemExecutor};

    // `net session` only succeeds from an elevated token
    SystemExecutor
        .run(CommandRequest::new("net").arg("session"))
        .await
        .success
}

/// Whether the current process can run enforcement commands
#[cfg(unix)]
pub async fn is_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(any(windows, unix)))]
pub async fn is_elevated() -> bool {
    false
}
