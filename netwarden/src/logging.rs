//! Logging setup and crash reports
//!
//! Everything logs through the `log` facade. `init` installs `env_logger`
//! with the configured default filter (`RUST_LOG` still wins) and optionally
//! redirects output to a file, rotating it to `.bak` once it grows past
//! [`MAX_LOG_SIZE`].

use anyhow::{Context, Result};
use std::any::Any;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Size at which the log file is rotated at startup
pub const MAX_LOG_SIZE: u64 = 2 * 1024 * 1024;

/// Install the global logger
pub fn init(level: &str, log_file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    builder.format_timestamp_millis();

    if let Some(path) = log_file {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {:?}", dir))?;
        }
        rotate_if_needed(path, MAX_LOG_SIZE)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {:?}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("Logger already initialized")?;
    Ok(())
}

fn backup_path(path: &Path) -> PathBuf {
    path.with_extension("bak")
}

/// Move `path` to its `.bak` sibling when it exceeds `max_size`
///
/// Returns whether a rotation happened.
pub fn rotate_if_needed(path: &Path, max_size: u64) -> Result<bool> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(false),
    };
    if size <= max_size {
        return Ok(false);
    }

    let backup = backup_path(path);
    if backup.exists() {
        fs::remove_file(&backup).with_context(|| format!("Failed to remove {:?}", backup))?;
    }
    fs::rename(path, &backup).with_context(|| format!("Failed to rotate {:?}", path))?;
    Ok(true)
}

/// Emit a framed crash report; never fails
pub fn log_crash(message: &str, error: &dyn fmt::Display) {
    log::error!(
        target: "crash",
        "\n================== CRASH REPORT ==================\n\
         Message: {}\n\
         Error: {}\n\
         ==================================================",
        message,
        error
    );
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
