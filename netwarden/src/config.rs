// Configuration file parser

//! Configuration file loading and validation
//!
//! A missing file is not an error: every setting has a compiled-in default,
//! so the tool runs with an empty or absent `netwarden.toml`.

use crate::command::validate_name;
use crate::script::SINGLE_QUOTES;
use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Load configuration from a TOML file, or defaults if it does not exist
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        log::debug!("No config file at {:?}, using defaults", path);
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    parse_config(&contents)
}

/// Parse and validate configuration text
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

/// Free-form values (paths, URLs) are quoted when they reach a script, but
/// quote and control characters have no business in them either
fn validate_script_value(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        anyhow::bail!("{} cannot be empty", field);
    }
    if value
        .chars()
        .any(|c| c.is_control() || c == '"' || SINGLE_QUOTES.contains(&c))
    {
        anyhow::bail!("{} contains quote or control characters: {:?}", field, value);
    }
    Ok(())
}

/// Validate configuration values
pub fn validate_config(config: &Config) -> Result<()> {
    if config.dns.check_interval_secs == 0 {
        anyhow::bail!("dns.check_interval_secs must be > 0");
    }

    if let Some(template) = &config.dns.doh_template {
        if !template.starts_with("https://") {
            anyhow::bail!("dns.doh_template must be an https:// URL, got '{}'", template);
        }
        validate_script_value(template, "dns.doh_template")?;
    }

    // These end up on command lines or inside scripts
    validate_name(&config.vpn.service_name, "vpn.service_name")?;
    validate_name(&config.vpn.adapter_match, "vpn.adapter_match")?;
    validate_name(&config.vpn.client_exe, "vpn.client_exe")?;
    validate_script_value(&config.vpn.client_dir.to_string_lossy(), "vpn.client_dir")?;

    for pattern in config
        .vpn
        .process_contains
        .iter()
        .chain(&config.vpn.process_prefixes)
    {
        validate_name(pattern, "vpn process pattern")?;
    }

    for name in &config.work_off.stop_processes {
        validate_name(name, "work_off.stop_processes entry")?;
    }

    Ok(())
}
