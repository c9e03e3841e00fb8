//! VPN client process detection
//!
//! Matching is a pure function over process names so it can be tested without
//! a live process table; [`running_process_names`] is the only part that
//! touches the OS.

use sysinfo::{ProcessRefreshKind, RefreshKind, System};

/// Case-insensitive substring and prefix patterns for client processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMatcher {
    contains: Vec<String>,
    prefixes: Vec<String>,
}

impl ProcessMatcher {
    pub fn new(contains: &[String], prefixes: &[String]) -> Self {
        let normalize = |items: &[String]| {
            items
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Self {
            contains: normalize(contains),
            prefixes: normalize(prefixes),
        }
    }

    pub fn matches(&self, process_name: &str) -> bool {
        let name = process_name.to_lowercase();
        self.contains.iter().any(|p| name.contains(p.as_str()))
            || self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    /// Whether any of `names` is a client process
    pub fn any_active<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().any(|n| self.matches(n.as_ref()))
    }

    /// The same patterns as PowerShell `-Name` wildcards, comma separated
    pub fn ps_patterns(&self) -> String {
        self.contains
            .iter()
            .map(|p| format!("*{}*", p))
            .chain(self.prefixes.iter().map(|p| format!("{}*", p)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Names of every running process
///
/// Blocking; call from `spawn_blocking` on async paths.
pub fn running_process_names() -> Vec<String> {
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    system
        .processes()
        .values()
        .map(|process| process.name().to_string_lossy().into_owned())
        .collect()
}
