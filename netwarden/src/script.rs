//! PowerShell script templates
//!
//! Scripts are built from fixed bodies with a closed set of `{{NAME}}`
//! placeholders. Every placeholder sits inside a single-quoted PowerShell
//! literal and every value is escaped for that context, typographic quotes
//! included, so caller-supplied strings can never terminate the literal.

use anyhow::Result;

/// A script body plus the placeholders it is allowed to contain
#[derive(Debug, Clone, Copy)]
pub struct Template {
    pub name: &'static str,
    pub body: &'static str,
    pub placeholders: &'static [&'static str],
}

/// Characters the PowerShell tokenizer accepts as a single quote: the ASCII
/// apostrophe plus the typographic quotes U+2018 to U+201B
pub(crate) const SINGLE_QUOTES: [char; 5] = ['\'', '\u{2018}', '\u{2019}', '\u{201A}', '\u{201B}'];

/// Escape a value for use inside a single-quoted PowerShell string
pub fn ps_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len());
    for c in value.chars() {
        if SINGLE_QUOTES.contains(&c) {
            quoted.push(c);
        }
        quoted.push(c);
    }
    quoted
}

impl Template {
    /// Substitute every placeholder; each must be supplied exactly once and
    /// nothing outside the declared set is accepted.
    pub fn render(&self, values: &[(&str, &str)]) -> Result<String> {
        for (key, _) in values {
            anyhow::ensure!(
                self.placeholders.contains(key),
                "Template {} has no placeholder {}",
                self.name,
                key
            );
        }

        let mut rendered = self.body.to_string();
        for placeholder in self.placeholders {
            let mut matching = values.iter().filter(|(k, _)| k == placeholder);
            let value = match (matching.next(), matching.next()) {
                (Some((_, v)), None) => v,
                (None, _) => anyhow::bail!("Template {} is missing {}", self.name, placeholder),
                (Some(_), Some(_)) => {
                    anyhow::bail!("Template {} got {} twice", self.name, placeholder)
                }
            };
            anyhow::ensure!(
                !value.chars().any(|c| c.is_control()),
                "Value for {} contains control characters",
                placeholder
            );
            rendered = rendered.replace(&format!("{{{{{}}}}}", placeholder), &ps_quote(value));
        }

        Ok(rendered)
    }
}

/// Register or update the DoH mapping for the target resolver, then make the
/// resolver re-evaluate the interface
pub const DOH_REGISTRATION: Template = Template {
    name: "doh-registration",
    body: r#"$server = '{{SERVER}}'; $template = '{{TEMPLATE}}'; $alias = '{{INTERFACE}}'
if (Get-DnsClientDohServerAddress -ServerAddress $server -ErrorAction SilentlyContinue) {
    Set-DnsClientDohServerAddress -ServerAddress $server -DohTemplate $template -AllowFallbackToUdp $false -AutoUpgrade $true | Out-Null
} else {
    Add-DnsClientDohServerAddress -ServerAddress $server -DohTemplate $template -AllowFallbackToUdp $false -AutoUpgrade $true | Out-Null
}
Clear-DnsClientCache
Set-DnsClientServerAddress -InterfaceAlias $alias -ServerAddresses $server"#,
    placeholders: &["SERVER", "TEMPLATE", "INTERFACE"],
};

/// Reset the VPN client service to demand start and relaunch the client
pub const VPN_STARTUP: Template = Template {
    name: "vpn-startup",
    body: r#"$svc = '{{SERVICE}}'; $dir = '{{CLIENT_DIR}}'; $exe = Join-Path $dir '{{CLIENT_EXE}}'; $log = '{{LOG}}'
$patterns = '{{PROCESS_PATTERNS}}' -split ','
Get-Process -Name $patterns -ErrorAction SilentlyContinue | Stop-Process -Force -ErrorAction SilentlyContinue
& sc.exe config $svc start= demand > $null 2>&1
& sc.exe failure $svc reset= 0 actions= '' > $null 2>&1
Start-Service -Name $svc -ErrorAction SilentlyContinue
Start-Process -FilePath $exe -WorkingDirectory $dir -WindowStyle Normal -RedirectStandardOutput $log"#,
    placeholders: &["SERVICE", "CLIENT_DIR", "CLIENT_EXE", "LOG", "PROCESS_PATTERNS"],
};

/// Disable and force-stop the VPN client service and its processes
pub const VPN_SHUTDOWN: Template = Template {
    name: "vpn-shutdown",
    body: r#"$svc = '{{SERVICE}}'
$patterns = '{{PROCESS_PATTERNS}}' -split ','
& sc.exe config $svc start= disabled > $null 2>&1
Stop-Service -Name $svc -Force -ErrorAction SilentlyContinue
& taskkill /f /fi "SERVICES eq $svc" /t > $null 2>&1
Get-Process -Name $patterns -ErrorAction SilentlyContinue | Stop-Process -Force -ErrorAction SilentlyContinue"#,
    placeholders: &["SERVICE", "PROCESS_PATTERNS"],
};

/// Bring the VPN client window to the front
pub const VPN_GUI_LAUNCH: Template = Template {
    name: "vpn-gui-launch",
    body: r#"$dir = '{{CLIENT_DIR}}'; $exe = Join-Path $dir '{{CLIENT_EXE}}'; $log = '{{LOG}}'
if (Test-Path $exe) {
    Start-Process -FilePath $exe -WorkingDirectory $dir -WindowStyle Normal -RedirectStandardOutput $log
}"#,
    placeholders: &["CLIENT_DIR", "CLIENT_EXE", "LOG"],
};

/// End-of-day cleanup: WSL2 VM and heavy desktop processes
pub const WORK_OFF_CLEANUP: Template = Template {
    name: "work-off-cleanup",
    body: r#"if ('{{SHUTDOWN_WSL}}' -eq '1') { & wsl.exe --shutdown }
$names = '{{PROCESSES}}' -split ',' | Where-Object { $_ }
if ($names) { Get-Process -Name $names -ErrorAction SilentlyContinue | Stop-Process -Force }"#,
    placeholders: &["SHUTDOWN_WSL", "PROCESSES"],
};
