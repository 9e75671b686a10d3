//! Typed renderings of every configuration file the engine writes, plus the
//! readers the probe uses to recognise them.

use std::path::Path;

use lintune_core::EngineError;

pub const NSS_MARKER: &str = "himmelblau";
pub const PAM_MARKER: &str = "pam_himmelblau";

const NSS_PASSWD_LINE: &str = "passwd: files systemd himmelblau";
const NSS_GROUP_LINE: &str = "group: files [SUCCESS=merge] systemd himmelblau";

pub const PAM_STACK_TEMPLATE: &str = "#%PAM-1.0

auth       required                    pam_faillock.so      preauth
-auth      [success=3 default=ignore]  pam_systemd_home.so
auth       [success=2 default=ignore]  pam_himmelblau.so    ignore_unknown_user try_first_pass
auth       [success=1 default=bad]     pam_unix.so          try_first_pass nullok
auth       [default=die]               pam_faillock.so      authfail
auth       optional                    pam_permit.so
auth       required                    pam_env.so
auth       required                    pam_faillock.so      authsucc

-account   [success=2 default=ignore]  pam_systemd_home.so
account    [success=1 default=ignore]  pam_himmelblau.so    ignore_unknown_user
account    required                    pam_unix.so
account    optional                    pam_permit.so
account    required                    pam_time.so

-password  [success=2 default=ignore]  pam_systemd_home.so
password   [success=1 default=ignore]  pam_himmelblau.so    ignore_unknown_user
password   required                    pam_unix.so          try_first_pass nullok shadow
password   optional                    pam_permit.so

-session   optional                    pam_systemd_home.so
session    optional                    pam_himmelblau.so
session    required                    pam_limits.so
session    required                    pam_unix.so
session    optional                    pam_permit.so
";

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

fn nss_database(line: &str) -> Option<&str> {
    if is_comment(line) {
        return None;
    }
    let (database, _) = line.split_once(':')?;
    Some(database.trim())
}

fn has_token(line: &str, token: &str) -> bool {
    line.split_whitespace().any(|word| word == token)
}

/// True when both the `passwd` and `group` databases list the daemon's NSS
/// module.
pub fn nsswitch_has_marker(content: &str) -> bool {
    let mut passwd = false;
    let mut group = false;
    for line in content.lines() {
        match nss_database(line) {
            Some("passwd") => passwd |= has_token(line, NSS_MARKER),
            Some("group") => group |= has_token(line, NSS_MARKER),
            _ => {}
        }
    }
    passwd && group
}

/// Rewrites only the `passwd` and `group` lines, appending either one when it
/// is missing. Every other line is carried over untouched.
pub fn configure_nsswitch(content: &str) -> String {
    let mut seen_passwd = false;
    let mut seen_group = false;
    let mut lines = Vec::new();

    for line in content.lines() {
        match nss_database(line) {
            Some("passwd") => {
                seen_passwd = true;
                if has_token(line, NSS_MARKER) {
                    lines.push(line.to_string());
                } else {
                    lines.push(NSS_PASSWD_LINE.to_string());
                }
            }
            Some("group") => {
                seen_group = true;
                if has_token(line, NSS_MARKER) {
                    lines.push(line.to_string());
                } else {
                    lines.push(NSS_GROUP_LINE.to_string());
                }
            }
            _ => lines.push(line.to_string()),
        }
    }

    if !seen_passwd {
        lines.push(NSS_PASSWD_LINE.to_string());
    }
    if !seen_group {
        lines.push(NSS_GROUP_LINE.to_string());
    }
    join_lines(lines)
}

/// Drops the daemon's module from the `passwd` and `group` lines.
pub fn scrub_nsswitch(content: &str) -> String {
    let lines = content
        .lines()
        .map(|line| match nss_database(line) {
            Some("passwd" | "group") if has_token(line, NSS_MARKER) => {
                let (database, sources) = line.split_once(':').unwrap_or((line, ""));
                let kept = sources
                    .split_whitespace()
                    .filter(|word| *word != NSS_MARKER)
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("{}: {kept}", database.trim())
            }
            _ => line.to_string(),
        })
        .collect();
    join_lines(lines)
}

pub fn pam_has_marker(content: &str) -> bool {
    content
        .lines()
        .any(|line| !is_comment(line) && line.contains(PAM_MARKER))
}

/// Removes every active line that references the daemon's PAM module.
pub fn scrub_pam_stack(content: &str) -> String {
    let lines = content
        .lines()
        .filter(|line| is_comment(line) || !line.contains(PAM_MARKER))
        .map(str::to_string)
        .collect();
    join_lines(lines)
}

fn join_lines(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonConfigValues {
    pub domain: Option<String>,
    pub local_groups: Vec<String>,
}

pub fn render_daemon_config(domain: &str, local_groups: &[String]) -> String {
    format!(
        "[global]
# EntraID domain
domains = {domain}

# Local groups for EntraID users
local_groups = {}

home_attr = CN
home_alias = CN
use_etc_skel = true
enable_hello = false
debug = true
apply_policy = true
",
        local_groups.join(",")
    )
}

pub fn parse_daemon_config(content: &str) -> DaemonConfigValues {
    let mut values = DaemonConfigValues::default();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || is_comment(line) || line.starts_with('[') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "domains" => {
                values.domain = value
                    .split(',')
                    .map(str::trim)
                    .find(|domain| !domain.is_empty())
                    .map(str::to_string);
            }
            "local_groups" => {
                values.local_groups = value
                    .split(',')
                    .map(str::trim)
                    .filter(|group| !group.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => {}
        }
    }
    values
}

/// Accepts a DNS domain name such as `contoso.com`; returns it trimmed.
pub fn validate_domain(raw: &str) -> Result<String, EngineError> {
    let domain = raw.trim();
    if domain.is_empty() {
        return Err(EngineError::InvalidInput(
            "domain must not be empty".to_string(),
        ));
    }
    if domain.len() > 253 {
        return Err(EngineError::InvalidInput(format!(
            "domain '{domain}' is longer than 253 characters"
        )));
    }
    let labels = domain.split('.').collect::<Vec<_>>();
    if labels.len() < 2 {
        return Err(EngineError::InvalidInput(format!(
            "domain '{domain}' must contain at least one '.'"
        )));
    }
    for label in labels {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-');
        if !valid {
            return Err(EngineError::InvalidInput(format!(
                "domain '{domain}' has an invalid label '{label}'"
            )));
        }
    }
    Ok(domain.to_string())
}

pub fn render_daemon_unit(daemon_bin: &Path, tasks_unit: &str) -> String {
    format!(
        "[Unit]
Description=Himmelblau Authentication Daemon
After=network-online.target chronyd.service ntpd.service
Wants=network-online.target
Upholds={tasks_unit}.service

[Service]
Type=notify
ExecStart={}
Restart=on-failure
CacheDirectory=himmelblaud
StateDirectory=himmelblaud
RuntimeDirectory=himmelblaud

[Install]
WantedBy=multi-user.target
",
        daemon_bin.display()
    )
}

pub fn render_tasks_unit(tasks_bin: &Path, daemon_unit: &str) -> String {
    format!(
        "[Unit]
Description=Himmelblau Local Tasks
Requires={daemon_unit}.service
After={daemon_unit}.service

[Service]
Type=simple
ExecStart={}
Restart=on-failure

[Install]
WantedBy=multi-user.target
",
        tasks_bin.display()
    )
}

pub fn render_dbus_service(name: &str, broker_bin: &Path) -> String {
    format!(
        "[D-BUS Service]\nName={name}\nExec={}\n",
        broker_bin.display()
    )
}
