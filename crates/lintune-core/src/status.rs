use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::StepId;

/// Login manager state relative to the configured target manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "name", rename_all = "snake_case")]
pub enum DisplayManagerState {
    Enabled,
    EnabledOther(String),
    InstalledNotEnabled,
    Absent,
}

impl DisplayManagerState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl fmt::Display for DisplayManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => write!(f, "enabled"),
            Self::EnabledOther(name) => write!(f, "other manager enabled ({name})"),
            Self::InstalledNotEnabled => write!(f, "installed, not enabled"),
            Self::Absent => write!(f, "absent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPhase {
    Clean,
    PartiallyConfigured,
    Configured,
    Enrolled,
}

impl HostPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::PartiallyConfigured => "partially-configured",
            Self::Configured => "configured",
            Self::Enrolled => "enrolled",
        }
    }
}

/// A state read that failed because the engine lacked read permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeIssue {
    pub path: PathBuf,
    pub message: String,
}

/// Snapshot of the host, rebuilt from the live system on every probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    pub display_manager: DisplayManagerState,
    pub dependencies_installed: bool,
    pub daemon_installed: bool,
    pub daemon_version: Option<String>,
    pub services_registered: bool,
    pub name_resolution_configured: bool,
    pub auth_stack_configured: bool,
    pub domain: Option<String>,
    pub local_groups: Vec<String>,
    pub cron_running: bool,
    pub daemon_running: bool,
    pub daemon_tasks_running: bool,
    pub backups_present: bool,
    pub interrupted_step: Option<StepId>,
    pub probe_errors: Vec<ProbeIssue>,
}

impl SystemStatus {
    /// `PartiallyConfigured` is inferred, never stored: some but not all of
    /// the daemon binaries, service units and auth stack are in place.
    pub fn phase(&self) -> HostPhase {
        let core = [
            self.daemon_installed,
            self.services_registered,
            self.auth_stack_configured,
        ];
        let present = core.iter().filter(|flag| **flag).count();
        if present == 0 {
            return HostPhase::Clean;
        }
        if present < core.len() {
            return HostPhase::PartiallyConfigured;
        }
        if self.daemon_running && self.domain.is_some() && self.name_resolution_configured {
            HostPhase::Enrolled
        } else {
            HostPhase::Configured
        }
    }

    pub fn is_fully_configured(&self) -> bool {
        self.daemon_installed
            && self.services_registered
            && self.name_resolution_configured
            && self.auth_stack_configured
            && self.domain.is_some()
            && self.daemon_running
    }

    /// Names of the boolean configuration facts that currently read false.
    pub fn unset_fields(&self) -> Vec<&'static str> {
        let mut unset = Vec::new();
        let fields = [
            ("display_manager", self.display_manager.is_enabled()),
            ("dependencies_installed", self.dependencies_installed),
            ("daemon_installed", self.daemon_installed),
            ("services_registered", self.services_registered),
            ("name_resolution_configured", self.name_resolution_configured),
            ("auth_stack_configured", self.auth_stack_configured),
            ("domain", self.domain.is_some()),
            ("cron_running", self.cron_running),
            ("daemon_running", self.daemon_running),
        ];
        for (name, set) in fields {
            if !set {
                unset.push(name);
            }
        }
        unset
    }
}
