use std::fs;
use std::io;
use std::path::Path;

use lintune_core::{DisplayManagerState, EngineConfig, ProbeIssue, SystemStatus};
use tracing::{debug, warn};

use crate::backup::BackupVault;
use crate::fs_utils::read_optional;
use crate::host::HostServices;
use crate::journal::read_interrupted_step;
use crate::templates::{nsswitch_has_marker, pam_has_marker, parse_daemon_config};
use crate::HostLayout;

/// Read-only view of the host. Absence is a value: a missing file or an
/// unqueryable unit reads as false. Only permission failures are reported.
pub struct StateProbe<'a> {
    layout: &'a HostLayout,
    config: &'a EngineConfig,
    host: &'a HostServices,
}

impl<'a> StateProbe<'a> {
    pub fn new(layout: &'a HostLayout, config: &'a EngineConfig, host: &'a HostServices) -> Self {
        Self {
            layout,
            config,
            host,
        }
    }

    pub fn probe(&self) -> SystemStatus {
        let mut issues = Vec::new();

        let display_manager = self.display_manager();
        let dependencies_installed = self
            .config
            .packages
            .dependencies
            .iter()
            .all(|name| self.package_installed(name));

        let daemon_installed = self
            .layout
            .artifact_paths()
            .iter()
            .all(|path| path_exists(path, &mut issues));
        let daemon_version = if daemon_installed {
            self.host.daemon_cli.version().unwrap_or_else(|err| {
                debug!(error = %format!("{err:#}"), "daemon version query failed");
                None
            })
        } else {
            None
        };

        let services_registered = self
            .layout
            .service_paths()
            .iter()
            .all(|path| path_exists(path, &mut issues));

        let name_resolution_configured = read_text(&self.layout.nsswitch_path(), &mut issues)
            .is_some_and(|content| nsswitch_has_marker(&content));
        let auth_stack_configured = read_text(&self.layout.pam_stack_path(), &mut issues)
            .is_some_and(|content| pam_has_marker(&content));
        let daemon_config = read_text(&self.layout.daemon_config_path(), &mut issues)
            .map(|content| parse_daemon_config(&content))
            .unwrap_or_default();

        let cron_running = self
            .config
            .scheduler
            .units
            .iter()
            .any(|unit| self.unit_active(unit));
        let daemon_running = self.unit_active(&self.config.daemon.unit);
        let daemon_tasks_running = self.unit_active(&self.config.daemon.tasks_unit);

        let vault = BackupVault::new(self.layout);
        let backups_present = self
            .layout
            .protected_config_paths()
            .iter()
            .chain(self.layout.service_paths().iter())
            .any(|path| vault.has_backup(path));

        let interrupted_step = read_interrupted_step(self.layout).unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "ignoring unreadable run journal");
            None
        });

        SystemStatus {
            display_manager,
            dependencies_installed,
            daemon_installed,
            daemon_version,
            services_registered,
            name_resolution_configured,
            auth_stack_configured,
            domain: daemon_config.domain,
            local_groups: daemon_config.local_groups,
            cron_running,
            daemon_running,
            daemon_tasks_running,
            backups_present,
            interrupted_step,
            probe_errors: issues,
        }
    }

    fn display_manager(&self) -> DisplayManagerState {
        let settings = &self.config.login_manager;
        if self.unit_enabled(&settings.target) {
            return DisplayManagerState::Enabled;
        }
        if let Some(other) = settings
            .candidates
            .iter()
            .filter(|candidate| **candidate != settings.target)
            .find(|candidate| self.unit_enabled(candidate))
        {
            return DisplayManagerState::EnabledOther(other.clone());
        }
        if self.package_installed(&settings.package) {
            return DisplayManagerState::InstalledNotEnabled;
        }
        DisplayManagerState::Absent
    }

    fn unit_enabled(&self, unit: &str) -> bool {
        self.host.services.is_enabled(unit).unwrap_or_else(|err| {
            debug!(unit, error = %format!("{err:#}"), "unit enablement query failed");
            false
        })
    }

    fn unit_active(&self, unit: &str) -> bool {
        self.host.services.is_active(unit).unwrap_or_else(|err| {
            debug!(unit, error = %format!("{err:#}"), "unit activity query failed");
            false
        })
    }

    fn package_installed(&self, name: &str) -> bool {
        self.host.packages.is_installed(name).unwrap_or_else(|err| {
            debug!(package = name, error = %format!("{err:#}"), "package query failed");
            false
        })
    }
}

fn permission_issue(path: &Path, err: &io::Error, issues: &mut Vec<ProbeIssue>) {
    warn!(path = %path.display(), error = %err, "permission denied while probing");
    issues.push(ProbeIssue {
        path: path.to_path_buf(),
        message: err.to_string(),
    });
}

fn path_exists(path: &Path, issues: &mut Vec<ProbeIssue>) -> bool {
    match fs::symlink_metadata(path) {
        Ok(_) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            permission_issue(path, &err, issues);
            false
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "treating unreadable path as absent");
            false
        }
    }
}

fn read_text(path: &Path, issues: &mut Vec<ProbeIssue>) -> Option<String> {
    match read_optional(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            permission_issue(path, &err, issues);
            None
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "treating unreadable file as absent");
            None
        }
    }
}
