use std::fs;
use std::path::Path;

use lintune_core::{EngineConfig, EngineError};
use serde::Serialize;
use tracing::{info, warn};

use crate::backup::BackupVault;
use crate::fs_utils::{read_optional, remove_dir_if_exists, remove_file_if_exists, write_atomic};
use crate::host::HostServices;
use crate::templates::{scrub_nsswitch, scrub_pam_stack};
use crate::HostLayout;

/// Opt-in parts of a full uninstall that carry their own risk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UninstallOptions {
    pub remove_toolchain: bool,
    pub revert_login_manager: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub actions: Vec<String>,
    pub warnings: Vec<String>,
}

impl TeardownReport {
    fn action(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.actions.push(message);
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.warnings.push(message);
    }
}

pub(crate) struct Teardown<'a> {
    layout: &'a HostLayout,
    config: &'a EngineConfig,
    host: &'a HostServices,
}

impl<'a> Teardown<'a> {
    pub(crate) fn new(
        layout: &'a HostLayout,
        config: &'a EngineConfig,
        host: &'a HostServices,
    ) -> Self {
        Self {
            layout,
            config,
            host,
        }
    }

    /// Undoes service registration and configuration edits in reverse
    /// install order. Installed binaries and the toolchain stay.
    pub(crate) fn rollback(&self) -> Result<TeardownReport, EngineError> {
        let mut report = TeardownReport::default();
        self.stop_services(&mut report);
        self.remove_service_files(&mut report)?;
        self.restore_config(&self.layout.nsswitch_path(), ConfigKind::NameResolution, &mut report)?;
        self.restore_config(&self.layout.pam_stack_path(), ConfigKind::AuthStack, &mut report)?;
        self.remove_daemon_config(&mut report)?;
        Ok(report)
    }

    /// Everything `rollback` does, then removes artifacts, caches and the
    /// build directory, plus whatever `options` opts into.
    pub(crate) fn full_uninstall(
        &self,
        options: UninstallOptions,
    ) -> Result<TeardownReport, EngineError> {
        let mut report = self.rollback()?;

        for path in self.layout.artifact_paths() {
            if path.exists() {
                remove_file_if_exists(&path).map_err(|err| {
                    EngineError::io(format!("failed to remove {}", path.display()), err)
                })?;
                report.action(format!("removed {}", path.display()));
            }
        }
        for dir in self
            .layout
            .cache_dirs()
            .into_iter()
            .chain(std::iter::once(self.layout.build_dir()))
        {
            if dir.exists() {
                remove_dir_if_exists(&dir).map_err(|err| {
                    EngineError::io(format!("failed to remove {}", dir.display()), err)
                })?;
                report.action(format!("removed {}", dir.display()));
            }
        }

        if options.remove_toolchain {
            self.remove_toolchain(&mut report);
        }
        self.settle_login_manager(options.revert_login_manager, &mut report)?;

        let runs = self.layout.runs_dir();
        if runs.exists() {
            remove_dir_if_exists(&runs).map_err(|err| {
                EngineError::io(format!("failed to remove {}", runs.display()), err)
            })?;
            report.action("cleared run journals");
        }
        Ok(report)
    }

    fn stop_services(&self, report: &mut TeardownReport) {
        let daemon = &self.config.daemon;
        for unit in [daemon.tasks_unit.as_str(), daemon.unit.as_str()] {
            match self.host.services.stop(unit) {
                Ok(()) => report.action(format!("stopped {unit}")),
                Err(err) => report.warn(format!("could not stop {unit}: {err:#}")),
            }
        }
        let units = [daemon.unit.as_str(), daemon.tasks_unit.as_str()];
        match self.host.services.disable(&units) {
            Ok(()) => report.action(format!("disabled {}", units.join(", "))),
            Err(err) => report.warn(format!("could not disable {}: {err:#}", units.join(", "))),
        }
    }

    fn remove_service_files(&self, report: &mut TeardownReport) -> Result<(), EngineError> {
        let vault = BackupVault::new(self.layout);
        for path in self.layout.service_paths() {
            match vault.restore(&path) {
                Ok(()) => {
                    vault.discard(&path)?;
                    report.action(restored_action(&path));
                }
                Err(EngineError::NoBackupFound { .. }) if path.exists() => {
                    remove_file_if_exists(&path).map_err(|err| {
                        EngineError::io(format!("failed to remove {}", path.display()), err)
                    })?;
                    report.action(format!("removed {}", path.display()));
                }
                Err(EngineError::NoBackupFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        match self.host.services.daemon_reload() {
            Ok(()) => report.action("reloaded service manager"),
            Err(err) => report.warn(format!("could not reload service manager: {err:#}")),
        }
        Ok(())
    }

    fn restore_config(
        &self,
        path: &Path,
        kind: ConfigKind,
        report: &mut TeardownReport,
    ) -> Result<(), EngineError> {
        let vault = BackupVault::new(self.layout);
        match vault.restore(path) {
            Ok(()) => {
                vault.discard(path)?;
                report.action(restored_action(path));
            }
            Err(EngineError::NoBackupFound { .. }) => {
                let Some(content) = read_optional(path).map_err(|err| {
                    EngineError::io(format!("failed to read {}", path.display()), err)
                })?
                else {
                    return Ok(());
                };
                let scrubbed = kind.scrub(&content);
                if scrubbed.trim_end() == content.trim_end() {
                    return Ok(());
                }
                report.warn(format!(
                    "no backup for {}; removing daemon entries in place",
                    path.display()
                ));
                write_atomic(path, scrubbed.as_bytes())
                    .map_err(|err| EngineError::write_failed(path, &err))?;
                report.action(format!("scrubbed {}", path.display()));
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn remove_daemon_config(&self, report: &mut TeardownReport) -> Result<(), EngineError> {
        let vault = BackupVault::new(self.layout);
        vault.discard(&self.layout.daemon_config_path())?;
        let dir = self.layout.daemon_config_dir();
        if dir.exists() {
            remove_dir_if_exists(&dir).map_err(|err| {
                EngineError::io(format!("failed to remove {}", dir.display()), err)
            })?;
            report.action(format!("removed {}", dir.display()));
        }
        Ok(())
    }

    fn remove_toolchain(&self, report: &mut TeardownReport) {
        let installed = self
            .config
            .packages
            .dependencies
            .iter()
            .filter(|name| self.host.packages.is_installed(name).unwrap_or(false))
            .cloned()
            .collect::<Vec<_>>();
        if installed.is_empty() {
            return;
        }
        match self.host.packages.remove(&installed, &mut |line: &str| {
            info!(target: "lintune::packages", "{line}")
        }) {
            Ok(()) => report.action(format!("removed packages: {}", installed.join(" "))),
            Err(err) => report.warn(format!("could not remove packages: {err:#}")),
        }
    }

    fn settle_login_manager(
        &self,
        revert: bool,
        report: &mut TeardownReport,
    ) -> Result<(), EngineError> {
        let marker = self.layout.previous_login_manager_path();
        let previous = read_optional(&marker)
            .map_err(|err| EngineError::io(format!("failed to read {}", marker.display()), err))?
            .map(|raw| raw.trim().to_string())
            .filter(|name| !name.is_empty());

        if revert {
            match previous.as_deref() {
                None => report.warn("no previous login manager recorded; keeping current one"),
                Some(previous) => self.revert_login_manager(previous, report),
            }
        }

        if marker.exists() {
            fs::remove_file(&marker).map_err(|err| {
                EngineError::io(format!("failed to remove {}", marker.display()), err)
            })?;
        }
        Ok(())
    }

    fn revert_login_manager(&self, previous: &str, report: &mut TeardownReport) {
        let target = self.config.login_manager.target.as_str();
        if !self.host.packages.is_installed(previous).unwrap_or(false) {
            report.warn(format!(
                "previous login manager '{previous}' is no longer installed; keeping '{target}'"
            ));
            return;
        }
        if let Err(err) = self.host.services.disable(&[target]) {
            report.warn(format!("could not disable {target}: {err:#}"));
            return;
        }
        match self.host.services.enable(&[previous]) {
            Ok(()) => report.action(format!("re-enabled login manager {previous}")),
            Err(err) => {
                report.warn(format!("could not enable {previous}: {err:#}"));
                if let Err(err) = self.host.services.enable(&[target]) {
                    report.warn(format!("could not re-enable {target}: {err:#}"));
                }
            }
        }
    }
}

/// A restore either copied a backup back or removed a file the install
/// created.
fn restored_action(path: &Path) -> String {
    if path.exists() {
        format!("restored {}", path.display())
    } else {
        format!("removed {}", path.display())
    }
}

#[derive(Debug, Clone, Copy)]
enum ConfigKind {
    NameResolution,
    AuthStack,
}

impl ConfigKind {
    fn scrub(self, content: &str) -> String {
        match self {
            Self::NameResolution => scrub_nsswitch(content),
            Self::AuthStack => scrub_pam_stack(content),
        }
    }
}
