use anyhow::{Context, Result};
use lintune_core::{ArtifactRole, DaemonArtifact, EngineConfig, PathTable};
use std::fs;
use std::path::{Path, PathBuf};

/// The configured path table resolved against a filesystem root. Every path
/// the engine reads or writes comes from here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
    table: PathTable,
    artifacts: Vec<DaemonArtifact>,
    daemon_unit: String,
    tasks_unit: String,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from_config(root, &EngineConfig::default())
    }

    pub fn from_config(root: impl Into<PathBuf>, config: &EngineConfig) -> Self {
        Self {
            root: root.into(),
            table: config.paths.clone(),
            artifacts: config.daemon.artifacts.clone(),
            daemon_unit: config.daemon.unit.clone(),
            tasks_unit: config.daemon.tasks_unit.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    pub fn nsswitch_path(&self) -> PathBuf {
        self.resolve(&self.table.nsswitch)
    }

    pub fn pam_stack_path(&self) -> PathBuf {
        self.resolve(&self.table.pam_stack)
    }

    pub fn daemon_config_dir(&self) -> PathBuf {
        self.resolve(&self.table.daemon_config_dir)
    }

    pub fn daemon_config_path(&self) -> PathBuf {
        self.daemon_config_dir().join(&self.table.daemon_config_file)
    }

    pub fn systemd_unit_dir(&self) -> PathBuf {
        self.resolve(&self.table.systemd_unit_dir)
    }

    pub fn unit_path(&self, unit: &str) -> PathBuf {
        self.systemd_unit_dir().join(format!("{unit}.service"))
    }

    pub fn daemon_unit_path(&self) -> PathBuf {
        self.unit_path(&self.daemon_unit)
    }

    pub fn tasks_unit_path(&self) -> PathBuf {
        self.unit_path(&self.tasks_unit)
    }

    pub fn dbus_service_path(&self) -> PathBuf {
        self.resolve(&self.table.dbus_service_dir)
            .join(&self.table.dbus_service_file)
    }

    pub fn cache_dirs(&self) -> Vec<PathBuf> {
        self.table
            .cache_dirs
            .iter()
            .map(|dir| self.resolve(dir))
            .collect()
    }

    pub fn build_dir(&self) -> PathBuf {
        self.resolve(&self.table.build_dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.table.state_dir)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir().join("runs")
    }

    pub fn run_active_path(&self) -> PathBuf {
        self.runs_dir().join("active")
    }

    pub fn run_journal_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.journal"))
    }

    pub fn backup_index_path(&self) -> PathBuf {
        self.state_dir().join("backups")
    }

    pub fn previous_login_manager_path(&self) -> PathBuf {
        self.state_dir().join("previous-login-manager")
    }

    /// Sibling backup location for a protected file.
    pub fn backup_path_for(&self, original: &Path) -> PathBuf {
        let mut raw = original.as_os_str().to_os_string();
        raw.push(".backup");
        PathBuf::from(raw)
    }

    pub fn artifact_paths(&self) -> Vec<PathBuf> {
        self.artifacts
            .iter()
            .map(|artifact| self.resolve(&artifact.dest))
            .collect()
    }

    pub fn artifacts(&self) -> &[DaemonArtifact] {
        &self.artifacts
    }

    pub fn artifact_dest(&self, artifact: &DaemonArtifact) -> PathBuf {
        self.resolve(&artifact.dest)
    }

    /// Installed path of the first artifact with `role`, if one is configured.
    pub fn artifact_path(&self, role: ArtifactRole) -> Option<PathBuf> {
        self.artifacts
            .iter()
            .find(|artifact| artifact.role == role)
            .map(|artifact| self.resolve(&artifact.dest))
    }

    /// Configuration files whose corruption can lock users out.
    pub fn protected_config_paths(&self) -> Vec<PathBuf> {
        vec![
            self.nsswitch_path(),
            self.pam_stack_path(),
            self.daemon_config_path(),
        ]
    }

    pub fn service_paths(&self) -> Vec<PathBuf> {
        vec![
            self.daemon_unit_path(),
            self.tasks_unit_path(),
            self.dbus_service_path(),
        ]
    }

    pub fn ensure_state_dirs(&self) -> Result<()> {
        for dir in [self.state_dir(), self.runs_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
