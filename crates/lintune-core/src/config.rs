use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

/// Engine configuration. Every filesystem target is a relative entry in
/// `paths`, resolved against `root` at construction time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub require_root: bool,
    pub paths: PathTable,
    pub daemon: DaemonSettings,
    pub packages: PackageSettings,
    pub login_manager: LoginManagerSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathTable {
    pub nsswitch: PathBuf,
    pub pam_stack: PathBuf,
    pub daemon_config_dir: PathBuf,
    pub daemon_config_file: String,
    pub systemd_unit_dir: PathBuf,
    pub dbus_service_dir: PathBuf,
    pub dbus_service_file: String,
    pub cache_dirs: Vec<PathBuf>,
    pub build_dir: PathBuf,
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactRole {
    Daemon,
    Tasks,
    Cli,
    Broker,
    PamModule,
    NssModule,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonArtifact {
    /// File name under the build's `target/release` directory.
    pub name: String,
    /// Install destination relative to the root.
    pub dest: PathBuf,
    pub role: ArtifactRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonSettings {
    pub repo_url: String,
    pub unit: String,
    pub tasks_unit: String,
    pub dbus_name: String,
    pub status_command: Vec<String>,
    pub version_command: Vec<String>,
    pub cache_clear_command: Vec<String>,
    /// Recent daemon log lines scanned for enrollment results.
    pub journal_command: Vec<String>,
    pub healthy_token: String,
    pub health_attempts: u32,
    pub health_interval_ms: u64,
    pub artifacts: Vec<DaemonArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PackageSettings {
    pub dependencies: Vec<String>,
    pub install_command: Vec<String>,
    pub query_command: Vec<String>,
    pub remove_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoginManagerSettings {
    pub target: String,
    pub package: String,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub units: Vec<String>,
    pub package: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            require_root: true,
            paths: PathTable::default(),
            daemon: DaemonSettings::default(),
            packages: PackageSettings::default(),
            login_manager: LoginManagerSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl Default for PathTable {
    fn default() -> Self {
        Self {
            nsswitch: PathBuf::from("etc/nsswitch.conf"),
            pam_stack: PathBuf::from("etc/pam.d/system-auth"),
            daemon_config_dir: PathBuf::from("etc/himmelblau"),
            daemon_config_file: "himmelblau.conf".to_string(),
            systemd_unit_dir: PathBuf::from("etc/systemd/system"),
            dbus_service_dir: PathBuf::from("usr/share/dbus-1/services"),
            dbus_service_file: "com.microsoft.identity.broker1.service".to_string(),
            cache_dirs: vec![
                PathBuf::from("var/cache/nss-himmelblau"),
                PathBuf::from("var/cache/himmelblau-policies"),
                PathBuf::from("etc/krb5.conf.d"),
            ],
            build_dir: PathBuf::from("tmp/himmelblau"),
            state_dir: PathBuf::from("var/lib/lintune"),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        let artifact = |name: &str, dest: &str, role| DaemonArtifact {
            name: name.to_string(),
            dest: PathBuf::from(dest),
            role,
        };
        Self {
            repo_url: "https://github.com/himmelblau-idm/himmelblau".to_string(),
            unit: "himmelblaud".to_string(),
            tasks_unit: "himmelblaud-tasks".to_string(),
            dbus_name: "com.microsoft.identity.broker1".to_string(),
            status_command: vec!["aad-tool".to_string(), "status".to_string()],
            version_command: vec!["aad-tool".to_string(), "version".to_string()],
            cache_clear_command: vec!["aad-tool".to_string(), "cache-clear".to_string()],
            journal_command: ["journalctl", "-u", "himmelblaud", "-n", "500", "--no-pager"]
                .iter()
                .map(|word| word.to_string())
                .collect(),
            healthy_token: "working!".to_string(),
            health_attempts: 10,
            health_interval_ms: 500,
            artifacts: vec![
                artifact("himmelblaud", "usr/sbin/himmelblaud", ArtifactRole::Daemon),
                artifact(
                    "himmelblaud_tasks",
                    "usr/sbin/himmelblaud_tasks",
                    ArtifactRole::Tasks,
                ),
                artifact("aad-tool", "usr/bin/aad-tool", ArtifactRole::Cli),
                artifact("broker", "usr/sbin/broker", ArtifactRole::Broker),
                artifact("linux-entra-sso", "usr/bin/linux-entra-sso", ArtifactRole::Other),
                artifact(
                    "libpam_himmelblau.so",
                    "usr/lib/security/pam_himmelblau.so",
                    ArtifactRole::PamModule,
                ),
                artifact(
                    "libnss_himmelblau.so",
                    "usr/lib/libnss_himmelblau.so.2",
                    ArtifactRole::NssModule,
                ),
            ],
        }
    }
}

impl Default for PackageSettings {
    fn default() -> Self {
        let words = |items: &[&str]| items.iter().map(|item| item.to_string()).collect();
        Self {
            dependencies: words(&[
                "rust",
                "cargo",
                "pkg-config",
                "openssl",
                "sqlite",
                "dbus",
                "tpm2-tss",
                "git",
                "base-devel",
            ]),
            install_command: words(&["pacman", "-S", "--noconfirm", "--needed"]),
            query_command: words(&["pacman", "-Q"]),
            remove_command: words(&["pacman", "-R", "--noconfirm"]),
        }
    }
}

impl Default for LoginManagerSettings {
    fn default() -> Self {
        Self {
            target: "gdm".to_string(),
            package: "gdm".to_string(),
            candidates: ["gdm", "gdm3", "sddm", "lightdm", "lxdm", "xdm"]
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            units: vec!["cronie".to_string(), "cron".to_string()],
            package: "cronie".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse lintune config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string(self).context("failed to serialize lintune config")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let paths = &self.paths;
        let mut relative = vec![
            ("paths.nsswitch", paths.nsswitch.as_path()),
            ("paths.pam_stack", paths.pam_stack.as_path()),
            ("paths.daemon_config_dir", paths.daemon_config_dir.as_path()),
            ("paths.systemd_unit_dir", paths.systemd_unit_dir.as_path()),
            ("paths.dbus_service_dir", paths.dbus_service_dir.as_path()),
            ("paths.build_dir", paths.build_dir.as_path()),
            ("paths.state_dir", paths.state_dir.as_path()),
        ];
        for dir in &paths.cache_dirs {
            relative.push(("paths.cache_dirs", dir.as_path()));
        }
        for artifact in &self.daemon.artifacts {
            relative.push(("daemon.artifacts.dest", artifact.dest.as_path()));
        }
        for (field, path) in relative {
            validate_relative_path(path).with_context(|| format!("invalid {field}"))?;
        }
        for (field, name) in [
            ("paths.daemon_config_file", paths.daemon_config_file.as_str()),
            ("paths.dbus_service_file", paths.dbus_service_file.as_str()),
        ] {
            if name.trim().is_empty() || name.contains('/') {
                return Err(anyhow!("{field} must be a plain file name: '{name}'"));
            }
        }

        if self.daemon.artifacts.is_empty() {
            return Err(anyhow!("daemon.artifacts must not be empty"));
        }
        let mut seen_names = HashSet::new();
        for artifact in &self.daemon.artifacts {
            if artifact.name.trim().is_empty() {
                return Err(anyhow!("daemon artifact name must not be empty"));
            }
            if !seen_names.insert(artifact.name.as_str()) {
                return Err(anyhow!("duplicate daemon artifact '{}'", artifact.name));
            }
        }
        if self.daemon.health_attempts == 0 {
            return Err(anyhow!("daemon.health_attempts must be at least 1"));
        }
        if self.daemon.healthy_token.trim().is_empty() {
            return Err(anyhow!("daemon.healthy_token must not be empty"));
        }
        for (field, unit) in [
            ("daemon.unit", self.daemon.unit.as_str()),
            ("daemon.tasks_unit", self.daemon.tasks_unit.as_str()),
            ("login_manager.target", self.login_manager.target.as_str()),
        ] {
            if unit.trim().is_empty() {
                return Err(anyhow!("{field} must not be empty"));
            }
        }
        if self.scheduler.units.is_empty() {
            return Err(anyhow!("scheduler.units must not be empty"));
        }
        for (field, command) in [
            ("daemon.status_command", &self.daemon.status_command),
            ("daemon.version_command", &self.daemon.version_command),
            ("daemon.cache_clear_command", &self.daemon.cache_clear_command),
            ("daemon.journal_command", &self.daemon.journal_command),
            ("packages.install_command", &self.packages.install_command),
            ("packages.query_command", &self.packages.query_command),
            ("packages.remove_command", &self.packages.remove_command),
        ] {
            let names_program = command
                .first()
                .is_some_and(|program| !program.trim().is_empty());
            if !names_program {
                return Err(anyhow!("{field} must name a program"));
            }
        }

        Ok(())
    }
}

fn validate_relative_path(path: &Path) -> anyhow::Result<()> {
    if path.as_os_str().is_empty() {
        return Err(anyhow!("path must not be empty"));
    }
    if path.is_absolute() {
        return Err(anyhow!(
            "path must be relative to the configured root: {}",
            path.display()
        ));
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(anyhow!(
            "path must not contain '..' components: {}",
            path.display()
        ));
    }
    Ok(())
}
