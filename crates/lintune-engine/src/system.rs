use anyhow::{anyhow, Context, Result};
use lintune_core::{DaemonSettings, PackageSettings};
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, warn};

use crate::fs_utils::{remove_dir_if_exists, write_atomic_with_mode};
use crate::host::{DaemonBuilder, DaemonCli, PackageManager, ServiceManager};
use crate::HostLayout;

const ARTIFACT_MODE: u32 = 0o755;

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    debug!(command = ?command, "running command");
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

/// Exit status only; a command that cannot be started is an error.
fn command_succeeds(command: &mut Command, context_message: &str) -> Result<bool> {
    debug!(command = ?command, "querying command status");
    let status = command
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    Ok(status.success())
}

/// Runs `command`, forwarding each stdout/stderr line to `output` as it
/// arrives.
pub(crate) fn run_command_streaming(
    command: &mut Command,
    context_message: &str,
    output: &mut dyn FnMut(&str),
) -> Result<()> {
    debug!(command = ?command, "running streamed command");
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("{context_message}: command failed to start"))?;

    let (sender, receiver) = mpsc::channel::<String>();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_line_reader(stdout, sender.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_line_reader(stderr, sender.clone()));
    }
    drop(sender);

    let mut tail = Vec::new();
    for line in receiver {
        output(&line);
        tail.push(line);
        if tail.len() > 20 {
            tail.remove(0);
        }
    }
    for reader in readers {
        let _ = reader.join();
    }

    let status = child
        .wait()
        .with_context(|| format!("{context_message}: failed waiting for command"))?;
    if status.success() {
        return Ok(());
    }
    Err(anyhow!(
        "{context_message}: status={} output tail='{}'",
        status,
        tail.join(" | ")
    ))
}

fn spawn_line_reader<R>(reader: R, sender: mpsc::Sender<String>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            let Ok(line) = line else {
                break;
            };
            if sender.send(line).is_err() {
                break;
            }
        }
    })
}

fn command_from(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command line must not be empty"))?;
    let mut command = Command::new(program);
    command.args(args);
    Ok(command)
}

fn unit_name(unit: &str) -> String {
    if unit.contains('.') {
        unit.to_string()
    } else {
        format!("{unit}.service")
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemctlServiceManager;

impl SystemctlServiceManager {
    fn systemctl(&self, args: &[&str]) -> Command {
        let mut command = Command::new("systemctl");
        command.args(args);
        command
    }

    fn control(&self, verb: &str, units: &[&str]) -> Result<()> {
        let mut args = vec![verb.to_string()];
        args.extend(units.iter().map(|unit| unit_name(unit)));
        let mut command = Command::new("systemctl");
        command.args(&args);
        run_command(
            &mut command,
            &format!("failed to {verb} {}", units.join(", ")),
        )
    }
}

impl ServiceManager for SystemctlServiceManager {
    fn is_enabled(&self, unit: &str) -> Result<bool> {
        let unit = unit_name(unit);
        command_succeeds(
            &mut self.systemctl(&["is-enabled", "--quiet", &unit]),
            "failed to query unit enablement",
        )
    }

    fn is_active(&self, unit: &str) -> Result<bool> {
        let unit = unit_name(unit);
        command_succeeds(
            &mut self.systemctl(&["is-active", "--quiet", &unit]),
            "failed to query unit activity",
        )
    }

    fn enable(&self, units: &[&str]) -> Result<()> {
        self.control("enable", units)
    }

    fn disable(&self, units: &[&str]) -> Result<()> {
        self.control("disable", units)
    }

    fn start(&self, unit: &str) -> Result<()> {
        self.control("start", &[unit])
    }

    fn stop(&self, unit: &str) -> Result<()> {
        self.control("stop", &[unit])
    }

    fn restart(&self, unit: &str) -> Result<()> {
        self.control("restart", &[unit])
    }

    fn daemon_reload(&self) -> Result<()> {
        run_command(
            &mut self.systemctl(&["daemon-reload"]),
            "failed to reload systemd unit definitions",
        )
    }
}

/// Package manager driven by configured command lines (pacman by default).
#[derive(Debug, Clone)]
pub struct CommandPackageManager {
    settings: PackageSettings,
}

impl CommandPackageManager {
    pub fn new(settings: PackageSettings) -> Self {
        Self { settings }
    }
}

impl PackageManager for CommandPackageManager {
    fn is_installed(&self, name: &str) -> Result<bool> {
        let mut command = command_from(&self.settings.query_command)?;
        command.arg(name);
        command_succeeds(&mut command, "failed to query package state")
    }

    fn install(&self, names: &[String], output: &mut dyn FnMut(&str)) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut command = command_from(&self.settings.install_command)?;
        command.args(names);
        run_command_streaming(
            &mut command,
            &format!("failed to install packages: {}", names.join(" ")),
            output,
        )
    }

    fn remove(&self, names: &[String], output: &mut dyn FnMut(&str)) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut command = command_from(&self.settings.remove_command)?;
        command.args(names);
        run_command_streaming(
            &mut command,
            &format!("failed to remove packages: {}", names.join(" ")),
            output,
        )
    }
}

/// Clones the daemon sources, builds them with cargo and installs the
/// configured artifacts.
#[derive(Debug, Clone)]
pub struct SourceDaemonBuilder {
    repo_url: String,
}

impl SourceDaemonBuilder {
    pub fn new(settings: &DaemonSettings) -> Self {
        Self {
            repo_url: settings.repo_url.clone(),
        }
    }
}

impl DaemonBuilder for SourceDaemonBuilder {
    fn build_and_install(&self, layout: &HostLayout, output: &mut dyn FnMut(&str)) -> Result<()> {
        let build_dir = layout.build_dir();
        remove_dir_if_exists(&build_dir)
            .with_context(|| format!("failed to clean build dir: {}", build_dir.display()))?;
        if let Some(parent) = build_dir.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut clone = Command::new("git");
        clone.arg("clone").arg(&self.repo_url).arg(&build_dir);
        run_command_streaming(&mut clone, "failed to clone daemon sources", output)?;

        let mut build = Command::new("cargo");
        build
            .args(["build", "--release"])
            .current_dir(&build_dir)
            .env("HIMMELBLAU_ALLOW_MISSING_SELINUX", "1");
        run_command_streaming(&mut build, "failed to build daemon", output)?;

        let release_dir = build_dir.join("target").join("release");
        for artifact in layout.artifacts() {
            let src = release_dir.join(&artifact.name);
            if !src.exists() {
                return Err(anyhow!("build artifact not found: {}", src.display()));
            }
            let dest = layout.artifact_dest(artifact);
            let contents =
                fs::read(&src).with_context(|| format!("failed to read {}", src.display()))?;
            write_atomic_with_mode(&dest, &contents, ARTIFACT_MODE)
                .with_context(|| format!("failed to install {}", artifact.name))?;
            output(&format!("installed {}", dest.display()));
        }

        if let Err(err) = remove_dir_if_exists(&build_dir) {
            warn!(path = %build_dir.display(), error = %err, "failed to clean up build dir");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CommandDaemonCli {
    status_command: Vec<String>,
    version_command: Vec<String>,
    cache_clear_command: Vec<String>,
    journal_command: Vec<String>,
}

impl CommandDaemonCli {
    pub fn new(settings: &DaemonSettings) -> Self {
        Self {
            status_command: settings.status_command.clone(),
            version_command: settings.version_command.clone(),
            cache_clear_command: settings.cache_clear_command.clone(),
            journal_command: settings.journal_command.clone(),
        }
    }
}

impl DaemonCli for CommandDaemonCli {
    fn status(&self) -> Result<String> {
        let output = command_from(&self.status_command)?
            .output()
            .context("failed to run daemon status command")?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !stdout.is_empty() {
            return Ok(stdout);
        }
        Ok(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }

    fn version(&self) -> Result<Option<String>> {
        let output = command_from(&self.version_command)?
            .output()
            .context("failed to run daemon version command")?;
        if !output.status.success() {
            return Ok(None);
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!version.is_empty()).then_some(version))
    }

    fn clear_cache(&self) -> Result<String> {
        debug!(command = ?self.cache_clear_command, "clearing daemon cache");
        let output = command_from(&self.cache_clear_command)?
            .output()
            .context("failed to run daemon cache clear command")?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            if stderr.contains("must be run as root") {
                return Err(anyhow!("cache clear requires root privileges"));
            }
            let detail = if stderr.is_empty() { stdout } else { stderr };
            return Err(anyhow!("status={} '{}'", output.status, detail));
        }
        if stdout.is_empty() {
            return Ok("cache cleared".to_string());
        }
        Ok(stdout)
    }

    fn recent_journal(&self) -> Result<String> {
        let output = command_from(&self.journal_command)?
            .output()
            .context("failed to run daemon journal command")?;
        if !output.status.success() {
            return Err(anyhow!(
                "journal command exited with {}: '{}'",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
