use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use lintune_core::{
    ArtifactRole, DisplayManagerState, EngineConfig, EngineError, OperatorInput, StepEvent,
    StepEventKind, StepId, SystemStatus,
};
use tracing::{debug, info, warn};

use crate::executor::ProgressSink;
use crate::fs_utils::{read_optional, remove_dir_if_exists, write_atomic};
use crate::host::HostServices;
use crate::templates::{
    configure_nsswitch, render_daemon_config, render_daemon_unit, render_dbus_service,
    render_tasks_unit, validate_domain, PAM_STACK_TEMPLATE,
};
use crate::HostLayout;

/// Everything a step may look at or drive while deciding and applying.
pub struct StepContext<'a> {
    pub layout: &'a HostLayout,
    pub config: &'a EngineConfig,
    pub host: &'a HostServices,
    pub input: &'a OperatorInput,
    pub status: &'a SystemStatus,
    step: StepId,
    sink: &'a mut dyn ProgressSink,
    warnings: Vec<String>,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        step: StepId,
        layout: &'a HostLayout,
        config: &'a EngineConfig,
        host: &'a HostServices,
        input: &'a OperatorInput,
        status: &'a SystemStatus,
        sink: &'a mut dyn ProgressSink,
    ) -> Self {
        Self {
            layout,
            config,
            host,
            input,
            status,
            step,
            sink,
            warnings: Vec::new(),
        }
    }

    /// Streams one line of collaborator output.
    pub fn emit(&mut self, line: &str) {
        debug!(step = %self.step, "{line}");
        self.sink
            .event(&StepEvent::new(self.step, StepEventKind::Output, line));
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(step = %self.step, "{message}");
        self.sink
            .event(&StepEvent::new(self.step, StepEventKind::Warning, &message));
        self.warnings.push(message);
    }

    pub(crate) fn into_warnings(self) -> Vec<String> {
        self.warnings
    }
}

/// One idempotent host mutation. When `precondition` holds, `apply` is never
/// called.
pub struct MutationStep {
    pub id: StepId,
    pub description: &'static str,
    pub required: bool,
    pub destructive: bool,
    /// Steps whose state must already hold before this one may apply.
    pub requires: &'static [StepId],
    pub protected_paths: fn(&HostLayout) -> Vec<PathBuf>,
    pub precondition: fn(&StepContext<'_>) -> bool,
    pub apply: fn(&mut StepContext<'_>) -> Result<(), EngineError>,
}

impl MutationStep {
    /// The first listed prerequisite whose state does not hold yet.
    pub fn missing_dependency(&self, ctx: &StepContext<'_>) -> Option<StepId> {
        self.requires
            .iter()
            .copied()
            .find(|requires| !(step(*requires).precondition)(ctx))
    }
}

impl std::fmt::Debug for MutationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationStep")
            .field("id", &self.id)
            .field("required", &self.required)
            .field("destructive", &self.destructive)
            .finish_non_exhaustive()
    }
}

static STANDARD_STEPS: [MutationStep; 10] = [
    MutationStep {
        id: StepId::LoginManager,
        description: "Ensure the graphical login manager is enabled",
        required: true,
        destructive: false,
        requires: &[],
        protected_paths: no_paths,
        precondition: login_manager_ready,
        apply: apply_login_manager,
    },
    MutationStep {
        id: StepId::Dependencies,
        description: "Install build and runtime dependencies",
        required: true,
        destructive: false,
        requires: &[],
        protected_paths: no_paths,
        precondition: dependencies_ready,
        apply: apply_dependencies,
    },
    MutationStep {
        id: StepId::DaemonBuild,
        description: "Build and install the identity daemon",
        required: true,
        destructive: false,
        requires: &[StepId::Dependencies],
        protected_paths: no_paths,
        precondition: daemon_installed,
        apply: apply_daemon_build,
    },
    MutationStep {
        id: StepId::CacheDirectories,
        description: "Create daemon cache and policy directories",
        required: true,
        destructive: false,
        requires: &[StepId::DaemonBuild],
        protected_paths: no_paths,
        precondition: cache_dirs_ready,
        apply: apply_cache_dirs,
    },
    MutationStep {
        id: StepId::Services,
        description: "Register daemon units and the broker D-Bus service",
        required: true,
        destructive: true,
        requires: &[StepId::DaemonBuild],
        protected_paths: service_paths,
        precondition: services_registered,
        apply: apply_services,
    },
    MutationStep {
        id: StepId::NameResolution,
        description: "Add the daemon to passwd and group name resolution",
        required: true,
        destructive: true,
        requires: &[StepId::DaemonBuild],
        protected_paths: nsswitch_path,
        precondition: name_resolution_configured,
        apply: apply_name_resolution,
    },
    MutationStep {
        id: StepId::AuthStack,
        description: "Install the PAM authentication stack",
        required: true,
        destructive: true,
        requires: &[StepId::DaemonBuild],
        protected_paths: pam_stack_path,
        precondition: auth_stack_configured,
        apply: apply_auth_stack,
    },
    MutationStep {
        id: StepId::DomainConfig,
        description: "Write the daemon domain configuration",
        required: true,
        destructive: true,
        requires: &[StepId::DaemonBuild],
        protected_paths: daemon_config_path,
        precondition: domain_configured,
        apply: apply_domain_config,
    },
    MutationStep {
        id: StepId::Scheduler,
        description: "Enable the cron scheduler",
        required: true,
        destructive: false,
        requires: &[],
        protected_paths: no_paths,
        precondition: scheduler_running,
        apply: apply_scheduler,
    },
    MutationStep {
        id: StepId::DaemonStart,
        description: "Start the daemon and wait until it reports healthy",
        required: true,
        destructive: false,
        requires: &[StepId::Services, StepId::DomainConfig],
        protected_paths: no_paths,
        precondition: daemon_healthy,
        apply: apply_daemon_start,
    },
];

/// Every step in dependency order.
pub fn standard_steps() -> &'static [MutationStep] {
    &STANDARD_STEPS
}

pub fn step(id: StepId) -> &'static MutationStep {
    let index = StepId::ALL
        .iter()
        .position(|candidate| *candidate == id)
        .unwrap_or_default();
    &STANDARD_STEPS[index]
}

fn no_paths(_: &HostLayout) -> Vec<PathBuf> {
    Vec::new()
}

fn service_paths(layout: &HostLayout) -> Vec<PathBuf> {
    layout.service_paths()
}

fn nsswitch_path(layout: &HostLayout) -> Vec<PathBuf> {
    vec![layout.nsswitch_path()]
}

fn pam_stack_path(layout: &HostLayout) -> Vec<PathBuf> {
    vec![layout.pam_stack_path()]
}

fn daemon_config_path(layout: &HostLayout) -> Vec<PathBuf> {
    vec![layout.daemon_config_path()]
}

fn command_failed(context: impl Into<String>) -> impl FnOnce(anyhow::Error) -> EngineError {
    let context = context.into();
    move |err| EngineError::command(context, &err)
}

fn write_failed(path: &Path) -> impl FnOnce(anyhow::Error) -> EngineError + '_ {
    move |err| EngineError::write_failed(path, &err)
}

fn login_manager_ready(ctx: &StepContext<'_>) -> bool {
    ctx.status.display_manager.is_enabled()
}

fn apply_login_manager(ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
    let host = ctx.host;
    let config = ctx.config;
    let settings = &config.login_manager;
    let previous = match ctx.status.display_manager.clone() {
        DisplayManagerState::Enabled => return Ok(()),
        DisplayManagerState::EnabledOther(previous) => Some(previous),
        DisplayManagerState::InstalledNotEnabled | DisplayManagerState::Absent => None,
    };

    // The current manager stays enabled until the target is installed.
    let installed = host
        .packages
        .is_installed(&settings.package)
        .map_err(command_failed(format!("failed to query {}", settings.package)))?;
    if !installed {
        host.packages
            .install(&[settings.package.clone()], &mut |line: &str| ctx.emit(line))
            .map_err(command_failed(format!("failed to install {}", settings.package)))?;
    }

    let target = settings.target.as_str();
    let Some(previous) = previous else {
        return host
            .services
            .enable(&[target])
            .map_err(command_failed(format!("failed to enable {target}")));
    };

    let marker = ctx.layout.previous_login_manager_path();
    let wrote_marker = !marker.exists();
    if wrote_marker {
        write_atomic(&marker, format!("{previous}\n").as_bytes()).map_err(write_failed(&marker))?;
    }
    host.services
        .disable(&[previous.as_str()])
        .map_err(command_failed(format!("failed to disable {previous}")))?;
    if let Err(err) = host.services.enable(&[target]) {
        match host.services.enable(&[previous.as_str()]) {
            Ok(()) if wrote_marker => {
                if let Err(remove_err) = fs::remove_file(&marker) {
                    ctx.warn(format!("could not remove {}: {remove_err}", marker.display()));
                }
            }
            Ok(()) => {}
            Err(restore_err) => {
                ctx.warn(format!("could not re-enable {previous}: {restore_err:#}"));
            }
        }
        return Err(EngineError::command(format!("failed to enable {target}"), &err));
    }
    ctx.warn(format!("login manager '{previous}' was enabled; switched to '{target}'"));
    Ok(())
}

fn dependencies_ready(ctx: &StepContext<'_>) -> bool {
    ctx.status.dependencies_installed
}

fn apply_dependencies(ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
    let host = ctx.host;
    let config = ctx.config;
    let missing = config
        .packages
        .dependencies
        .iter()
        .filter(|name| !host.packages.is_installed(name).unwrap_or(false))
        .cloned()
        .collect::<Vec<_>>();
    info!(packages = ?missing, "installing missing dependencies");
    host.packages
        .install(&missing, &mut |line: &str| ctx.emit(line))
        .map_err(command_failed("failed to install dependencies"))
}

fn daemon_installed(ctx: &StepContext<'_>) -> bool {
    ctx.status.daemon_installed
}

fn apply_daemon_build(ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
    let host = ctx.host;
    let layout = ctx.layout;
    if ctx.status.interrupted_step == Some(StepId::DaemonBuild) {
        let build_dir = layout.build_dir();
        remove_dir_if_exists(&build_dir).map_err(|err| {
            EngineError::io(
                format!("failed to clear partial build {}", build_dir.display()),
                err,
            )
        })?;
        ctx.warn("previous build was interrupted; cleared partial build directory");
    }

    host.builder
        .build_and_install(layout, &mut |line: &str| ctx.emit(line))
        .map_err(command_failed("failed to build and install daemon"))
}

fn cache_dirs_ready(ctx: &StepContext<'_>) -> bool {
    ctx.layout.cache_dirs().iter().all(|dir| dir.is_dir())
}

fn apply_cache_dirs(ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
    for dir in ctx.layout.cache_dirs() {
        fs::create_dir_all(&dir)
            .map_err(|err| EngineError::io(format!("failed to create {}", dir.display()), err))?;
    }
    Ok(())
}

fn services_registered(ctx: &StepContext<'_>) -> bool {
    ctx.status.services_registered
}

fn apply_services(ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
    let layout = ctx.layout;
    let config = ctx.config;
    let daemon = &config.daemon;
    let artifact = |role: ArtifactRole| {
        layout.artifact_path(role).ok_or_else(|| {
            EngineError::Config(format!("no daemon artifact configured with role {role:?}"))
        })
    };

    let units = [
        (
            layout.daemon_unit_path(),
            render_daemon_unit(&artifact(ArtifactRole::Daemon)?, &daemon.tasks_unit),
        ),
        (
            layout.tasks_unit_path(),
            render_tasks_unit(&artifact(ArtifactRole::Tasks)?, &daemon.unit),
        ),
        (
            layout.dbus_service_path(),
            render_dbus_service(&daemon.dbus_name, &artifact(ArtifactRole::Broker)?),
        ),
    ];
    for (path, contents) in units {
        write_atomic(&path, contents.as_bytes()).map_err(write_failed(&path))?;
        ctx.emit(&format!("wrote {}", path.display()));
    }

    ctx.host
        .services
        .daemon_reload()
        .map_err(command_failed("failed to reload service manager"))
}

fn name_resolution_configured(ctx: &StepContext<'_>) -> bool {
    ctx.status.name_resolution_configured
}

fn apply_name_resolution(ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
    let path = ctx.layout.nsswitch_path();
    let current = read_optional(&path)
        .map_err(|err| EngineError::io(format!("failed to read {}", path.display()), err))?
        .unwrap_or_default();
    write_atomic(&path, configure_nsswitch(&current).as_bytes()).map_err(write_failed(&path))
}

fn auth_stack_configured(ctx: &StepContext<'_>) -> bool {
    ctx.status.auth_stack_configured
}

fn apply_auth_stack(ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
    let path = ctx.layout.pam_stack_path();
    write_atomic(&path, PAM_STACK_TEMPLATE.as_bytes()).map_err(write_failed(&path))
}

fn domain_configured(ctx: &StepContext<'_>) -> bool {
    match ctx.input.domain.as_deref() {
        Some(requested) => {
            ctx.status.domain.as_deref() == Some(requested.trim())
                && ctx.status.local_groups == ctx.input.local_groups()
        }
        None => ctx.status.domain.is_some(),
    }
}

fn apply_domain_config(ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
    let requested = ctx.input.domain.as_deref().ok_or_else(|| {
        EngineError::InvalidInput("a domain is required to write the daemon configuration".into())
    })?;
    let domain = validate_domain(requested)?;
    let path = ctx.layout.daemon_config_path();
    let rendered = render_daemon_config(&domain, &ctx.input.local_groups());
    write_atomic(&path, rendered.as_bytes()).map_err(write_failed(&path))
}

fn scheduler_running(ctx: &StepContext<'_>) -> bool {
    ctx.status.cron_running
}

fn apply_scheduler(ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
    let host = ctx.host;
    let config = ctx.config;
    let settings = &config.scheduler;
    let installed = host
        .packages
        .is_installed(&settings.package)
        .map_err(command_failed(format!("failed to query {}", settings.package)))?;
    if !installed {
        host.packages
            .install(&[settings.package.clone()], &mut |line: &str| ctx.emit(line))
            .map_err(command_failed(format!("failed to install {}", settings.package)))?;
    }

    let mut last_error = None;
    for unit in &settings.units {
        match host
            .services
            .enable(&[unit.as_str()])
            .and_then(|()| host.services.start(unit))
        {
            Ok(()) => {
                info!(unit = %unit, "scheduler enabled");
                return Ok(());
            }
            Err(err) => last_error = Some((unit.clone(), err)),
        }
    }
    Err(match last_error {
        Some((unit, err)) => EngineError::command(format!("failed to enable {unit}"), &err),
        None => EngineError::Config("scheduler.units must not be empty".into()),
    })
}

/// `Err` carries the last status line for diagnosis.
pub(crate) fn reports_healthy(host: &HostServices, token: &str) -> Result<(), String> {
    let status = host.daemon_cli.status().map_err(|err| format!("{err:#}"))?;
    if status.contains(token) {
        Ok(())
    } else {
        Err(status)
    }
}

fn daemon_healthy(ctx: &StepContext<'_>) -> bool {
    ctx.status.daemon_running && reports_healthy(ctx.host, &ctx.config.daemon.healthy_token).is_ok()
}

fn apply_daemon_start(ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
    let host = ctx.host;
    let config = ctx.config;
    let daemon = &config.daemon;
    let unit = daemon.unit.as_str();

    host.services
        .enable(&[unit])
        .map_err(command_failed(format!("failed to enable {unit}")))?;
    if ctx.status.daemon_running {
        host.services
            .restart(unit)
            .map_err(command_failed(format!("failed to restart {unit}")))?;
    } else {
        host.services
            .start(unit)
            .map_err(command_failed(format!("failed to start {unit}")))?;
    }

    let interval = Duration::from_millis(daemon.health_interval_ms);
    let mut last_status = String::new();
    for attempt in 1..=daemon.health_attempts {
        let active = host.services.is_active(unit).unwrap_or(false);
        if active {
            match reports_healthy(host, &daemon.healthy_token) {
                Ok(()) => {
                    info!(unit, attempt, "daemon reports healthy");
                    return Ok(());
                }
                Err(status) => last_status = status,
            }
        } else {
            last_status = format!("{unit} is not active");
        }
        ctx.emit(&format!(
            "health check {attempt}/{}: {last_status}",
            daemon.health_attempts
        ));
        if attempt < daemon.health_attempts {
            thread::sleep(interval);
        }
    }

    Err(EngineError::DaemonUnhealthy {
        attempts: daemon.health_attempts,
        last_status,
    })
}
