use lintune_core::{
    EngineConfig, EngineError, EnrollmentReport, OperatorInput, StepId, StepRecord, SystemStatus,
};
use tracing::info;

use crate::backup::{BackupRecord, BackupVault};
use crate::executor::{CancelFlag, InstallationRun, NullProgress, ProgressSink, StepExecutor};
use crate::host::HostServices;
use crate::probe::StateProbe;
use crate::steps::{reports_healthy, standard_steps, step, StepContext};
use crate::system::{CommandDaemonCli, CommandPackageManager, SourceDaemonBuilder, SystemctlServiceManager};
use crate::teardown::{Teardown, TeardownReport, UninstallOptions};
use crate::{is_effective_root, HostLayout};

/// Front-end facing entry point. Front ends only call these operations and
/// render what comes back.
pub struct ReconciliationEngine {
    layout: HostLayout,
    config: EngineConfig,
    host: HostServices,
    cancel: CancelFlag,
}

impl ReconciliationEngine {
    pub fn new(config: EngineConfig, host: HostServices) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|err| EngineError::Config(format!("{err:#}")))?;
        let layout = HostLayout::from_config(config.root.clone(), &config);
        Ok(Self {
            layout,
            config,
            host,
            cancel: CancelFlag::default(),
        })
    }

    /// Wires the command-backed collaborators (systemctl, the configured
    /// package manager, the source builder and the daemon CLI).
    pub fn with_system_services(config: EngineConfig) -> Result<Self, EngineError> {
        let host = HostServices {
            services: Box::new(SystemctlServiceManager),
            packages: Box::new(CommandPackageManager::new(config.packages.clone())),
            builder: Box::new(SourceDaemonBuilder::new(&config.daemon)),
            daemon_cli: Box::new(CommandDaemonCli::new(&config.daemon)),
        };
        Self::new(config, host)
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle a front end can trip from another thread or a signal handler.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn probe(&self) -> SystemStatus {
        StateProbe::new(&self.layout, &self.config, &self.host).probe()
    }

    /// Steps whose state does not hold yet, in run order.
    pub fn plan(&self, input: &OperatorInput) -> Vec<StepId> {
        let status = self.probe();
        let mut sink = NullProgress;
        standard_steps()
            .iter()
            .filter(|candidate| {
                let ctx = StepContext::new(
                    candidate.id,
                    &self.layout,
                    &self.config,
                    &self.host,
                    input,
                    &status,
                    &mut sink,
                );
                !(candidate.precondition)(&ctx)
            })
            .map(|candidate| candidate.id)
            .collect()
    }

    pub fn run_all(
        &self,
        input: &OperatorInput,
        sink: &mut dyn ProgressSink,
    ) -> Result<InstallationRun, EngineError> {
        self.ensure_privileged("running provisioning steps")?;
        self.cancel.reset();
        let run = self.executor().run_all(standard_steps(), input, sink);
        info!(
            run_id = run.run_id.as_deref().unwrap_or("-"),
            success = run.is_success(),
            "provisioning run finished"
        );
        Ok(run)
    }

    pub fn run_one(
        &self,
        id: StepId,
        input: &OperatorInput,
        sink: &mut dyn ProgressSink,
    ) -> Result<StepRecord, EngineError> {
        self.ensure_privileged(&format!("running step '{id}'"))?;
        Ok(self.executor().run_one(step(id), input, sink))
    }

    pub fn rollback(&self) -> Result<TeardownReport, EngineError> {
        self.ensure_privileged("rollback")?;
        Teardown::new(&self.layout, &self.config, &self.host).rollback()
    }

    pub fn full_uninstall(&self, options: UninstallOptions) -> Result<TeardownReport, EngineError> {
        self.ensure_privileged("full uninstall")?;
        Teardown::new(&self.layout, &self.config, &self.host).full_uninstall(options)
    }

    /// Enrollment read from the daemon journal. A daemon that does not
    /// report healthy yields `Unknown` with the status line as the error.
    pub fn enrollment(&self) -> EnrollmentReport {
        if let Err(status) = reports_healthy(&self.host, &self.config.daemon.healthy_token) {
            return EnrollmentReport::unknown(format!("daemon not responding: {status}"));
        }
        let configured = self.probe().is_fully_configured();
        match self.host.daemon_cli.recent_journal() {
            Ok(journal) => EnrollmentReport::from_journal(&journal, configured),
            Err(err) => EnrollmentReport::unknown(format!("{err:#}")),
        }
    }

    pub fn clear_cache(&self) -> Result<String, EngineError> {
        self.ensure_privileged("clearing the daemon cache")?;
        let message = self
            .host
            .daemon_cli
            .clear_cache()
            .map_err(|err| EngineError::command("failed to clear daemon cache", &err))?;
        info!(%message, "daemon cache cleared");
        Ok(message)
    }

    pub fn backups(&self) -> Result<Vec<BackupRecord>, EngineError> {
        BackupVault::new(&self.layout).records()
    }

    fn executor(&self) -> StepExecutor<'_> {
        StepExecutor::new(&self.layout, &self.config, &self.host, self.cancel.clone())
    }

    fn ensure_privileged(&self, operation: &str) -> Result<(), EngineError> {
        if self.config.require_root && !is_effective_root() {
            return Err(EngineError::PermissionDenied(operation.to_string()));
        }
        Ok(())
    }
}
