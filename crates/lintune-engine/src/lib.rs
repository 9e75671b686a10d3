mod backup;
mod engine;
mod executor;
mod fs_utils;
mod host;
mod journal;
mod layout;
mod probe;
mod steps;
mod system;
mod teardown;
mod templates;

pub use backup::{BackupRecord, BackupVault};
pub use engine::ReconciliationEngine;
pub use executor::{CancelFlag, InstallationRun, NullProgress, ProgressSink, StepExecutor};
pub use host::{DaemonBuilder, DaemonCli, HostServices, PackageManager, ServiceManager};
pub use journal::{read_interrupted_step, JournalEntry, JournalState, RunJournal};
pub use layout::HostLayout;
pub use probe::StateProbe;
pub use steps::{standard_steps, step, MutationStep, StepContext};
pub use system::{
    CommandDaemonCli, CommandPackageManager, SourceDaemonBuilder, SystemctlServiceManager,
};
pub use teardown::{TeardownReport, UninstallOptions};

/// Whether the process runs with an effective uid of 0.
pub fn is_effective_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}
