mod config;
mod enrollment;
mod error;
mod status;
mod step;

pub use config::{
    ArtifactRole, DaemonArtifact, DaemonSettings, EngineConfig, LoginManagerSettings,
    PackageSettings, PathTable, SchedulerSettings,
};
pub use enrollment::{ComplianceState, EnrollmentReport, EnrollmentState};
pub use error::{EngineError, ErrorKind};
pub use status::{DisplayManagerState, HostPhase, ProbeIssue, SystemStatus};
pub use step::{OperatorInput, StepEvent, StepEventKind, StepId, StepOutcome, StepRecord};
