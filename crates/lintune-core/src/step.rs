use anyhow::{anyhow, Result};
use serde::{Serialize, Serializer};

use crate::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepId {
    LoginManager,
    Dependencies,
    DaemonBuild,
    CacheDirectories,
    Services,
    NameResolution,
    AuthStack,
    DomainConfig,
    Scheduler,
    DaemonStart,
}

impl StepId {
    pub const ALL: [StepId; 10] = [
        Self::LoginManager,
        Self::Dependencies,
        Self::DaemonBuild,
        Self::CacheDirectories,
        Self::Services,
        Self::NameResolution,
        Self::AuthStack,
        Self::DomainConfig,
        Self::Scheduler,
        Self::DaemonStart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginManager => "login-manager",
            Self::Dependencies => "dependencies",
            Self::DaemonBuild => "daemon-build",
            Self::CacheDirectories => "cache-directories",
            Self::Services => "services",
            Self::NameResolution => "name-resolution",
            Self::AuthStack => "auth-stack",
            Self::DomainConfig => "domain-config",
            Self::Scheduler => "scheduler",
            Self::DaemonStart => "daemon-start",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|step| step.as_str() == value)
            .ok_or_else(|| anyhow!("unknown step: {value}"))
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StepId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Values supplied by the operator; nothing else free-form reaches the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorInput {
    pub domain: Option<String>,
    pub grant_elevated_groups: bool,
}

impl OperatorInput {
    pub fn new(domain: impl Into<String>, grant_elevated_groups: bool) -> Self {
        Self {
            domain: Some(domain.into()),
            grant_elevated_groups,
        }
    }

    pub fn local_groups(&self) -> Vec<String> {
        if self.grant_elevated_groups {
            vec!["users".to_string(), "wheel".to_string()]
        } else {
            vec!["users".to_string()]
        }
    }
}

#[derive(Debug)]
pub enum StepOutcome {
    Skipped,
    Succeeded { warnings: Vec<String> },
    Failed(EngineError),
    NotAttempted,
}

impl StepOutcome {
    pub fn kind(&self) -> StepEventKind {
        match self {
            Self::Skipped => StepEventKind::Skipped,
            Self::Succeeded { .. } => StepEventKind::Succeeded,
            Self::Failed(_) => StepEventKind::Failed,
            Self::NotAttempted => StepEventKind::NotAttempted,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn error(&self) -> Option<&EngineError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct StepRecord {
    pub id: StepId,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEventKind {
    Started,
    Output,
    Warning,
    Skipped,
    Succeeded,
    Failed,
    NotAttempted,
}

impl StepEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Output => "output",
            Self::Warning => "warning",
            Self::Skipped => "skipped",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::NotAttempted => "not-attempted",
        }
    }
}

/// One structured progress event; presentation decides the formatting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepEvent {
    pub step: StepId,
    pub kind: StepEventKind,
    pub message: String,
}

impl StepEvent {
    pub fn new(step: StepId, kind: StepEventKind, message: impl Into<String>) -> Self {
        Self {
            step,
            kind,
            message: message.into(),
        }
    }
}
