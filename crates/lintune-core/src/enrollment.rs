use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    Enrolled,
    NotEnrolled,
    DeviceLimit,
    Failed,
    Unknown,
}

impl fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Enrolled => "enrolled",
            Self::NotEnrolled => "not enrolled",
            Self::DeviceLimit => "device limit reached",
            Self::Failed => "enrollment failed",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceState {
    Compliant,
    NonCompliant,
    Unknown,
    NotApplicable,
}

impl fmt::Display for ComplianceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Compliant => "compliant",
            Self::NonCompliant => "non-compliant",
            Self::Unknown => "unknown",
            Self::NotApplicable => "n/a",
        };
        f.write_str(label)
    }
}

/// Intune enrollment as the daemon last reported it in its journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentReport {
    pub state: EnrollmentState,
    pub error: Option<String>,
    pub compliance: ComplianceState,
    /// Timestamp of the newest journal line, as journalctl printed it.
    pub last_activity: Option<String>,
}

impl EnrollmentReport {
    pub fn unknown(error: impl Into<String>) -> Self {
        Self {
            state: EnrollmentState::Unknown,
            error: Some(error.into()),
            compliance: ComplianceState::Unknown,
            last_activity: None,
        }
    }

    /// Classifies recent daemon log output. The most specific failure wins;
    /// with no failure logged, a fully configured host counts as enrolled.
    pub fn from_journal(journal: &str, host_configured: bool) -> Self {
        let lower = journal.to_lowercase();
        let (state, error) = if lower.contains("reached their enrolled device limit") {
            (
                EnrollmentState::DeviceLimit,
                Some("user has reached the enrolled device limit in Intune".to_string()),
            )
        } else if lower.contains("failed to enroll in intune") {
            let error = if lower.contains("badrequest") {
                "Intune enrollment returned BadRequest"
            } else {
                "Intune enrollment failed"
            };
            (EnrollmentState::Failed, Some(error.to_string()))
        } else if lower.contains("device is not enrolled") || !host_configured {
            (EnrollmentState::NotEnrolled, None)
        } else {
            (EnrollmentState::Enrolled, None)
        };

        let compliance = if state != EnrollmentState::Enrolled {
            ComplianceState::NotApplicable
        } else if lower.contains("non-compliant") || lower.contains("not compliant") {
            ComplianceState::NonCompliant
        } else if lower.contains("compliant") {
            ComplianceState::Compliant
        } else {
            ComplianceState::Unknown
        };

        Self {
            state,
            error,
            compliance,
            last_activity: last_timestamp(journal),
        }
    }

    pub fn is_enrolled(&self) -> bool {
        self.state == EnrollmentState::Enrolled
    }
}

/// First three fields of the newest non-marker line (`Oct 16 09:12:01`).
fn last_timestamp(journal: &str) -> Option<String> {
    let line = journal
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("--"))?;
    let fields: Vec<&str> = line.split_whitespace().take(3).collect();
    (fields.len() == 3).then(|| fields.join(" "))
}
