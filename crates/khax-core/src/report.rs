use crate::error::{FailureClass, KhaxError, ResultCode};
use crate::exploit::TechniqueKind;
use crate::grant::AclSnapshot;
use crate::version::SystemVersion;
use serde::Serialize;

/// Outcome of one escalation attempt.
///
/// Contains the selected technique, how far the steps got, the final
/// corruption level and the captured ACL backups.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// ISO 8601 timestamp of when the run finished
    pub date: String,
    /// Reported kernel version
    pub kernel_version: SystemVersion,
    /// Reported firmware version
    pub firm_version: SystemVersion,
    /// Hardware variant
    pub new_3ds: bool,
    /// Selected technique, if the kernel was recognized
    pub technique: Option<TechniqueKind>,
    /// Number of steps that completed
    pub steps_completed: u32,
    /// Number of steps of the technique
    pub steps_total: u32,
    /// Corruption level when the session ended
    pub corruption_level: u32,
    /// Allocation bitmask when the session ended
    pub allocated_mask: u32,
    /// ACL and process id backups
    pub acl_backup: Option<AclSnapshot>,
    /// Result code (0 on success)
    pub result: ResultCode,
    /// Failure class and message on failure
    pub error: Option<ReportedError>,
}

/// Serializable summary of a [`KhaxError`].
#[derive(Debug, Serialize)]
pub struct ReportedError {
    /// Failure class
    pub class: FailureClass,
    /// Display text
    pub message: String,
}

impl From<&KhaxError> for ReportedError {
    fn from(e: &KhaxError) -> Self {
        ReportedError {
            class: e.class(),
            message: e.to_string(),
        }
    }
}

impl RunReport {
    /// A report for a run that has not selected a technique yet.
    pub fn new(kernel_version: SystemVersion, firm_version: SystemVersion, new_3ds: bool) -> Self {
        RunReport {
            date: chrono::Local::now().to_rfc3339(),
            kernel_version,
            firm_version,
            new_3ds,
            technique: None,
            steps_completed: 0,
            steps_total: 0,
            corruption_level: 0,
            allocated_mask: 0,
            acl_backup: None,
            result: ResultCode::SUCCESS,
            error: None,
        }
    }

    /// Records `error` as the outcome.
    pub fn fail(&mut self, error: &KhaxError) {
        self.result = error.code();
        self.error = Some(error.into());
        self.date = chrono::Local::now().to_rfc3339();
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Returns `true` if every step completed.
    pub fn is_success(&self) -> bool {
        self.result.is_success() && self.steps_completed == self.steps_total && self.steps_total > 0
    }
}
