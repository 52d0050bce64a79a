use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub type JobId = String;

/// Job state as reported by `qstat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PbsStatus {
    Queued,
    Running,
    Suspended,
    Complete,
    Other(String),
}

impl PbsStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "Q" => PbsStatus::Queued,
            "R" => PbsStatus::Running,
            "S" => PbsStatus::Suspended,
            "C" => PbsStatus::Complete,
            other => PbsStatus::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            PbsStatus::Queued => "Q",
            PbsStatus::Running => "R",
            PbsStatus::Suspended => "S",
            PbsStatus::Complete => "C",
            PbsStatus::Other(code) => code,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PbsStatus::Complete)
    }
}

impl Display for PbsStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Job state of the `at`/`batch` variant, derived from `atq` on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnixBatchStatus {
    Queued,
    Executing,
    Completed,
    Cancelled,
}

impl UnixBatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnixBatchStatus::Completed | UnixBatchStatus::Cancelled)
    }
}

impl Display for UnixBatchStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnixBatchStatus::Queued => "Queued",
            UnixBatchStatus::Executing => "Executing",
            UnixBatchStatus::Completed => "Completed",
            UnixBatchStatus::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbsJob {
    pub batch_filename: String,
    pub status: PbsStatus,
    pub worker_node: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixBatchJob {
    /// Subdirectory of the output root holding the `o` and `e` files.
    pub directory: String,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDetails {
    Pbs(PbsJob),
    UnixBatch(UnixBatchJob),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    /// Authenticated submitter.
    pub username: String,
    /// Account that executes the job.
    pub owner: String,
    pub executable: String,
    pub submitted_at: DateTime<Utc>,
    pub details: JobDetails,
}

impl Job {
    pub fn pbs(&self) -> Option<&PbsJob> {
        match &self.details {
            JobDetails::Pbs(pbs) => Some(pbs),
            JobDetails::UnixBatch(_) => None,
        }
    }

    pub fn unix_batch(&self) -> Option<&UnixBatchJob> {
        match &self.details {
            JobDetails::UnixBatch(batch) => Some(batch),
            JobDetails::Pbs(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Output,
    Error,
}

impl OutputKind {
    /// Single letter used in output file names.
    pub fn letter(&self) -> &'static str {
        match self {
            OutputKind::Output => "o",
            OutputKind::Error => "e",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PbsStatus, UnixBatchStatus};

    #[test]
    fn pbs_status_codes() {
        for code in ["Q", "R", "S", "C", "E", "H"] {
            assert_eq!(PbsStatus::from_code(code).code(), code);
        }
        assert_eq!(PbsStatus::from_code("E"), PbsStatus::Other("E".into()));
        assert!(PbsStatus::from_code("C").is_terminal());
        assert!(!PbsStatus::from_code("S").is_terminal());
    }

    #[test]
    fn unix_batch_terminal_states() {
        assert!(UnixBatchStatus::Completed.is_terminal());
        assert!(UnixBatchStatus::Cancelled.is_terminal());
        assert!(!UnixBatchStatus::Queued.is_terminal());
        assert!(!UnixBatchStatus::Executing.is_terminal());
        assert_eq!(UnixBatchStatus::Executing.to_string(), "Executing");
    }
}
