use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::SchedulerError;

/// 任务（Job）生命周期状态
///
/// ```text
/// Scheduled → Running → Done
///     ↑          ↓   ↘ Failed
///     └──── Delayed    ↘ Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Scheduled,
    Running,
    Delayed,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// 终止状态：Done / Failed / Cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "SCH",
            JobStatus::Running => "RUN",
            JobStatus::Delayed => "DELY",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAIL",
            JobStatus::Cancelled => "CANC",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCH" => Ok(JobStatus::Scheduled),
            "RUN" => Ok(JobStatus::Running),
            "DELY" => Ok(JobStatus::Delayed),
            "DONE" => Ok(JobStatus::Done),
            "FAIL" => Ok(JobStatus::Failed),
            "CANC" => Ok(JobStatus::Cancelled),
            _ => Err(SchedulerError::Serialization(format!("未知的任务状态: {s}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Delayed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert_eq!("DELY".parse::<JobStatus>().unwrap(), JobStatus::Delayed);
        assert!("XXX".parse::<JobStatus>().is_err());
    }
}
