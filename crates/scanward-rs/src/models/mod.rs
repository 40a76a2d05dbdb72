use std::{fmt, str::FromStr};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::parser::{FscanEvent, NmapReport};

/// Lifecycle of a tracked invocation. Moves strictly forward:
/// `PENDING -> IN_PROGRESS -> {COMPLETED, FAILED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// The only status a task may hold right before entering `self`.
    /// `PENDING` is an entry state and has none.
    pub fn predecessor(self) -> Option<TaskStatus> {
        match self {
            TaskStatus::Pending => None,
            TaskStatus::InProgress => Some(TaskStatus::Pending),
            TaskStatus::Completed | TaskStatus::Failed => Some(TaskStatus::InProgress),
        }
    }

    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        next.predecessor() == Some(self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TaskResults {
    Fscan(Vec<FscanEvent>),
    Nmap(Box<NmapReport>),
    /// Merged stdout/stderr of a free-form command.
    Log { text: String, truncated: bool },
    /// The tool succeeded but its output could not be normalized.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub command: String,
    pub log_file_path: String,
    pub comment: String,
    pub status: TaskStatus,
    pub results: Option<TaskResults>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_id: &str, command: &str, log_file_path: &str, comment: &str) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.to_string(),
            command: command.to_string(),
            log_file_path: log_file_path.to_string(),
            comment: comment.to_string(),
            status: TaskStatus::Pending,
            results: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    Fscan,
    Nmap,
    Diy,
}

impl ScanKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanKind::Fscan => "fscan",
            ScanKind::Nmap => "nmap",
            ScanKind::Diy => "diy",
        }
    }

    pub fn log_extension(self) -> &'static str {
        match self {
            ScanKind::Fscan => "json",
            ScanKind::Nmap => "xml",
            ScanKind::Diy => "log",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NmapScanSpeed {
    Safe,
    Medium,
    Fast,
    #[default]
    Aggressive,
    Insane,
}

impl NmapScanSpeed {
    pub fn level(self) -> u8 {
        match self {
            NmapScanSpeed::Safe => 1,
            NmapScanSpeed::Medium => 2,
            NmapScanSpeed::Fast => 3,
            NmapScanSpeed::Aggressive => 4,
            NmapScanSpeed::Insane => 5,
        }
    }
}

impl TryFrom<u8> for NmapScanSpeed {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(NmapScanSpeed::Safe),
            2 => Ok(NmapScanSpeed::Medium),
            3 => Ok(NmapScanSpeed::Fast),
            4 => Ok(NmapScanSpeed::Aggressive),
            5 => Ok(NmapScanSpeed::Insane),
            other => Err(format!("scan speed must be between 1 and 5, got {other}")),
        }
    }
}

impl From<NmapScanSpeed> for u8 {
    fn from(speed: NmapScanSpeed) -> Self {
        speed.level()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanRequest {
    Fscan {
        target: String,
        threads: Option<u32>,
    },
    Nmap {
        target: String,
        timeout_secs: Option<u64>,
        ports: Vec<u16>,
        speed: Option<NmapScanSpeed>,
    },
    Diy {
        command: String,
    },
}

impl ScanRequest {
    pub fn kind(&self) -> ScanKind {
        match self {
            ScanRequest::Fscan { .. } => ScanKind::Fscan,
            ScanRequest::Nmap { .. } => ScanKind::Nmap,
            ScanRequest::Diy { .. } => ScanKind::Diy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchedTask {
    pub task_id: String,
    pub command: String,
    pub log_file_path: String,
}

/// `YYMMDDHHMM-<uuid v4>`
pub fn generate_task_id() -> String {
    task_id_at(Local::now())
}

pub fn task_id_at(now: DateTime<Local>) -> String {
    format!("{}-{}", now.format("%y%m%d%H%M"), Uuid::new_v4())
}
