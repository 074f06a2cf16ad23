//! Agile workflow statuses and the rules that derive them from activity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Raised when a status string is outside the known set.
#[derive(Debug, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

/// Workflow status of an issue within a sprint.
///
/// The serialized names are canonical and must survive a round trip through
/// persistence unchanged. Localization, if any, happens in presentation
/// layers outside this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueStatus {
    #[serde(rename = "To Do")]
    ToDo,
    #[serde(rename = "In Progress")]
    InProgress,
    #[serde(rename = "In Review")]
    InReview,
    #[serde(rename = "Done")]
    Done,
    #[serde(rename = "Blocked")]
    Blocked,
}

impl IssueStatus {
    /// All statuses in workflow order, for validation messages.
    pub const ALL: [IssueStatus; 5] = [
        IssueStatus::ToDo,
        IssueStatus::InProgress,
        IssueStatus::InReview,
        IssueStatus::Done,
        IssueStatus::Blocked,
    ];

    /// Derive the status an issue should carry from the activity recorded
    /// against it: a merge wins over a commit, a commit over an assignee.
    ///
    /// `Blocked` is never derived; it is only reachable through the direct
    /// status update.
    pub fn derived(has_merge: bool, has_commit: bool, has_assignee: bool) -> IssueStatus {
        if has_merge {
            IssueStatus::Done
        } else if has_commit {
            IssueStatus::InReview
        } else if has_assignee {
            IssueStatus::InProgress
        } else {
            IssueStatus::ToDo
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::ToDo => "To Do",
            IssueStatus::InProgress => "In Progress",
            IssueStatus::InReview => "In Review",
            IssueStatus::Done => "Done",
            IssueStatus::Blocked => "Blocked",
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IssueStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Lifecycle of a sprint. Completion is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SprintStatus {
    Active,
    Completed,
}

impl SprintStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SprintStatus::Active => "active",
            SprintStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for SprintStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SprintStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SprintStatus::Active),
            "completed" => Ok(SprintStatus::Completed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}
