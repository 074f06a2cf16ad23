//! Sprint workflow records and the storage contract behind the service.
//!
//! The tracker stays the source of truth for issues themselves; these
//! records hold only the sprint-planning state layered on top, keyed by
//! (sprint id, issue id).

pub mod memory;
pub mod sqlite;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::status::{IssueStatus, SprintStatus};

/// A sprint: a time-boxed slice of a project's backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sprint {
    pub id: i64,
    pub title: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub goals: String,
    pub project_id: i64,
    pub status: SprintStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when creating a sprint. Status starts out active.
#[derive(Debug, Clone)]
pub struct NewSprint {
    pub title: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub goals: String,
    pub project_id: i64,
}

/// Full replacement of a sprint's editable fields.
#[derive(Debug, Clone)]
pub struct SprintUpdate {
    pub title: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub goals: String,
}

/// An issue enrolled in a sprint, with the workflow state this service owns
/// for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SprintIssue {
    pub sprint_id: i64,
    pub issue_id: i64,
    pub story_points: u32,
    pub priority: String,
    pub title: String,
    pub description: String,
    pub status: IssueStatus,
    pub assigned_to: Option<i64>,
    pub last_commit: Option<DateTime<Utc>>,
    pub last_merge: Option<DateTime<Utc>>,
    pub branch_name: Option<String>,
    pub merge_request_iid: Option<i64>,
}

/// Fields supplied when enrolling an issue in a sprint.
#[derive(Debug, Clone)]
pub struct NewSprintIssue {
    pub sprint_id: i64,
    pub issue_id: i64,
    pub story_points: u32,
    pub priority: String,
    pub title: String,
    pub description: String,
}

impl NewSprintIssue {
    /// The record a fresh enrollment produces: no recorded activity, so the
    /// derived status is To Do.
    pub fn into_record(self) -> SprintIssue {
        SprintIssue {
            sprint_id: self.sprint_id,
            issue_id: self.issue_id,
            story_points: self.story_points,
            priority: self.priority,
            title: self.title,
            description: self.description,
            status: IssueStatus::ToDo,
            assigned_to: None,
            last_commit: None,
            last_merge: None,
            branch_name: None,
            merge_request_iid: None,
        }
    }
}

/// Activity folded into a sprint issue by the reconciliation engine.
///
/// Present fields replace the stored ones; absent fields keep whatever is
/// stored (coalesce). The status is then rederived from the merged record,
/// so a merge recorded earlier keeps an issue Done even when a later update
/// carries no merge timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedUpdate {
    pub last_commit: Option<DateTime<Utc>>,
    pub last_merge: Option<DateTime<Utc>>,
    pub branch_name: Option<String>,
    pub merge_request_iid: Option<i64>,
}

impl DerivedUpdate {
    /// Fold this update into `issue` and rederive its status. Returns the
    /// status the record ends up with.
    pub fn apply(&self, issue: &mut SprintIssue) -> IssueStatus {
        if let Some(ts) = self.last_commit {
            issue.last_commit = Some(ts);
        }
        if let Some(ts) = self.last_merge {
            issue.last_merge = Some(ts);
        }
        if let Some(branch) = &self.branch_name {
            issue.branch_name = Some(branch.clone());
        }
        if let Some(iid) = self.merge_request_iid {
            issue.merge_request_iid = Some(iid);
        }
        issue.status = IssueStatus::derived(
            issue.last_merge.is_some(),
            issue.last_commit.is_some(),
            issue.assigned_to.is_some(),
        );
        issue.status
    }
}

/// Result of enrolling an issue in a sprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The (sprint, issue) pair already existed; the stored record was left
    /// untouched.
    AlreadyPresent,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },
    #[error("sprint is already completed")]
    AlreadyCompleted,
    #[error("storage failure during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
    #[error("corrupt {what} in stored record")]
    Corruption { what: &'static str },
}

impl StoreError {
    pub fn not_found(entity: &'static str) -> Self {
        StoreError::NotFound { entity }
    }

    pub fn storage(operation: &'static str, message: impl fmt::Display) -> Self {
        StoreError::Storage {
            operation,
            message: message.to_string(),
        }
    }

    pub fn corruption(what: &'static str) -> Self {
        StoreError::Corruption { what }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Storage contract for sprints and the issues enrolled in them.
///
/// Implementations keep per-key updates atomic: `apply_derived_update` and
/// `set_assignee` are read-modify-write cycles, and concurrent calls for the
/// same (sprint, issue) must not interleave.
#[async_trait]
pub trait SprintStore: Send + Sync {
    async fn create_sprint(&self, new: NewSprint) -> Result<i64, StoreError>;

    async fn sprint(&self, sprint_id: i64) -> Result<Sprint, StoreError>;

    /// All sprints of a project, newest start date first.
    async fn sprints_for_project(&self, project_id: i64) -> Result<Vec<Sprint>, StoreError>;

    async fn update_sprint(&self, sprint_id: i64, update: SprintUpdate) -> Result<(), StoreError>;

    /// One-way transition to completed. A second call reports
    /// `AlreadyCompleted`, distinct from a missing sprint.
    async fn complete_sprint(&self, sprint_id: i64) -> Result<(), StoreError>;

    /// Removes the sprint and every issue enrolled in it, atomically.
    async fn delete_sprint(&self, sprint_id: i64) -> Result<(), StoreError>;

    /// Idempotent enrollment: an existing (sprint, issue) pair is left
    /// untouched, never duplicated or overwritten.
    async fn add_issue(&self, new: NewSprintIssue) -> Result<UpsertOutcome, StoreError>;

    async fn sprint_issue(&self, sprint_id: i64, issue_id: i64)
        -> Result<SprintIssue, StoreError>;

    /// All issues of a sprint. A missing sprint is `NotFound`; a sprint with
    /// no issues is an empty list.
    async fn sprint_issues(&self, sprint_id: i64) -> Result<Vec<SprintIssue>, StoreError>;

    /// Merge recorded activity into the issue and rederive its status.
    async fn apply_derived_update(
        &self,
        sprint_id: i64,
        issue_id: i64,
        update: DerivedUpdate,
    ) -> Result<IssueStatus, StoreError>;

    /// Store the assignee (`None` clears it) and rederive the status from
    /// the commit/merge fields as currently stored.
    async fn set_assignee(
        &self,
        sprint_id: i64,
        issue_id: i64,
        assignee: Option<i64>,
    ) -> Result<IssueStatus, StoreError>;

    /// Direct status write, bypassing derivation. The only path that can
    /// produce `Blocked`.
    async fn set_status(
        &self,
        sprint_id: i64,
        issue_id: i64,
        status: IssueStatus,
    ) -> Result<(), StoreError>;

    async fn remove_issue(&self, sprint_id: i64, issue_id: i64) -> Result<(), StoreError>;

    /// A sprint containing the issue (the lowest sprint id when several do).
    async fn find_sprint_for_issue(&self, issue_id: i64) -> Result<i64, StoreError>;

    async fn user_role(&self, user_id: i64) -> Result<Option<String>, StoreError>;

    async fn set_user_role(&self, user_id: i64, role: &str) -> Result<(), StoreError>;
}
