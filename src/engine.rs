//! Reconciliation between tracker activity and sprint workflow state.
//!
//! The engine is invoked synchronously inside one webhook delivery or one
//! sprint read; nothing here schedules background work. Push batches and
//! polling passes are best-effort and keep going past individual failures,
//! while a merge request event is a single action whose failure propagates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::gitlab::{IssueTracker, TrackerIssueState};
use crate::issue_ref::{extract_issue_ref, extract_issue_ref_from_merge_request};
use crate::status::IssueStatus;
use crate::store::{DerivedUpdate, SprintIssue, SprintStore, StoreError};
use crate::webhook::{MergeRequestEvent, PushEvent};

pub struct ReconciliationEngine {
    store: Arc<dyn SprintStore>,
    tracker: Arc<dyn IssueTracker>,
    default_branch: String,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn SprintStore>,
        tracker: Arc<dyn IssueTracker>,
        default_branch: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tracker,
            default_branch: default_branch.into(),
        }
    }

    /// Record commit activity from a push event. Each commit is handled
    /// independently; commits without an issue reference, commits whose
    /// issue is in no sprint, and store failures are all skipped so one
    /// bad commit never sinks the rest of the batch. Returns the number
    /// of issues that were updated.
    pub async fn process_push(&self, event: &PushEvent) -> usize {
        let mut linked = 0;
        for commit in &event.commits {
            let Some(issue_id) = extract_issue_ref(&commit.message) else {
                debug!("Commit {} carries no issue reference", commit.id);
                continue;
            };
            let sprint_id = match self.store.find_sprint_for_issue(issue_id).await {
                Ok(id) => id,
                Err(e) if e.is_not_found() => {
                    debug!("Issue #{} referenced by commit is not in any sprint", issue_id);
                    continue;
                }
                Err(e) => {
                    warn!("Sprint lookup for issue #{} failed: {}", issue_id, e);
                    continue;
                }
            };
            let update = DerivedUpdate {
                last_commit: Some(parse_event_timestamp(commit.timestamp.as_deref())),
                branch_name: Some(self.default_branch.clone()),
                ..Default::default()
            };
            match self.store.apply_derived_update(sprint_id, issue_id, update).await {
                Ok(status) => {
                    info!(
                        "Recorded commit {} for issue #{} in sprint {} (status: {})",
                        commit.id, issue_id, sprint_id, status
                    );
                    linked += 1;
                }
                Err(e) => warn!(
                    "Failed to record commit for issue #{} in sprint {}: {}",
                    issue_id, sprint_id, e
                ),
            }
        }
        linked
    }

    /// Apply a merge request event to the issue it references. Returns
    /// whether anything was written: an event with no issue reference, a
    /// closed-unmerged event, and an unrecognized state are all quiet
    /// no-ops. A referenced issue that is in no sprint is an error here,
    /// unlike in a push batch.
    pub async fn process_merge_request(
        &self,
        event: &MergeRequestEvent,
    ) -> Result<bool, StoreError> {
        let attrs = &event.object_attributes;
        let Some(issue_id) =
            extract_issue_ref_from_merge_request(&attrs.title, &attrs.description)
        else {
            debug!("Merge request !{} carries no issue reference", attrs.iid);
            return Ok(false);
        };
        let sprint_id = self.store.find_sprint_for_issue(issue_id).await?;

        match attrs.state.as_str() {
            "merged" => {
                let update = DerivedUpdate {
                    last_merge: Some(parse_event_timestamp(attrs.updated_at.as_deref())),
                    branch_name: attrs.source_branch.clone(),
                    merge_request_iid: Some(attrs.iid),
                    ..Default::default()
                };
                let status = self
                    .store
                    .apply_derived_update(sprint_id, issue_id, update)
                    .await?;
                info!(
                    "Recorded merge of !{} for issue #{} in sprint {} (status: {})",
                    attrs.iid, issue_id, sprint_id, status
                );
                Ok(true)
            }
            // No merge timestamp: the derived status tops out at In Review
            // until the merge actually lands.
            "opened" | "reopened" => {
                let update = DerivedUpdate {
                    branch_name: attrs.source_branch.clone(),
                    merge_request_iid: Some(attrs.iid),
                    ..Default::default()
                };
                let status = self
                    .store
                    .apply_derived_update(sprint_id, issue_id, update)
                    .await?;
                info!(
                    "Linked merge request !{} to issue #{} in sprint {} (status: {})",
                    attrs.iid, issue_id, sprint_id, status
                );
                Ok(true)
            }
            "closed" => {
                debug!(
                    "Merge request !{} for issue #{} closed without merging",
                    attrs.iid, issue_id
                );
                Ok(false)
            }
            other => {
                info!("Ignoring merge request !{} in state {}", attrs.iid, other);
                Ok(false)
            }
        }
    }

    /// Reconcile a sprint's issues against their live tracker state and
    /// return the refreshed list. An issue closed on the tracker but not
    /// yet Done here is forced to Done. Failures on individual issues are
    /// logged and skipped; the read itself only fails when the sprint is
    /// missing or the store does.
    pub async fn sync_sprint_issues(
        &self,
        token: &str,
        sprint_id: i64,
    ) -> Result<Vec<SprintIssue>, StoreError> {
        let sprint = self.store.sprint(sprint_id).await?;
        let issues = self.store.sprint_issues(sprint_id).await?;

        let mut forced = 0;
        for issue in &issues {
            let live = match self
                .tracker
                .issue(token, sprint.project_id, issue.issue_id)
                .await
            {
                Ok(live) => live,
                Err(e) => {
                    warn!(
                        "Failed to fetch live state for issue #{} in sprint {}: {}",
                        issue.issue_id, sprint_id, e
                    );
                    continue;
                }
            };
            if live.state == TrackerIssueState::Closed && issue.status != IssueStatus::Done {
                match self
                    .store
                    .set_status(sprint_id, issue.issue_id, IssueStatus::Done)
                    .await
                {
                    Ok(()) => {
                        info!(
                            "Issue #{} closed on the tracker, forcing Done in sprint {}",
                            issue.issue_id, sprint_id
                        );
                        forced += 1;
                    }
                    Err(e) => warn!(
                        "Failed to force status for issue #{} in sprint {}: {}",
                        issue.issue_id, sprint_id, e
                    ),
                }
            }
        }

        if forced > 0 {
            self.store.sprint_issues(sprint_id).await
        } else {
            Ok(issues)
        }
    }
}

/// Parse an event timestamp, falling back to the processing time when the
/// value is missing or malformed. Events never fail on a bad date.
fn parse_event_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(e) => {
            warn!("Unparseable event timestamp {:?}, substituting now: {}", raw, e);
            Utc::now()
        }
    }
}
