//! In-memory store for tests and ephemeral runs.
//!
//! Everything lives under a single `RwLock`, which also gives the
//! per-key read-modify-write operations their atomicity.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    DerivedUpdate, NewSprint, NewSprintIssue, Sprint, SprintIssue, SprintStore, SprintUpdate,
    StoreError, UpsertOutcome,
};
use crate::status::{IssueStatus, SprintStatus};

#[derive(Default)]
struct Inner {
    next_sprint_id: i64,
    sprints: HashMap<i64, Sprint>,
    issues: HashMap<(i64, i64), SprintIssue>,
    roles: HashMap<i64, String>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SprintStore for InMemoryStore {
    async fn create_sprint(&self, new: NewSprint) -> Result<i64, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_sprint_id += 1;
        let id = inner.next_sprint_id;
        let now = Utc::now();
        inner.sprints.insert(
            id,
            Sprint {
                id,
                title: new.title,
                start_date: new.start_date,
                end_date: new.end_date,
                goals: new.goals,
                project_id: new.project_id,
                status: SprintStatus::Active,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn sprint(&self, sprint_id: i64) -> Result<Sprint, StoreError> {
        self.inner
            .read()
            .await
            .sprints
            .get(&sprint_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("sprint"))
    }

    async fn sprints_for_project(&self, project_id: i64) -> Result<Vec<Sprint>, StoreError> {
        let inner = self.inner.read().await;
        let mut sprints: Vec<Sprint> = inner
            .sprints
            .values()
            .filter(|sprint| sprint.project_id == project_id)
            .cloned()
            .collect();
        sprints.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        Ok(sprints)
    }

    async fn update_sprint(&self, sprint_id: i64, update: SprintUpdate) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let sprint = inner
            .sprints
            .get_mut(&sprint_id)
            .ok_or_else(|| StoreError::not_found("sprint"))?;
        sprint.title = update.title;
        sprint.start_date = update.start_date;
        sprint.end_date = update.end_date;
        sprint.goals = update.goals;
        sprint.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_sprint(&self, sprint_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let sprint = inner
            .sprints
            .get_mut(&sprint_id)
            .ok_or_else(|| StoreError::not_found("sprint"))?;
        if sprint.status == SprintStatus::Completed {
            return Err(StoreError::AlreadyCompleted);
        }
        sprint.status = SprintStatus::Completed;
        sprint.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_sprint(&self, sprint_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.sprints.remove(&sprint_id).is_none() {
            return Err(StoreError::not_found("sprint"));
        }
        inner.issues.retain(|(sprint, _), _| *sprint != sprint_id);
        Ok(())
    }

    async fn add_issue(&self, new: NewSprintIssue) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (new.sprint_id, new.issue_id);
        if inner.issues.contains_key(&key) {
            return Ok(UpsertOutcome::AlreadyPresent);
        }
        inner.issues.insert(key, new.into_record());
        Ok(UpsertOutcome::Inserted)
    }

    async fn sprint_issue(
        &self,
        sprint_id: i64,
        issue_id: i64,
    ) -> Result<SprintIssue, StoreError> {
        self.inner
            .read()
            .await
            .issues
            .get(&(sprint_id, issue_id))
            .cloned()
            .ok_or_else(|| StoreError::not_found("sprint issue"))
    }

    async fn sprint_issues(&self, sprint_id: i64) -> Result<Vec<SprintIssue>, StoreError> {
        let inner = self.inner.read().await;
        if !inner.sprints.contains_key(&sprint_id) {
            return Err(StoreError::not_found("sprint"));
        }
        let mut issues: Vec<SprintIssue> = inner
            .issues
            .values()
            .filter(|issue| issue.sprint_id == sprint_id)
            .cloned()
            .collect();
        issues.sort_by_key(|issue| issue.issue_id);
        Ok(issues)
    }

    async fn apply_derived_update(
        &self,
        sprint_id: i64,
        issue_id: i64,
        update: DerivedUpdate,
    ) -> Result<IssueStatus, StoreError> {
        let mut inner = self.inner.write().await;
        let issue = inner
            .issues
            .get_mut(&(sprint_id, issue_id))
            .ok_or_else(|| StoreError::not_found("sprint issue"))?;
        Ok(update.apply(issue))
    }

    async fn set_assignee(
        &self,
        sprint_id: i64,
        issue_id: i64,
        assignee: Option<i64>,
    ) -> Result<IssueStatus, StoreError> {
        let mut inner = self.inner.write().await;
        let issue = inner
            .issues
            .get_mut(&(sprint_id, issue_id))
            .ok_or_else(|| StoreError::not_found("sprint issue"))?;
        issue.assigned_to = assignee;
        issue.status = IssueStatus::derived(
            issue.last_merge.is_some(),
            issue.last_commit.is_some(),
            issue.assigned_to.is_some(),
        );
        Ok(issue.status)
    }

    async fn set_status(
        &self,
        sprint_id: i64,
        issue_id: i64,
        status: IssueStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let issue = inner
            .issues
            .get_mut(&(sprint_id, issue_id))
            .ok_or_else(|| StoreError::not_found("sprint issue"))?;
        issue.status = status;
        Ok(())
    }

    async fn remove_issue(&self, sprint_id: i64, issue_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .issues
            .remove(&(sprint_id, issue_id))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("sprint issue"))
    }

    async fn find_sprint_for_issue(&self, issue_id: i64) -> Result<i64, StoreError> {
        self.inner
            .read()
            .await
            .issues
            .keys()
            .filter(|(_, issue)| *issue == issue_id)
            .map(|(sprint, _)| *sprint)
            .min()
            .ok_or_else(|| StoreError::not_found("sprint issue"))
    }

    async fn user_role(&self, user_id: i64) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.roles.get(&user_id).cloned())
    }

    async fn set_user_role(&self, user_id: i64, role: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .roles
            .insert(user_id, role.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    use super::*;

    fn new_sprint(project_id: i64) -> NewSprint {
        NewSprint {
            title: "Iteration 1".to_string(),
            start_date: ts(1_000),
            end_date: ts(2_000),
            goals: "ship the webhook intake".to_string(),
            project_id,
        }
    }

    fn new_issue(sprint_id: i64, issue_id: i64) -> NewSprintIssue {
        NewSprintIssue {
            sprint_id,
            issue_id,
            story_points: 5,
            priority: "medium".to_string(),
            title: format!("issue {issue_id}"),
            description: String::new(),
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn store_with_sprint() -> (InMemoryStore, i64) {
        let store = InMemoryStore::new();
        let sprint_id = store.create_sprint(new_sprint(7)).await.unwrap();
        (store, sprint_id)
    }

    #[tokio::test]
    async fn test_sprint_round_trip() {
        let (store, sprint_id) = store_with_sprint().await;
        let sprint = store.sprint(sprint_id).await.unwrap();
        assert_eq!(sprint.title, "Iteration 1");
        assert_eq!(sprint.status, SprintStatus::Active);
    }

    #[tokio::test]
    async fn test_missing_sprint_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.sprint(999).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_sprints_for_project_newest_first() {
        let store = InMemoryStore::new();
        let early = store.create_sprint(new_sprint(7)).await.unwrap();
        let late = store
            .create_sprint(NewSprint {
                start_date: ts(5_000),
                ..new_sprint(7)
            })
            .await
            .unwrap();
        store.create_sprint(new_sprint(8)).await.unwrap();

        let sprints = store.sprints_for_project(7).await.unwrap();
        assert_eq!(
            sprints.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![late, early]
        );
    }

    #[tokio::test]
    async fn test_complete_sprint_is_one_way() {
        let (store, sprint_id) = store_with_sprint().await;
        store.complete_sprint(sprint_id).await.unwrap();
        assert_eq!(
            store.sprint(sprint_id).await.unwrap().status,
            SprintStatus::Completed
        );

        let err = store.complete_sprint(sprint_id).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyCompleted));

        let err = store.complete_sprint(999).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_add_issue_is_idempotent() {
        let (store, sprint_id) = store_with_sprint().await;
        assert_eq!(
            store.add_issue(new_issue(sprint_id, 10)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        store
            .set_assignee(sprint_id, 10, Some(42))
            .await
            .unwrap();

        // A second enrollment must not clobber the record.
        assert_eq!(
            store.add_issue(new_issue(sprint_id, 10)).await.unwrap(),
            UpsertOutcome::AlreadyPresent
        );
        let issue = store.sprint_issue(sprint_id, 10).await.unwrap();
        assert_eq!(issue.assigned_to, Some(42));
        assert_eq!(issue.status, IssueStatus::InProgress);
        assert_eq!(store.sprint_issues(sprint_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sprint_issues_of_missing_sprint_is_not_found() {
        let (store, sprint_id) = store_with_sprint().await;
        assert!(store.sprint_issues(sprint_id).await.unwrap().is_empty());

        let err = store.sprint_issues(sprint_id + 1).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_apply_derived_update_coalesces() {
        let (store, sprint_id) = store_with_sprint().await;
        store.add_issue(new_issue(sprint_id, 10)).await.unwrap();

        let status = store
            .apply_derived_update(
                sprint_id,
                10,
                DerivedUpdate {
                    last_commit: Some(ts(100)),
                    branch_name: Some("main".to_string()),
                    ..DerivedUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(status, IssueStatus::InReview);

        let status = store
            .apply_derived_update(
                sprint_id,
                10,
                DerivedUpdate {
                    last_merge: Some(ts(200)),
                    merge_request_iid: Some(3),
                    ..DerivedUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(status, IssueStatus::Done);

        let issue = store.sprint_issue(sprint_id, 10).await.unwrap();
        assert_eq!(issue.last_commit, Some(ts(100)));
        assert_eq!(issue.last_merge, Some(ts(200)));
        assert_eq!(issue.branch_name.as_deref(), Some("main"));
        assert_eq!(issue.merge_request_iid, Some(3));
    }

    #[tokio::test]
    async fn test_set_assignee_rederives_from_stored_activity() {
        let (store, sprint_id) = store_with_sprint().await;
        store.add_issue(new_issue(sprint_id, 10)).await.unwrap();

        assert_eq!(
            store.set_assignee(sprint_id, 10, Some(5)).await.unwrap(),
            IssueStatus::InProgress
        );
        assert_eq!(
            store.set_assignee(sprint_id, 10, None).await.unwrap(),
            IssueStatus::ToDo
        );

        store
            .apply_derived_update(
                sprint_id,
                10,
                DerivedUpdate {
                    last_commit: Some(ts(100)),
                    ..DerivedUpdate::default()
                },
            )
            .await
            .unwrap();
        // The stored commit outranks the assignee change.
        assert_eq!(
            store.set_assignee(sprint_id, 10, Some(5)).await.unwrap(),
            IssueStatus::InReview
        );
    }

    #[tokio::test]
    async fn test_set_status_direct_allows_blocked() {
        let (store, sprint_id) = store_with_sprint().await;
        store.add_issue(new_issue(sprint_id, 10)).await.unwrap();
        store
            .set_status(sprint_id, 10, IssueStatus::Blocked)
            .await
            .unwrap();
        assert_eq!(
            store.sprint_issue(sprint_id, 10).await.unwrap().status,
            IssueStatus::Blocked
        );
    }

    #[tokio::test]
    async fn test_remove_issue() {
        let (store, sprint_id) = store_with_sprint().await;
        store.add_issue(new_issue(sprint_id, 10)).await.unwrap();
        store.remove_issue(sprint_id, 10).await.unwrap();

        let err = store.remove_issue(sprint_id, 10).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_find_sprint_for_issue_prefers_lowest_sprint() {
        let store = InMemoryStore::new();
        let first = store.create_sprint(new_sprint(7)).await.unwrap();
        let second = store.create_sprint(new_sprint(7)).await.unwrap();
        store.add_issue(new_issue(second, 10)).await.unwrap();
        store.add_issue(new_issue(first, 10)).await.unwrap();

        assert_eq!(store.find_sprint_for_issue(10).await.unwrap(), first);

        let err = store.find_sprint_for_issue(11).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_sprint_cascades_to_issues() {
        let (store, sprint_id) = store_with_sprint().await;
        store.add_issue(new_issue(sprint_id, 10)).await.unwrap();
        store.delete_sprint(sprint_id).await.unwrap();

        assert!(store
            .find_sprint_for_issue(10)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store.sprint(sprint_id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_user_roles_upsert() {
        let store = InMemoryStore::new();
        assert_eq!(store.user_role(1).await.unwrap(), None);
        store.set_user_role(1, "developer").await.unwrap();
        store.set_user_role(1, "project_manager").await.unwrap();
        assert_eq!(
            store.user_role(1).await.unwrap().as_deref(),
            Some("project_manager")
        );
    }

    proptest! {
        /// The stored status always matches the derivation over whatever
        /// signals the record ended up with.
        #[test]
        fn prop_status_matches_signals(
            commit in proptest::option::of(0i64..10_000),
            merge in proptest::option::of(0i64..10_000),
            assignee in proptest::option::of(1i64..100),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(async {
                let (store, sprint_id) = store_with_sprint().await;
                store.add_issue(new_issue(sprint_id, 10)).await.unwrap();
                store
                    .apply_derived_update(
                        sprint_id,
                        10,
                        DerivedUpdate {
                            last_commit: commit.map(ts),
                            last_merge: merge.map(ts),
                            ..DerivedUpdate::default()
                        },
                    )
                    .await
                    .unwrap();
                let status = store.set_assignee(sprint_id, 10, assignee).await.unwrap();
                assert_eq!(
                    status,
                    IssueStatus::derived(merge.is_some(), commit.is_some(), assignee.is_some())
                );
            });
        }
    }
}
