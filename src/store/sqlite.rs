//! SQLite-backed store.
//!
//! A single connection guarded by a mutex; every query hops onto the
//! blocking pool. Schema changes go through numbered migrations recorded in
//! the `schema_version` table. Timestamps are stored as RFC 3339 text and
//! statuses under their canonical names, so rows stay readable with plain
//! `sqlite3`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;
use tracing::info;

use super::{
    DerivedUpdate, NewSprint, NewSprintIssue, Sprint, SprintIssue, SprintStore, SprintUpdate,
    StoreError, UpsertOutcome,
};
use crate::status::IssueStatus;

const CURRENT_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS sprints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    goals TEXT NOT NULL DEFAULT '',
    project_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sprints_project ON sprints(project_id);

CREATE TABLE IF NOT EXISTS sprint_issues (
    sprint_id INTEGER NOT NULL,
    issue_id INTEGER NOT NULL,
    story_points INTEGER NOT NULL DEFAULT 0,
    priority TEXT NOT NULL DEFAULT '',
    title TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'To Do',
    assigned_to INTEGER,
    last_commit TEXT,
    last_merge TEXT,
    branch_name TEXT,
    merge_request_iid INTEGER,
    PRIMARY KEY (sprint_id, issue_id)
);
CREATE INDEX IF NOT EXISTS idx_sprint_issues_issue ON sprint_issues(issue_id);

CREATE TABLE IF NOT EXISTS user_roles (
    user_id INTEGER PRIMARY KEY,
    role TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const ISSUE_COLUMNS: &str = "sprint_id, issue_id, story_points, priority, title, description, \
                             status, assigned_to, last_commit, last_merge, branch_name, \
                             merge_request_iid";

const SPRINT_COLUMNS: &str =
    "id, title, start_date, end_date, goals, project_id, status, created_at, updated_at";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::storage("open", e))?;
        Self::init(conn)
    }

    /// Ephemeral database, used by tests.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::storage("open", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| StoreError::storage("open", e))?;

        // In-memory databases report "memory"; any file-backed database must
        // come back in WAL mode or readers would block writers.
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("open", e))?;
        if mode != "wal" && mode != "memory" {
            return Err(StoreError::storage(
                "open",
                format!("unexpected journal mode: {mode}"),
            ));
        }

        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StoreError::storage("migrate", e))?;

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .optional()
        .map_err(|e| StoreError::storage("migrate", e))?;
    let version = version.unwrap_or(0);

    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::storage(
            "migrate",
            format!("database schema version {version} is newer than this binary supports"),
        ));
    }

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)
            .map_err(|e| StoreError::storage("migrate", e))?;
    }

    if version == 0 {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("migrate", e))?;
    } else if version < CURRENT_SCHEMA_VERSION {
        conn.execute(
            "UPDATE schema_version SET version = ?1",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("migrate", e))?;
    }

    if version < CURRENT_SCHEMA_VERSION {
        info!(
            "Migrated database schema from version {} to {}",
            version, CURRENT_SCHEMA_VERSION
        );
    }
    Ok(())
}

fn lock<'a>(
    conn: &'a Arc<Mutex<Connection>>,
    operation: &'static str,
) -> Result<MutexGuard<'a, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::storage(operation, "connection mutex poisoned"))
}

fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StoreError::corruption("timestamp"))
}

struct IssueRow {
    sprint_id: i64,
    issue_id: i64,
    story_points: i64,
    priority: String,
    title: String,
    description: String,
    status: String,
    assigned_to: Option<i64>,
    last_commit: Option<String>,
    last_merge: Option<String>,
    branch_name: Option<String>,
    merge_request_iid: Option<i64>,
}

fn read_issue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IssueRow> {
    Ok(IssueRow {
        sprint_id: row.get(0)?,
        issue_id: row.get(1)?,
        story_points: row.get(2)?,
        priority: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        status: row.get(6)?,
        assigned_to: row.get(7)?,
        last_commit: row.get(8)?,
        last_merge: row.get(9)?,
        branch_name: row.get(10)?,
        merge_request_iid: row.get(11)?,
    })
}

fn issue_from_row(row: IssueRow) -> Result<SprintIssue, StoreError> {
    Ok(SprintIssue {
        sprint_id: row.sprint_id,
        issue_id: row.issue_id,
        story_points: u32::try_from(row.story_points)
            .map_err(|_| StoreError::corruption("story points"))?,
        priority: row.priority,
        title: row.title,
        description: row.description,
        status: row
            .status
            .parse()
            .map_err(|_| StoreError::corruption("status"))?,
        assigned_to: row.assigned_to,
        last_commit: row.last_commit.as_deref().map(decode_ts).transpose()?,
        last_merge: row.last_merge.as_deref().map(decode_ts).transpose()?,
        branch_name: row.branch_name,
        merge_request_iid: row.merge_request_iid,
    })
}

struct SprintRow {
    id: i64,
    title: String,
    start_date: String,
    end_date: String,
    goals: String,
    project_id: i64,
    status: String,
    created_at: String,
    updated_at: String,
}

fn read_sprint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SprintRow> {
    Ok(SprintRow {
        id: row.get(0)?,
        title: row.get(1)?,
        start_date: row.get(2)?,
        end_date: row.get(3)?,
        goals: row.get(4)?,
        project_id: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn sprint_from_row(row: SprintRow) -> Result<Sprint, StoreError> {
    Ok(Sprint {
        id: row.id,
        title: row.title,
        start_date: decode_ts(&row.start_date)?,
        end_date: decode_ts(&row.end_date)?,
        goals: row.goals,
        project_id: row.project_id,
        status: row
            .status
            .parse()
            .map_err(|_| StoreError::corruption("sprint status"))?,
        created_at: decode_ts(&row.created_at)?,
        updated_at: decode_ts(&row.updated_at)?,
    })
}

/// Write every mutable field of an issue row inside the given transaction.
fn write_issue(
    tx: &rusqlite::Transaction<'_>,
    issue: &SprintIssue,
    operation: &'static str,
) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE sprint_issues SET status = ?3, assigned_to = ?4, last_commit = ?5, \
         last_merge = ?6, branch_name = ?7, merge_request_iid = ?8 \
         WHERE sprint_id = ?1 AND issue_id = ?2",
        params![
            issue.sprint_id,
            issue.issue_id,
            issue.status.as_str(),
            issue.assigned_to,
            issue.last_commit.as_ref().map(encode_ts),
            issue.last_merge.as_ref().map(encode_ts),
            issue.branch_name,
            issue.merge_request_iid,
        ],
    )
    .map_err(|e| StoreError::storage(operation, e))?;
    Ok(())
}

fn fetch_issue(
    tx: &rusqlite::Transaction<'_>,
    sprint_id: i64,
    issue_id: i64,
    operation: &'static str,
) -> Result<SprintIssue, StoreError> {
    let row = tx
        .query_row(
            &format!(
                "SELECT {ISSUE_COLUMNS} FROM sprint_issues \
                 WHERE sprint_id = ?1 AND issue_id = ?2"
            ),
            params![sprint_id, issue_id],
            read_issue_row,
        )
        .optional()
        .map_err(|e| StoreError::storage(operation, e))?
        .ok_or_else(|| StoreError::not_found("sprint issue"))?;
    issue_from_row(row)
}

#[async_trait]
impl SprintStore for SqliteStore {
    async fn create_sprint(&self, new: NewSprint) -> Result<i64, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = lock(&conn, "create_sprint")?;
            let now = encode_ts(&Utc::now());
            conn.query_row(
                "INSERT INTO sprints (title, start_date, end_date, goals, project_id, status, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?6) \
                 RETURNING id",
                params![
                    new.title,
                    encode_ts(&new.start_date),
                    encode_ts(&new.end_date),
                    new.goals,
                    new.project_id,
                    now,
                ],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::storage("create_sprint", e))
        })
        .await
        .map_err(|e| StoreError::storage("create_sprint", e))?
    }

    async fn sprint(&self, sprint_id: i64) -> Result<Sprint, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = lock(&conn, "sprint")?;
            let row = conn
                .query_row(
                    &format!("SELECT {SPRINT_COLUMNS} FROM sprints WHERE id = ?1"),
                    params![sprint_id],
                    read_sprint_row,
                )
                .optional()
                .map_err(|e| StoreError::storage("sprint", e))?
                .ok_or_else(|| StoreError::not_found("sprint"))?;
            sprint_from_row(row)
        })
        .await
        .map_err(|e| StoreError::storage("sprint", e))?
    }

    async fn sprints_for_project(&self, project_id: i64) -> Result<Vec<Sprint>, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = lock(&conn, "sprints_for_project")?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SPRINT_COLUMNS} FROM sprints WHERE project_id = ?1 \
                     ORDER BY start_date DESC"
                ))
                .map_err(|e| StoreError::storage("sprints_for_project", e))?;
            let rows = stmt
                .query_map(params![project_id], read_sprint_row)
                .map_err(|e| StoreError::storage("sprints_for_project", e))?;
            let mut sprints = Vec::new();
            for row in rows {
                let row = row.map_err(|e| StoreError::storage("sprints_for_project", e))?;
                sprints.push(sprint_from_row(row)?);
            }
            Ok(sprints)
        })
        .await
        .map_err(|e| StoreError::storage("sprints_for_project", e))?
    }

    async fn update_sprint(&self, sprint_id: i64, update: SprintUpdate) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = lock(&conn, "update_sprint")?;
            let rows = conn
                .execute(
                    "UPDATE sprints SET title = ?2, start_date = ?3, end_date = ?4, \
                     goals = ?5, updated_at = ?6 WHERE id = ?1",
                    params![
                        sprint_id,
                        update.title,
                        encode_ts(&update.start_date),
                        encode_ts(&update.end_date),
                        update.goals,
                        encode_ts(&Utc::now()),
                    ],
                )
                .map_err(|e| StoreError::storage("update_sprint", e))?;
            if rows == 0 {
                return Err(StoreError::not_found("sprint"));
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("update_sprint", e))?
    }

    async fn complete_sprint(&self, sprint_id: i64) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut conn = lock(&conn, "complete_sprint")?;
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::storage("complete_sprint", e))?;
            let status: String = tx
                .query_row(
                    "SELECT status FROM sprints WHERE id = ?1",
                    params![sprint_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::storage("complete_sprint", e))?
                .ok_or_else(|| StoreError::not_found("sprint"))?;
            if status == "completed" {
                return Err(StoreError::AlreadyCompleted);
            }
            tx.execute(
                "UPDATE sprints SET status = 'completed', updated_at = ?2 WHERE id = ?1",
                params![sprint_id, encode_ts(&Utc::now())],
            )
            .map_err(|e| StoreError::storage("complete_sprint", e))?;
            tx.commit()
                .map_err(|e| StoreError::storage("complete_sprint", e))
        })
        .await
        .map_err(|e| StoreError::storage("complete_sprint", e))?
    }

    async fn delete_sprint(&self, sprint_id: i64) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut conn = lock(&conn, "delete_sprint")?;
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::storage("delete_sprint", e))?;
            tx.execute(
                "DELETE FROM sprint_issues WHERE sprint_id = ?1",
                params![sprint_id],
            )
            .map_err(|e| StoreError::storage("delete_sprint", e))?;
            let rows = tx
                .execute("DELETE FROM sprints WHERE id = ?1", params![sprint_id])
                .map_err(|e| StoreError::storage("delete_sprint", e))?;
            if rows == 0 {
                // Dropping the transaction rolls back the issue deletes.
                return Err(StoreError::not_found("sprint"));
            }
            tx.commit()
                .map_err(|e| StoreError::storage("delete_sprint", e))
        })
        .await
        .map_err(|e| StoreError::storage("delete_sprint", e))?
    }

    async fn add_issue(&self, new: NewSprintIssue) -> Result<UpsertOutcome, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = lock(&conn, "add_issue")?;
            let record = new.into_record();
            let rows = conn
                .execute(
                    &format!(
                        "INSERT INTO sprint_issues ({ISSUE_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                         ON CONFLICT(sprint_id, issue_id) DO NOTHING"
                    ),
                    params![
                        record.sprint_id,
                        record.issue_id,
                        record.story_points,
                        record.priority,
                        record.title,
                        record.description,
                        record.status.as_str(),
                        record.assigned_to,
                        record.last_commit.as_ref().map(encode_ts),
                        record.last_merge.as_ref().map(encode_ts),
                        record.branch_name,
                        record.merge_request_iid,
                    ],
                )
                .map_err(|e| StoreError::storage("add_issue", e))?;
            Ok(if rows == 0 {
                UpsertOutcome::AlreadyPresent
            } else {
                UpsertOutcome::Inserted
            })
        })
        .await
        .map_err(|e| StoreError::storage("add_issue", e))?
    }

    async fn sprint_issue(
        &self,
        sprint_id: i64,
        issue_id: i64,
    ) -> Result<SprintIssue, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = lock(&conn, "sprint_issue")?;
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {ISSUE_COLUMNS} FROM sprint_issues \
                         WHERE sprint_id = ?1 AND issue_id = ?2"
                    ),
                    params![sprint_id, issue_id],
                    read_issue_row,
                )
                .optional()
                .map_err(|e| StoreError::storage("sprint_issue", e))?
                .ok_or_else(|| StoreError::not_found("sprint issue"))?;
            issue_from_row(row)
        })
        .await
        .map_err(|e| StoreError::storage("sprint_issue", e))?
    }

    async fn sprint_issues(&self, sprint_id: i64) -> Result<Vec<SprintIssue>, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = lock(&conn, "sprint_issues")?;
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sprints WHERE id = ?1)",
                    params![sprint_id],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::storage("sprint_issues", e))?;
            if !exists {
                return Err(StoreError::not_found("sprint"));
            }
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ISSUE_COLUMNS} FROM sprint_issues WHERE sprint_id = ?1 \
                     ORDER BY issue_id"
                ))
                .map_err(|e| StoreError::storage("sprint_issues", e))?;
            let rows = stmt
                .query_map(params![sprint_id], read_issue_row)
                .map_err(|e| StoreError::storage("sprint_issues", e))?;
            let mut issues = Vec::new();
            for row in rows {
                let row = row.map_err(|e| StoreError::storage("sprint_issues", e))?;
                issues.push(issue_from_row(row)?);
            }
            Ok(issues)
        })
        .await
        .map_err(|e| StoreError::storage("sprint_issues", e))?
    }

    async fn apply_derived_update(
        &self,
        sprint_id: i64,
        issue_id: i64,
        update: DerivedUpdate,
    ) -> Result<IssueStatus, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut conn = lock(&conn, "apply_derived_update")?;
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::storage("apply_derived_update", e))?;
            let mut issue = fetch_issue(&tx, sprint_id, issue_id, "apply_derived_update")?;
            let status = update.apply(&mut issue);
            write_issue(&tx, &issue, "apply_derived_update")?;
            tx.commit()
                .map_err(|e| StoreError::storage("apply_derived_update", e))?;
            Ok(status)
        })
        .await
        .map_err(|e| StoreError::storage("apply_derived_update", e))?
    }

    async fn set_assignee(
        &self,
        sprint_id: i64,
        issue_id: i64,
        assignee: Option<i64>,
    ) -> Result<IssueStatus, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut conn = lock(&conn, "set_assignee")?;
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::storage("set_assignee", e))?;
            let mut issue = fetch_issue(&tx, sprint_id, issue_id, "set_assignee")?;
            issue.assigned_to = assignee;
            issue.status = IssueStatus::derived(
                issue.last_merge.is_some(),
                issue.last_commit.is_some(),
                issue.assigned_to.is_some(),
            );
            write_issue(&tx, &issue, "set_assignee")?;
            tx.commit()
                .map_err(|e| StoreError::storage("set_assignee", e))?;
            Ok(issue.status)
        })
        .await
        .map_err(|e| StoreError::storage("set_assignee", e))?
    }

    async fn set_status(
        &self,
        sprint_id: i64,
        issue_id: i64,
        status: IssueStatus,
    ) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = lock(&conn, "set_status")?;
            let rows = conn
                .execute(
                    "UPDATE sprint_issues SET status = ?3 \
                     WHERE sprint_id = ?1 AND issue_id = ?2",
                    params![sprint_id, issue_id, status.as_str()],
                )
                .map_err(|e| StoreError::storage("set_status", e))?;
            if rows == 0 {
                return Err(StoreError::not_found("sprint issue"));
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("set_status", e))?
    }

    async fn remove_issue(&self, sprint_id: i64, issue_id: i64) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = lock(&conn, "remove_issue")?;
            let rows = conn
                .execute(
                    "DELETE FROM sprint_issues WHERE sprint_id = ?1 AND issue_id = ?2",
                    params![sprint_id, issue_id],
                )
                .map_err(|e| StoreError::storage("remove_issue", e))?;
            if rows == 0 {
                return Err(StoreError::not_found("sprint issue"));
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("remove_issue", e))?
    }

    async fn find_sprint_for_issue(&self, issue_id: i64) -> Result<i64, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = lock(&conn, "find_sprint_for_issue")?;
            conn.query_row(
                "SELECT sprint_id FROM sprint_issues WHERE issue_id = ?1 \
                 ORDER BY sprint_id LIMIT 1",
                params![issue_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("find_sprint_for_issue", e))?
            .ok_or_else(|| StoreError::not_found("sprint issue"))
        })
        .await
        .map_err(|e| StoreError::storage("find_sprint_for_issue", e))?
    }

    async fn user_role(&self, user_id: i64) -> Result<Option<String>, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = lock(&conn, "user_role")?;
            conn.query_row(
                "SELECT role FROM user_roles WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("user_role", e))
        })
        .await
        .map_err(|e| StoreError::storage("user_role", e))?
    }

    async fn set_user_role(&self, user_id: i64, role: &str) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let role = role.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn, "set_user_role")?;
            conn.execute(
                "INSERT INTO user_roles (user_id, role, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(user_id) DO UPDATE SET role = excluded.role, \
                 updated_at = excluded.updated_at",
                params![user_id, role, encode_ts(&Utc::now())],
            )
            .map_err(|e| StoreError::storage("set_user_role", e))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("set_user_role", e))?
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::status::SprintStatus;

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

    async fn store_with_sprint() -> (SqliteStore, i64) {
        let store = SqliteStore::new_in_memory().unwrap();
        let sprint_id = store.create_sprint(new_sprint(7)).await.unwrap();
        (store, sprint_id)
    }

    #[tokio::test]
    async fn test_schema_version_is_recorded() {
        let store = SqliteStore::new_in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        let version: i64 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = SqliteStore::new_in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        migrate(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_sprint_round_trip() {
        let (store, sprint_id) = store_with_sprint().await;
        let sprint = store.sprint(sprint_id).await.unwrap();
        assert_eq!(sprint.title, "Iteration 1");
        assert_eq!(sprint.project_id, 7);
        assert_eq!(sprint.status, SprintStatus::Active);
        assert_eq!(sprint.start_date, ts(1_000));

        assert!(store.sprint(sprint_id + 1).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_sprint() {
        let (store, sprint_id) = store_with_sprint().await;
        store
            .update_sprint(
                sprint_id,
                SprintUpdate {
                    title: "Iteration 1b".to_string(),
                    start_date: ts(1_500),
                    end_date: ts(2_500),
                    goals: "revised".to_string(),
                },
            )
            .await
            .unwrap();
        let sprint = store.sprint(sprint_id).await.unwrap();
        assert_eq!(sprint.title, "Iteration 1b");
        assert_eq!(sprint.start_date, ts(1_500));

        assert!(store
            .update_sprint(
                sprint_id + 1,
                SprintUpdate {
                    title: String::new(),
                    start_date: ts(0),
                    end_date: ts(0),
                    goals: String::new(),
                },
            )
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_complete_sprint_is_one_way() {
        let (store, sprint_id) = store_with_sprint().await;
        store.complete_sprint(sprint_id).await.unwrap();
        assert_eq!(
            store.sprint(sprint_id).await.unwrap().status,
            SprintStatus::Completed
        );
        assert!(matches!(
            store.complete_sprint(sprint_id).await.unwrap_err(),
            StoreError::AlreadyCompleted
        ));
        assert!(store
            .complete_sprint(sprint_id + 1)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_add_issue_is_idempotent() {
        let (store, sprint_id) = store_with_sprint().await;
        assert_eq!(
            store.add_issue(new_issue(sprint_id, 10)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        store.set_assignee(sprint_id, 10, Some(42)).await.unwrap();

        assert_eq!(
            store.add_issue(new_issue(sprint_id, 10)).await.unwrap(),
            UpsertOutcome::AlreadyPresent
        );
        let issue = store.sprint_issue(sprint_id, 10).await.unwrap();
        assert_eq!(issue.assigned_to, Some(42));
        assert_eq!(store.sprint_issues(sprint_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_stored_under_canonical_name() {
        let (store, sprint_id) = store_with_sprint().await;
        store.add_issue(new_issue(sprint_id, 10)).await.unwrap();
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

        let conn = store.conn.lock().unwrap();
        let raw: String = conn
            .query_row(
                "SELECT status FROM sprint_issues WHERE sprint_id = ?1 AND issue_id = ?2",
                params![sprint_id, 10],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(raw, "In Review");
    }

    #[tokio::test]
    async fn test_apply_derived_update_coalesces() {
        let (store, sprint_id) = store_with_sprint().await;
        store.add_issue(new_issue(sprint_id, 10)).await.unwrap();

        store
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
        let status = store
            .apply_derived_update(
                sprint_id,
                10,
                DerivedUpdate {
                    last_merge: Some(ts(200)),
                    merge_request_iid: Some(3),
                    branch_name: Some("feature/retry".to_string()),
                    ..DerivedUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(status, IssueStatus::Done);

        let issue = store.sprint_issue(sprint_id, 10).await.unwrap();
        assert_eq!(issue.last_commit, Some(ts(100)));
        assert_eq!(issue.last_merge, Some(ts(200)));
        assert_eq!(issue.branch_name.as_deref(), Some("feature/retry"));
        assert_eq!(issue.merge_request_iid, Some(3));

        assert!(store
            .apply_derived_update(sprint_id, 11, DerivedUpdate::default())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_set_assignee_rederives_from_stored_activity() {
        let (store, sprint_id) = store_with_sprint().await;
        store.add_issue(new_issue(sprint_id, 10)).await.unwrap();

        assert_eq!(
            store.set_assignee(sprint_id, 10, Some(5)).await.unwrap(),
            IssueStatus::InProgress
        );

        store
            .apply_derived_update(
                sprint_id,
                10,
                DerivedUpdate {
                    last_merge: Some(ts(200)),
                    ..DerivedUpdate::default()
                },
            )
            .await
            .unwrap();
        // Clearing the assignee cannot demote a merged issue.
        assert_eq!(
            store.set_assignee(sprint_id, 10, None).await.unwrap(),
            IssueStatus::Done
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

        assert!(store
            .set_status(sprint_id, 11, IssueStatus::Done)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_sprint_issues_of_missing_sprint_is_not_found() {
        let (store, sprint_id) = store_with_sprint().await;
        assert!(store.sprint_issues(sprint_id).await.unwrap().is_empty());
        assert!(store
            .sprint_issues(sprint_id + 1)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_delete_sprint_cascades() {
        let (store, sprint_id) = store_with_sprint().await;
        store.add_issue(new_issue(sprint_id, 10)).await.unwrap();
        store.add_issue(new_issue(sprint_id, 11)).await.unwrap();

        store.delete_sprint(sprint_id).await.unwrap();
        assert!(store.sprint(sprint_id).await.unwrap_err().is_not_found());
        assert!(store
            .find_sprint_for_issue(10)
            .await
            .unwrap_err()
            .is_not_found());

        assert!(store
            .delete_sprint(sprint_id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_find_sprint_for_issue_prefers_lowest_sprint() {
        let store = SqliteStore::new_in_memory().unwrap();
        let first = store.create_sprint(new_sprint(7)).await.unwrap();
        let second = store.create_sprint(new_sprint(7)).await.unwrap();
        store.add_issue(new_issue(second, 10)).await.unwrap();
        store.add_issue(new_issue(first, 10)).await.unwrap();
        assert_eq!(store.find_sprint_for_issue(10).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_sprints_for_project_newest_first() {
        let store = SqliteStore::new_in_memory().unwrap();
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
    async fn test_user_roles_upsert() {
        let store = SqliteStore::new_in_memory().unwrap();
        assert_eq!(store.user_role(1).await.unwrap(), None);
        store.set_user_role(1, "developer").await.unwrap();
        store.set_user_role(1, "project_manager").await.unwrap();
        assert_eq!(
            store.user_role(1).await.unwrap().as_deref(),
            Some("project_manager")
        );
    }
}
