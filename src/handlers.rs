//! HTTP handlers and the API router.
//!
//! Routes that reach the tracker require an `Authorization: Bearer` header;
//! the credential is forwarded per call and never stored. Store-only sprint
//! routes take no credential. Project/issue/user routes pass raw tracker
//! JSON through, and the sprint-issue listing runs a reconciliation pass
//! first.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Redirect;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::gitlab::{NewTrackerIssue, NewTrackerProject};
use crate::status::IssueStatus;
use crate::store::{NewSprint, NewSprintIssue, Sprint, SprintIssue, SprintUpdate, UpsertOutcome};
use crate::webhook::gitlab_webhook_handler;
use crate::AppState;

const VALID_ROLES: [&str; 3] = ["administrator", "project_manager", "developer"];
const DEFAULT_ROLE: &str = "developer";

pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/webhooks/gitlab", post(gitlab_webhook_handler))
        .route("/api/oauth/authorize", get(oauth_authorize))
        .route("/api/oauth/callback", get(oauth_callback))
        .route("/api/sprints", post(create_sprint))
        .route(
            "/api/sprints/{sprint_id}",
            get(get_sprint).put(update_sprint).delete(delete_sprint),
        )
        .route("/api/sprints/{sprint_id}/complete", post(complete_sprint))
        .route("/api/sprints/{sprint_id}/issues", post(add_sprint_issue))
        .route(
            "/api/sprints/{sprint_id}/issues/assignee",
            put(set_issue_assignee),
        )
        .route(
            "/api/sprints/{sprint_id}/issues/{issue_id}",
            delete(remove_sprint_issue),
        )
        .route(
            "/api/sprints/{sprint_id}/issues/{issue_id}/status",
            put(set_issue_status),
        )
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{project_id}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route(
            "/api/projects/{project_id}/sprints",
            get(list_project_sprints),
        )
        .route(
            "/api/projects/{project_id}/sprints/{sprint_id}/issues",
            get(list_sprint_issues),
        )
        .route(
            "/api/projects/{project_id}/sprints/{sprint_id}/issues/{issue_id}",
            get(get_sprint_issue),
        )
        .route(
            "/api/projects/{project_id}/issues",
            get(list_project_issues).post(create_project_issue),
        )
        .route(
            "/api/projects/{project_id}/issues/{issue_iid}",
            delete(delete_project_issue),
        )
        .route("/api/users", get(list_users))
        .route("/api/users/{user_id}/role", put(update_user_role))
}

/// The caller's tracker credential, with or without the `Bearer ` prefix.
fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    if token.is_empty() {
        return Err(ApiError::Unauthorized);
    }
    Ok(token)
}

/// Tracker user ids are positive; zero arrives from clients that cannot
/// express null and means "unassigned".
fn normalize_assignee(raw: Option<i64>) -> Option<i64> {
    raw.filter(|id| *id > 0)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// =============================================================================
// OAuth
// =============================================================================

async fn oauth_authorize(State(state): State<Arc<AppState>>) -> ApiResult<Redirect> {
    let url = state
        .gitlab
        .authorize_url()
        .ok_or(ApiError::OAuthUnconfigured)?;
    Ok(Redirect::temporary(&url))
}

#[derive(Debug, Deserialize)]
struct OAuthCallbackQuery {
    #[serde(default)]
    code: Option<String>,
}

async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OAuthCallbackQuery>,
) -> ApiResult<Json<Value>> {
    let code = query
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| ApiError::validation("authorization code is missing"))?;
    let token = state.gitlab.exchange_oauth_code(&code).await?;
    let user = state.gitlab.current_user(&token.access_token).await?;
    info!("Signed in user {} ({})", user.username, user.id);
    Ok(Json(json!({
        "token": token.access_token,
        "user": user,
        "redirect_url": "/home",
    })))
}

// =============================================================================
// Sprints
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSprintRequest {
    pub title: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub goals: String,
    pub project_id: i64,
}

async fn create_sprint(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSprintRequest>,
) -> ApiResult<(StatusCode, Json<Sprint>)> {
    if req.title.trim().is_empty() {
        return Err(ApiError::validation("title is required"));
    }
    let id = state
        .store
        .create_sprint(NewSprint {
            title: req.title,
            start_date: req.start_date,
            end_date: req.end_date,
            goals: req.goals,
            project_id: req.project_id,
        })
        .await?;
    let sprint = state.store.sprint(id).await?;
    info!("Created sprint {} for project {}", id, sprint.project_id);
    Ok((StatusCode::CREATED, Json(sprint)))
}

async fn get_sprint(
    State(state): State<Arc<AppState>>,
    Path(sprint_id): Path<i64>,
) -> ApiResult<Json<Sprint>> {
    Ok(Json(state.store.sprint(sprint_id).await?))
}

async fn list_project_sprints(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
) -> ApiResult<Json<Vec<Sprint>>> {
    Ok(Json(state.store.sprints_for_project(project_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSprintRequest {
    pub title: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub goals: String,
}

async fn update_sprint(
    State(state): State<Arc<AppState>>,
    Path(sprint_id): Path<i64>,
    Json(req): Json<UpdateSprintRequest>,
) -> ApiResult<Json<Sprint>> {
    if req.title.trim().is_empty() {
        return Err(ApiError::validation("title is required"));
    }
    state
        .store
        .update_sprint(
            sprint_id,
            SprintUpdate {
                title: req.title,
                start_date: req.start_date,
                end_date: req.end_date,
                goals: req.goals,
            },
        )
        .await?;
    Ok(Json(state.store.sprint(sprint_id).await?))
}

async fn complete_sprint(
    State(state): State<Arc<AppState>>,
    Path(sprint_id): Path<i64>,
) -> ApiResult<Json<Sprint>> {
    state.store.complete_sprint(sprint_id).await?;
    info!("Completed sprint {}", sprint_id);
    Ok(Json(state.store.sprint(sprint_id).await?))
}

async fn delete_sprint(
    State(state): State<Arc<AppState>>,
    Path(sprint_id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.store.delete_sprint(sprint_id).await?;
    info!("Deleted sprint {} and its issues", sprint_id);
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Sprint issues
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct AddIssueRequest {
    pub issue_id: i64,
    #[serde(default)]
    pub story_points: u32,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

async fn add_sprint_issue(
    State(state): State<Arc<AppState>>,
    Path(sprint_id): Path<i64>,
    Json(req): Json<AddIssueRequest>,
) -> ApiResult<(StatusCode, Json<SprintIssue>)> {
    if req.issue_id <= 0 {
        return Err(ApiError::validation("issue id is required"));
    }
    // The store's upsert does not know about sprints; surface a missing
    // sprint as 404 before touching the issue table.
    state.store.sprint(sprint_id).await?;
    let outcome = state
        .store
        .add_issue(NewSprintIssue {
            sprint_id,
            issue_id: req.issue_id,
            story_points: req.story_points,
            priority: req.priority,
            title: req.title,
            description: req.description,
        })
        .await?;
    let issue = state.store.sprint_issue(sprint_id, req.issue_id).await?;
    match outcome {
        UpsertOutcome::Inserted => {
            info!("Enrolled issue #{} in sprint {}", issue.issue_id, sprint_id);
            Ok((StatusCode::CREATED, Json(issue)))
        }
        UpsertOutcome::AlreadyPresent => Ok((StatusCode::OK, Json(issue))),
    }
}

async fn list_sprint_issues(
    State(state): State<Arc<AppState>>,
    Path((_project_id, sprint_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<SprintIssue>>> {
    let token = bearer_token(&headers)?;
    let issues = state.engine.sync_sprint_issues(token, sprint_id).await?;
    Ok(Json(issues))
}

async fn get_sprint_issue(
    State(state): State<Arc<AppState>>,
    Path((project_id, sprint_id, issue_id)): Path<(i64, i64, i64)>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let token = bearer_token(&headers)?;
    let issue = state.store.sprint_issue(sprint_id, issue_id).await?;
    // The stored record is the payload; live tracker data is best-effort
    // garnish and a fetch failure must not hide the record.
    let gitlab_issue = match state.gitlab.issue_raw(token, project_id, issue_id).await {
        Ok(value) => value,
        Err(e) => {
            warn!(
                "Failed to fetch issue #{} from project {}: {}",
                issue_id, project_id, e
            );
            Value::Null
        }
    };
    Ok(Json(json!({
        "sprint_issue": issue,
        "gitlab_issue": gitlab_issue,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AssigneeRequest {
    pub issue_id: i64,
    #[serde(default)]
    pub assigned_to: Option<i64>,
}

async fn set_issue_assignee(
    State(state): State<Arc<AppState>>,
    Path(sprint_id): Path<i64>,
    Json(req): Json<AssigneeRequest>,
) -> ApiResult<Json<SprintIssue>> {
    if req.issue_id <= 0 {
        return Err(ApiError::validation("issue id is required"));
    }
    let assignee = normalize_assignee(req.assigned_to);
    let status = state
        .store
        .set_assignee(sprint_id, req.issue_id, assignee)
        .await?;
    info!(
        "Changed assignee of issue #{} in sprint {} to {:?} (status: {})",
        req.issue_id, sprint_id, assignee, status
    );
    Ok(Json(state.store.sprint_issue(sprint_id, req.issue_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

async fn set_issue_status(
    State(state): State<Arc<AppState>>,
    Path((sprint_id, issue_id)): Path<(i64, i64)>,
    Json(req): Json<StatusRequest>,
) -> ApiResult<Json<SprintIssue>> {
    let status: IssueStatus = req
        .status
        .parse()
        .map_err(|e: crate::status::UnknownStatus| ApiError::validation(e.to_string()))?;
    state.store.set_status(sprint_id, issue_id, status).await?;
    info!(
        "Set status of issue #{} in sprint {} to {}",
        issue_id, sprint_id, status
    );
    Ok(Json(state.store.sprint_issue(sprint_id, issue_id).await?))
}

async fn remove_sprint_issue(
    State(state): State<Arc<AppState>>,
    Path((sprint_id, issue_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    state.store.remove_issue(sprint_id, issue_id).await?;
    info!("Removed issue #{} from sprint {}", issue_id, sprint_id);
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Tracker pass-through
// =============================================================================

async fn list_projects(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Value>>> {
    let token = bearer_token(&headers)?;
    Ok(Json(state.gitlab.projects(token).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Option<String>,
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let token = bearer_token(&headers)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    let new = NewTrackerProject {
        name: req.name,
        description: req.description,
        visibility: req.visibility,
        default_branch: Some(state.config.default_branch.clone()),
    };
    let project = state.gitlab.create_project(token, &new).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let token = bearer_token(&headers)?;
    Ok(Json(state.gitlab.project(token, project_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectRequest {
    #[serde(default)]
    pub description: String,
}

async fn update_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateProjectRequest>,
) -> ApiResult<Json<Value>> {
    let token = bearer_token(&headers)?;
    Ok(Json(
        state
            .gitlab
            .update_project(token, project_id, &req.description)
            .await?,
    ))
}

async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let token = bearer_token(&headers)?;
    state.gitlab.delete_project(token, project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_project_issues(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Value>>> {
    let token = bearer_token(&headers)?;
    Ok(Json(state.gitlab.project_issues(token, project_id).await?))
}

async fn create_project_issue(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<NewTrackerIssue>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let token = bearer_token(&headers)?;
    if req.title.trim().is_empty() {
        return Err(ApiError::validation("title is required"));
    }
    let issue = state.gitlab.create_issue(token, project_id, &req).await?;
    Ok((StatusCode::CREATED, Json(issue)))
}

async fn delete_project_issue(
    State(state): State<Arc<AppState>>,
    Path((project_id, issue_iid)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let token = bearer_token(&headers)?;
    state.gitlab.delete_issue(token, project_id, issue_iid).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Users
// =============================================================================

/// Platform users, each annotated with the locally stored role. Users with
/// no stored role are developers.
async fn list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Value>>> {
    let token = bearer_token(&headers)?;
    let mut users = state.gitlab.users(token).await?;
    for user in &mut users {
        let role = match user.get("id").and_then(Value::as_i64) {
            Some(id) => state
                .store
                .user_role(id)
                .await?
                .unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            None => DEFAULT_ROLE.to_string(),
        };
        if let Value::Object(map) = user {
            map.insert("role".to_string(), Value::String(role));
        }
    }
    Ok(Json(users))
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: String,
}

async fn update_user_role(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Json(req): Json<RoleRequest>,
) -> ApiResult<Json<Value>> {
    if !VALID_ROLES.contains(&req.role.as_str()) {
        return Err(ApiError::validation(format!(
            "invalid role {:?}, expected one of {:?}",
            req.role, VALID_ROLES
        )));
    }
    state.store.set_user_role(user_id, &req.role).await?;
    info!("Updated role of user {} to {}", user_id, req.role);
    Ok(Json(json!({ "user_id": user_id, "role": req.role })))
}
