//! Client for a GitLab-style REST API.
//!
//! Every call runs with the caller's bearer credential; nothing is cached or
//! persisted here. The reconciliation engine only needs the narrow
//! [`IssueTracker`] seam; the remaining methods are pass-through plumbing
//! for the HTTP surface and keep their payloads as raw JSON.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("missing or rejected platform credential")]
    Auth,
    #[error("platform returned {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("platform request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("OAuth is not configured for this deployment")]
    OAuthUnconfigured,
}

/// Live state of a tracker issue, reduced to what reconciliation reads.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerIssue {
    pub iid: i64,
    #[serde(default)]
    pub state: TrackerIssueState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum TrackerIssueState {
    Opened,
    Closed,
    /// Any state string this build does not know. Treated as inert.
    Unknown,
}

impl Default for TrackerIssueState {
    fn default() -> Self {
        TrackerIssueState::Unknown
    }
}

impl From<String> for TrackerIssueState {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "opened" | "open" => TrackerIssueState::Opened,
            "closed" => TrackerIssueState::Closed,
            _ => TrackerIssueState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerUser {
    pub id: i64,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Reply of the OAuth code-for-token exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrackerIssue {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewTrackerProject {
    pub name: String,
    pub description: Option<String>,
    pub visibility: Option<String>,
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// The slice of the tracker the reconciliation engine depends on.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn issue(
        &self,
        token: &str,
        project_id: i64,
        issue_iid: i64,
    ) -> Result<TrackerIssue, TrackerError>;
}

pub struct GitLabClient {
    http: Client,
    base_url: String,
    oauth: Option<OAuthSettings>,
}

impl GitLabClient {
    pub fn new(
        base_url: impl Into<String>,
        oauth: Option<OAuthSettings>,
    ) -> Result<Self, TrackerError> {
        let http = Client::builder()
            .user_agent(concat!("sprintsync/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            oauth,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v4{}", self.base_url, path)
    }

    /// The platform's authorize page for the configured OAuth application.
    pub fn authorize_url(&self) -> Option<String> {
        let oauth = self.oauth.as_ref()?;
        let mut url = reqwest::Url::parse(&format!("{}/oauth/authorize", self.base_url)).ok()?;
        url.query_pairs_mut()
            .append_pair("client_id", &oauth.client_id)
            .append_pair("redirect_uri", &oauth.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", "api read_api");
        Some(url.to_string())
    }

    /// Exchange an OAuth authorization code for an access token.
    pub async fn exchange_oauth_code(&self, code: &str) -> Result<OAuthToken, TrackerError> {
        let oauth = self.oauth.as_ref().ok_or(TrackerError::OAuthUnconfigured)?;
        let response = self
            .http
            .post(format!("{}/oauth/token", self.base_url))
            .form(&[
                ("client_id", oauth.client_id.as_str()),
                ("client_secret", oauth.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", oauth.redirect_uri.as_str()),
            ])
            .send()
            .await?;
        let response = check(response, "exchange oauth code").await?;
        info!("Exchanged OAuth code for an access token");
        Ok(response.json().await?)
    }

    pub async fn current_user(&self, token: &str) -> Result<TrackerUser, TrackerError> {
        let response = self.get(token, "/user".to_string()).await?;
        Ok(response.json().await?)
    }

    /// Raw issue payload, for responses that attach tracker data verbatim.
    pub async fn issue_raw(
        &self,
        token: &str,
        project_id: i64,
        issue_iid: i64,
    ) -> Result<Value, TrackerError> {
        let response = self
            .get(token, format!("/projects/{project_id}/issues/{issue_iid}"))
            .await?;
        Ok(response.json().await?)
    }

    pub async fn project_issues(
        &self,
        token: &str,
        project_id: i64,
    ) -> Result<Vec<Value>, TrackerError> {
        let response = self
            .get(token, format!("/projects/{project_id}/issues?per_page=100"))
            .await?;
        Ok(response.json().await?)
    }

    pub async fn create_issue(
        &self,
        token: &str,
        project_id: i64,
        new: &NewTrackerIssue,
    ) -> Result<Value, TrackerError> {
        let url = self.api_url(&format!("/projects/{project_id}/issues"));
        let response = auth(self.http.post(url), token)?.json(new).send().await?;
        let response = check(response, "create issue").await?;
        info!("Created issue in project {}: {}", project_id, new.title);
        Ok(response.json().await?)
    }

    pub async fn delete_issue(
        &self,
        token: &str,
        project_id: i64,
        issue_iid: i64,
    ) -> Result<(), TrackerError> {
        let url = self.api_url(&format!("/projects/{project_id}/issues/{issue_iid}"));
        let response = auth(self.http.delete(url), token)?.send().await?;
        check(response, "delete issue").await?;
        info!("Deleted issue #{} from project {}", issue_iid, project_id);
        Ok(())
    }

    pub async fn projects(&self, token: &str) -> Result<Vec<Value>, TrackerError> {
        let response = self
            .get(token, "/projects?membership=true&per_page=100".to_string())
            .await?;
        Ok(response.json().await?)
    }

    pub async fn project(&self, token: &str, project_id: i64) -> Result<Value, TrackerError> {
        let response = self.get(token, format!("/projects/{project_id}")).await?;
        Ok(response.json().await?)
    }

    pub async fn create_project(
        &self,
        token: &str,
        new: &NewTrackerProject,
    ) -> Result<Value, TrackerError> {
        let body = serde_json::json!({
            "name": new.name,
            "path": project_path_slug(&new.name),
            "description": new.description.as_deref().unwrap_or(""),
            "visibility": new.visibility.as_deref().unwrap_or("private"),
            "default_branch": new.default_branch.as_deref().unwrap_or("main"),
            "initialize_with_readme": true,
        });
        let url = self.api_url("/projects");
        let response = auth(self.http.post(url), token)?.json(&body).send().await?;
        let response = check(response, "create project").await?;
        info!("Created project: {}", new.name);
        Ok(response.json().await?)
    }

    pub async fn update_project(
        &self,
        token: &str,
        project_id: i64,
        description: &str,
    ) -> Result<Value, TrackerError> {
        let url = self.api_url(&format!("/projects/{project_id}"));
        let response = auth(self.http.put(url), token)?
            .json(&serde_json::json!({ "description": description }))
            .send()
            .await?;
        let response = check(response, "update project").await?;
        info!("Updated project {}", project_id);
        Ok(response.json().await?)
    }

    pub async fn delete_project(&self, token: &str, project_id: i64) -> Result<(), TrackerError> {
        let url = self.api_url(&format!("/projects/{project_id}"));
        let response = auth(self.http.delete(url), token)?.send().await?;
        check(response, "delete project").await?;
        info!("Deleted project {}", project_id);
        Ok(())
    }

    pub async fn users(&self, token: &str) -> Result<Vec<Value>, TrackerError> {
        let response = self
            .get(token, "/users?active=true&per_page=100".to_string())
            .await?;
        Ok(response.json().await?)
    }

    async fn get(&self, token: &str, path: String) -> Result<Response, TrackerError> {
        let url = self.api_url(&path);
        let response = auth(self.http.get(url), token)?.send().await?;
        check(response, "tracker request").await
    }
}

#[async_trait]
impl IssueTracker for GitLabClient {
    async fn issue(
        &self,
        token: &str,
        project_id: i64,
        issue_iid: i64,
    ) -> Result<TrackerIssue, TrackerError> {
        let response = self
            .get(token, format!("/projects/{project_id}/issues/{issue_iid}"))
            .await?;
        Ok(response.json().await?)
    }
}

/// Attach the caller's credential, tolerating an `Authorization`-style
/// `Bearer ` prefix in the supplied value.
fn auth(
    request: reqwest::RequestBuilder,
    token: &str,
) -> Result<reqwest::RequestBuilder, TrackerError> {
    let token = normalize_token(token)?;
    Ok(request.bearer_auth(token))
}

fn normalize_token(token: &str) -> Result<&str, TrackerError> {
    let token = token.trim();
    let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
    if token.is_empty() {
        return Err(TrackerError::Auth);
    }
    Ok(token)
}

async fn check(response: Response, operation: &'static str) -> Result<Response, TrackerError> {
    if response.status() == StatusCode::UNAUTHORIZED {
        error!("GitLab rejected the supplied credential ({})", operation);
        return Err(TrackerError::Auth);
    }
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unable to read response body".to_string());
        error!("GitLab API error ({}): {} - {}", operation, status, body);
        return Err(TrackerError::Remote { status, body });
    }
    Ok(response)
}

/// Build a URL-safe repository path from a human project name. Cyrillic
/// names are transliterated, everything else collapses to dashes, and a
/// timestamp suffix keeps paths unique across same-named projects.
fn project_path_slug(name: &str) -> String {
    let path = sanitize_path(&transliterate(name));
    let path = if path.is_empty() { "project" } else { &path };
    format!("{}-{}", path, Utc::now().timestamp())
}

fn transliterate(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        match c {
            'а' => out.push('a'),
            'б' => out.push('b'),
            'в' => out.push('v'),
            'г' => out.push('g'),
            'д' => out.push('d'),
            'е' | 'э' => out.push('e'),
            'ё' => out.push_str("yo"),
            'ж' => out.push_str("zh"),
            'з' => out.push('z'),
            'и' => out.push('i'),
            'й' | 'ы' => out.push('y'),
            'к' => out.push('k'),
            'л' => out.push('l'),
            'м' => out.push('m'),
            'н' => out.push('n'),
            'о' => out.push('o'),
            'п' => out.push('p'),
            'р' => out.push('r'),
            'с' => out.push('s'),
            'т' => out.push('t'),
            'у' => out.push('u'),
            'ф' => out.push('f'),
            'х' => out.push('h'),
            'ц' => out.push_str("ts"),
            'ч' => out.push_str("ch"),
            'ш' => out.push_str("sh"),
            'щ' => out.push_str("sch"),
            'ъ' | 'ь' => {}
            'ю' => out.push_str("yu"),
            'я' => out.push_str("ya"),
            other => out.push(other),
        }
    }
    out
}

fn sanitize_path(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
            pending_dash = false;
        } else {
            pending_dash = true;
        }
    }
    out
}
