use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

use crate::gitlab::OAuthSettings;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Base URL of the GitLab instance, without a trailing slash.
    pub gitlab_base_url: String,
    /// Branch recorded for commit activity arriving via push events.
    pub default_branch: String,
    /// Shared secret expected in `X-Gitlab-Token` on inbound webhooks.
    /// If not set, webhook deliveries are accepted unauthenticated.
    pub webhook_token: Option<String>,
    /// OAuth application settings; `None` until all three variables are set,
    /// in which case the authorize/callback endpoints refuse to run.
    pub oauth: Option<OAuthSettings>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "4000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let gitlab_base_url = env::var("GITLAB_BASE_URL")
            .unwrap_or_else(|_| "https://gitlab.com".to_string())
            .trim_end_matches('/')
            .to_string();

        let default_branch = env::var("DEFAULT_BRANCH").unwrap_or_else(|_| "main".to_string());

        let webhook_token = non_empty(env::var("GITLAB_WEBHOOK_TOKEN").ok());

        let oauth = oauth_settings(
            env::var("GITLAB_CLIENT_ID").ok(),
            env::var("GITLAB_CLIENT_SECRET").ok(),
            env::var("GITLAB_REDIRECT_URI").ok(),
        );

        Ok(Config {
            port,
            state_dir,
            gitlab_base_url,
            default_branch,
            webhook_token,
            oauth,
        })
    }
}

/// Treat a missing, empty, or whitespace-only value as unset. An empty
/// webhook secret must not pass verification against an empty header.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// OAuth is configured only when all three values are present and
/// non-empty; a partial set behaves as no configuration at all.
fn oauth_settings(
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
) -> Option<OAuthSettings> {
    Some(OAuthSettings {
        client_id: non_empty(client_id)?,
        client_secret: non_empty(client_secret)?,
        redirect_uri: non_empty(redirect_uri)?,
    })
}
