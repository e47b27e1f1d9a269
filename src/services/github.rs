use crate::constants::github::{DEFAULT_API_URL, USER_AGENT};
use crate::constants::timeouts::GITHUB_API_MS;
use crate::errors::PersonaError;
use crate::services::logger::Logger;
use crate::utils::redact::redact_text;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

fn resolve_api_url() -> String {
    std::env::var("GITPERSONA_GITHUB_API_URL")
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string())
}

/// Resolves which GitHub user a token authenticates as.
#[derive(Clone)]
pub struct GitHubClient {
    logger: Logger,
    http: reqwest::Client,
    api_url: String,
}

impl GitHubClient {
    pub fn new(logger: Logger) -> Result<Self, PersonaError> {
        Self::with_api_url(logger, &resolve_api_url())
    }

    pub fn with_api_url(logger: Logger, api_url: &str) -> Result<Self, PersonaError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(GITHUB_API_MS))
            .build()
            .map_err(|err| PersonaError::internal(format!("Failed to build HTTP client: {}", err)))?;
        Ok(Self {
            logger: logger.child("github"),
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn resolve_token_owner(&self, token: &str) -> Result<String, PersonaError> {
        let url = format!("{}/user", self.api_url);
        self.logger.debug("resolve_token_owner", None);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token.trim())
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|err| {
                let detail = redact_text(&err.to_string(), &[token.trim()]);
                if err.is_timeout() {
                    PersonaError::timeout(format!("GitHub API request timed out: {}", detail))
                } else {
                    PersonaError::execution(format!("GitHub API request failed: {}", detail))
                }
            })?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PersonaError::precondition("GitHub rejected the token")
                .with_hint("The token is expired, revoked, or mistyped."));
        }
        if !status.is_success() {
            return Err(PersonaError::execution(format!(
                "GitHub API returned HTTP {}",
                status.as_u16()
            )));
        }
        let user: UserResponse = response.json().await.map_err(|err| {
            PersonaError::execution(format!("Unexpected GitHub API response: {}", err))
        })?;
        Ok(user.login)
    }
}
