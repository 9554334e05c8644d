//! GitHub releases as a [`ReleaseSource`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use tracing::trace;

use crate::version::{ReleaseError, ReleaseSource};

/// Organization that owns the unit repositories
pub const DEFAULT_OWNER: &str = "giantswarm";

const API_BASE: &str = "https://api.github.com";
const PER_PAGE: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
}

/// Lists releases through the GitHub REST API
#[derive(Clone)]
pub struct GitHubReleaseSource {
    http: reqwest::Client,
    base_url: String,
    owner: String,
    token: Option<String>,
}

impl GitHubReleaseSource {
    /// Create a source for repositories of `owner`
    pub fn new(owner: impl Into<String>, token: Option<String>) -> Result<Self, ReleaseError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ReleaseError::other(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: API_BASE.to_string(),
            owner: owner.into(),
            token,
        })
    }

    /// Point the source at a different API endpoint (GitHub Enterprise)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn page_url(&self, repo: &str, page: usize) -> String {
        format!(
            "{}/repos/{}/{}/releases?per_page={}&page={}",
            self.base_url.trim_end_matches('/'),
            self.owner,
            repo,
            PER_PAGE,
            page
        )
    }

    async fn fetch_page(&self, repo: &str, page: usize) -> Result<Vec<GitHubRelease>, ReleaseError> {
        let mut request = self
            .http
            .get(self.page_url(repo, page))
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, "clustertest");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReleaseError::other(format!("request for {} releases failed: {}", repo, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReleaseError::status(
                status.as_u16(),
                format!("listing releases of {}/{}: {}", self.owner, repo, status),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| ReleaseError::other(format!("invalid releases response for {}: {}", repo, e)))
    }
}

#[async_trait]
impl ReleaseSource for GitHubReleaseSource {
    async fn list_stable_releases(&self, repo: &str) -> Result<Vec<String>, ReleaseError> {
        let mut tags = Vec::new();
        let mut page = 1;
        loop {
            let releases = self.fetch_page(repo, page).await?;
            let count = releases.len();
            trace!(repo = %repo, page, count, "Fetched releases page");
            tags.extend(stable_tags(releases));
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(tags)
    }
}

fn stable_tags(releases: Vec<GitHubRelease>) -> impl Iterator<Item = String> {
    releases
        .into_iter()
        .filter(|r| !r.draft && !r.prerelease && !r.tag_name.is_empty())
        .map(|r| r.tag_name)
}
