//! External judge client contracts + Codeforces and fixture-backed implementations.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use cftrack_core::{FetchedProfileData, Profile, RatingChange, Submission};
use cftrack_storage::{FetchError, HttpClientConfig, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "cftrack-adapters";

pub const CODEFORCES_API_BASE: &str = "https://codeforces.com/api";

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The judge is throttling or blocking us. Retry later, never treat as permanent.
    #[error("judge is temporarily blocking requests: {0}")]
    Blocked(String),
    #[error("handle not found: {0}")]
    NotFound(String),
    /// Network-level failure or exhausted server-error retries; safe to retry.
    #[error("transient judge failure: {0}")]
    Transient(String),
    /// The judge refused the request for a reason other than a missing handle.
    #[error("judge rejected request: {0}")]
    Rejected(String),
    #[error("malformed judge response: {0}")]
    Malformed(String),
}

/// Read-only view of one handle on the remote judge.
#[async_trait]
pub trait JudgeClient: Send + Sync {
    async fn fetch_profile(&self, handle: &str) -> Result<Profile, UpstreamError>;

    /// Rating history in chronological order.
    async fn fetch_rating_history(&self, handle: &str) -> Result<Vec<RatingChange>, UpstreamError>;

    /// Up to `limit` most recent submissions, newest first.
    async fn fetch_submissions(
        &self,
        handle: &str,
        limit: usize,
    ) -> Result<Vec<Submission>, UpstreamError>;

    /// Fetches the three collections one after another so call spacing is respected.
    async fn fetch_all(
        &self,
        handle: &str,
        submission_limit: usize,
    ) -> Result<FetchedProfileData, UpstreamError> {
        let profile = self.fetch_profile(handle).await?;
        let rating_history = self.fetch_rating_history(handle).await?;
        let submissions = self.fetch_submissions(handle, submission_limit).await?;
        Ok(FetchedProfileData {
            profile,
            rating_history,
            submissions,
        })
    }
}

/// `{status, comment, result}` wrapper around every Codeforces API payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CfEnvelope<T> {
    pub status: String,
    #[serde(default)]
    pub comment: Option<String>,
    pub result: Option<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CfUser {
    pub handle: String,
    #[serde(default)]
    pub rating: Option<i32>,
    #[serde(default)]
    pub max_rating: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CfRatingChange {
    pub contest_id: i64,
    pub contest_name: String,
    pub rank: i64,
    pub rating_update_time_seconds: i64,
    pub old_rating: i32,
    pub new_rating: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CfProblem {
    #[serde(default)]
    pub contest_id: Option<i64>,
    pub index: String,
    pub name: String,
    #[serde(default)]
    pub rating: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CfSubmission {
    pub id: i64,
    pub creation_time_seconds: i64,
    pub problem: CfProblem,
    #[serde(default)]
    pub verdict: Option<String>,
}

fn timestamp(seconds: i64, what: &str) -> Result<DateTime<Utc>, UpstreamError> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| UpstreamError::Malformed(format!("{what} timestamp {seconds} out of range")))
}

impl From<CfUser> for Profile {
    fn from(user: CfUser) -> Self {
        Profile {
            handle: user.handle,
            current_rating: user.rating,
            max_rating: user.max_rating,
        }
    }
}

impl TryFrom<CfRatingChange> for RatingChange {
    type Error = UpstreamError;

    fn try_from(change: CfRatingChange) -> Result<Self, Self::Error> {
        Ok(RatingChange {
            timestamp: timestamp(change.rating_update_time_seconds, "rating change")?,
            contest_id: change.contest_id,
            contest_name: change.contest_name,
            rank: change.rank,
            old_rating: change.old_rating,
            new_rating: change.new_rating,
        })
    }
}

/// Converts wire submissions, dropping those whose problem has no contest id.
pub fn convert_submissions(raw: Vec<CfSubmission>) -> Result<Vec<Submission>, UpstreamError> {
    let mut out = Vec::with_capacity(raw.len());
    for sub in raw {
        let Some(contest_id) = sub.problem.contest_id else {
            debug!(submission_id = sub.id, "skipping submission without contest id");
            continue;
        };
        out.push(Submission {
            submission_id: sub.id,
            problem_contest_id: contest_id,
            problem_index: sub.problem.index,
            problem_name: sub.problem.name,
            problem_rating: sub.problem.rating,
            tags: sub.problem.tags,
            verdict: sub.verdict,
            timestamp: timestamp(sub.creation_time_seconds, "submission")?,
        });
    }
    Ok(out)
}

/// Maps a Codeforces `FAILED` comment onto an error kind.
pub fn classify_failure_comment(comment: &str) -> UpstreamError {
    let lower = comment.to_ascii_lowercase();
    if lower.contains("not found") {
        UpstreamError::NotFound(comment.to_string())
    } else if lower.contains("limit exceeded") {
        UpstreamError::Blocked(comment.to_string())
    } else {
        UpstreamError::Rejected(comment.to_string())
    }
}

/// Decodes an envelope body, turning `FAILED` payloads into typed errors.
pub fn decode_envelope<T: DeserializeOwned>(body: &[u8]) -> Result<T, UpstreamError> {
    let envelope: CfEnvelope<T> = serde_json::from_slice(body)
        .map_err(|e| UpstreamError::Malformed(format!("decoding envelope: {e}")))?;
    if envelope.status != "OK" {
        let comment = envelope
            .comment
            .unwrap_or_else(|| format!("status {}", envelope.status));
        return Err(classify_failure_comment(&comment));
    }
    envelope
        .result
        .ok_or_else(|| UpstreamError::Malformed("OK envelope without result".to_string()))
}

fn map_fetch_error(err: FetchError) -> UpstreamError {
    match err {
        FetchError::Blocked { status, url, .. } => {
            UpstreamError::Blocked(format!("http {status} for {url}"))
        }
        FetchError::HttpStatus { status, url, body } => {
            if let Ok(envelope) = serde_json::from_str::<CfEnvelope<serde_json::Value>>(&body) {
                if let Some(comment) = envelope.comment {
                    return classify_failure_comment(&comment);
                }
            }
            if status >= 500 {
                UpstreamError::Transient(format!("http {status} for {url}"))
            } else if status == 404 {
                UpstreamError::NotFound(format!("http 404 for {url}"))
            } else {
                UpstreamError::Rejected(format!("http {status} for {url}"))
            }
        }
        FetchError::Request(err) => UpstreamError::Transient(err.to_string()),
    }
}

/// Codeforces public API client. All calls go through one spaced [`HttpFetcher`].
#[derive(Debug)]
pub struct CodeforcesClient {
    http: HttpFetcher,
    base_url: String,
}

impl CodeforcesClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: HttpClientConfig, base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config).context("building codeforces http client")?;
        Ok(Self::new(http, base_url))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        let url = format!("{}/{}", self.base_url, method);
        let resp = self.http.get(&url, query).await.map_err(|e| {
            let mapped = map_fetch_error(e);
            warn!(method, error = %mapped, "codeforces call failed");
            mapped
        })?;
        decode_envelope(&resp.body)
    }
}

#[async_trait]
impl JudgeClient for CodeforcesClient {
    async fn fetch_profile(&self, handle: &str) -> Result<Profile, UpstreamError> {
        let users: Vec<CfUser> = self
            .call("user.info", &[("handles", handle.to_string())])
            .await?;
        let user = users
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::NotFound(format!("no user with handle {handle}")))?;
        Ok(user.into())
    }

    async fn fetch_rating_history(&self, handle: &str) -> Result<Vec<RatingChange>, UpstreamError> {
        let changes: Vec<CfRatingChange> = self
            .call("user.rating", &[("handle", handle.to_string())])
            .await?;
        debug!(handle, contests = changes.len(), "fetched rating history");
        changes.into_iter().map(RatingChange::try_from).collect()
    }

    async fn fetch_submissions(
        &self,
        handle: &str,
        limit: usize,
    ) -> Result<Vec<Submission>, UpstreamError> {
        let raw: Vec<CfSubmission> = self
            .call(
                "user.status",
                &[
                    ("handle", handle.to_string()),
                    ("from", "1".to_string()),
                    ("count", limit.max(1).to_string()),
                ],
            )
            .await?;
        info!(handle, submissions = raw.len(), "fetched submissions");
        convert_submissions(raw)
    }
}

/// Captured API payloads for one handle, stored as `<dir>/<handle>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub user: CfUser,
    #[serde(default)]
    pub rating: Vec<CfRatingChange>,
    #[serde(default)]
    pub submissions: Vec<CfSubmission>,
}

/// Offline judge client that serves captured bundles from a directory.
#[derive(Debug, Clone)]
pub struct FixtureJudgeClient {
    root: PathBuf,
}

impl FixtureJudgeClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bundle_path(&self, handle: &str) -> PathBuf {
        self.root.join(format!("{}.json", handle.to_ascii_lowercase()))
    }

    async fn load(&self, handle: &str) -> Result<FixtureBundle, UpstreamError> {
        let path = self.bundle_path(handle);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(UpstreamError::NotFound(format!("no fixture for handle {handle}")));
            }
            Err(err) => {
                return Err(UpstreamError::Transient(format!(
                    "reading {}: {err}",
                    path.display()
                )));
            }
        };
        serde_json::from_str(&text)
            .map_err(|e| UpstreamError::Malformed(format!("parsing {}: {e}", path.display())))
    }
}

#[async_trait]
impl JudgeClient for FixtureJudgeClient {
    async fn fetch_profile(&self, handle: &str) -> Result<Profile, UpstreamError> {
        Ok(self.load(handle).await?.user.into())
    }

    async fn fetch_rating_history(&self, handle: &str) -> Result<Vec<RatingChange>, UpstreamError> {
        self.load(handle)
            .await?
            .rating
            .into_iter()
            .map(RatingChange::try_from)
            .collect()
    }

    async fn fetch_submissions(
        &self,
        handle: &str,
        limit: usize,
    ) -> Result<Vec<Submission>, UpstreamError> {
        let mut raw = self.load(handle).await?.submissions;
        raw.sort_by(|a, b| b.creation_time_seconds.cmp(&a.creation_time_seconds));
        raw.truncate(limit);
        convert_submissions(raw)
    }
}
