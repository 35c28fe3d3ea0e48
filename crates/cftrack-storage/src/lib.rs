//! Record store contract + HTTP fetch utilities for cftrack.

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use cftrack_core::{ContestRecord, EmailLogEntry, NewStudent, ProblemRecord, Student};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "cftrack-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    /// Unique-key violation; the row already exists.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for students and their per-contest / per-problem history.
///
/// Contest rows are unique per `(student_id, contest_id)` and problem rows per
/// `(student_id, problem_id)`; inserting an existing key yields
/// [`StoreError::Conflict`] and leaves the stored row untouched.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All students in creation order.
    async fn list_students(&self) -> StoreResult<Vec<Student>>;
    async fn get_student(&self, id: Uuid) -> StoreResult<Option<Student>>;
    async fn insert_student(&self, draft: NewStudent) -> StoreResult<Student>;
    async fn update_student(&self, student: &Student) -> StoreResult<()>;
    /// Removes the student together with its contests, problems and email log.
    async fn delete_student(&self, id: Uuid) -> StoreResult<bool>;

    async fn find_contest(&self, student_id: Uuid, contest_id: i64)
        -> StoreResult<Option<ContestRecord>>;
    async fn insert_contest(&self, contest: &ContestRecord) -> StoreResult<()>;
    async fn list_contests(&self, student_id: Uuid) -> StoreResult<Vec<ContestRecord>>;

    async fn find_problem(&self, student_id: Uuid, problem_id: &str)
        -> StoreResult<Option<ProblemRecord>>;
    async fn insert_problem(&self, problem: &ProblemRecord) -> StoreResult<()>;
    async fn list_problems(&self, student_id: Uuid) -> StoreResult<Vec<ProblemRecord>>;

    async fn record_email(&self, entry: &EmailLogEntry) -> StoreResult<()>;
    async fn list_email_log(&self, student_id: Uuid) -> StoreResult<Vec<EmailLogEntry>>;
}

fn validate_new_student(draft: &NewStudent) -> StoreResult<()> {
    let missing = draft.missing_fields();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StoreError::Validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    /// The remote service is throttling us; back off instead of hammering it.
    Blocked,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Blocked
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Minimum gap between the start of two consecutive remote calls.
    pub min_request_spacing: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            min_request_spacing: Duration::from_millis(1000),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Serializes callers so that consecutive calls start at least `spacing` apart.
#[derive(Debug)]
pub struct RequestSpacer {
    spacing: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RequestSpacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last_call: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(last) = *last_call {
            let elapsed = last.elapsed();
            if elapsed < self.spacing {
                tokio::time::sleep(self.spacing - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    spacer: RequestSpacer,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("remote service is blocking requests (http {status} for {url})")]
    Blocked { status: u16, url: String, body: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            spacer: RequestSpacer::new(config.min_request_spacing),
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query`, retrying transient failures with capped exponential backoff.
    ///
    /// Blocking responses (403/429) are returned immediately as [`FetchError::Blocked`].
    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.get_with_retries(url, query).instrument(span).await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            self.spacer.wait().await;
            let resp_result = self.client.get(url).query(query).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();

                    if status.is_success() {
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let body_text = String::from_utf8_lossy(&body).into_owned();
                    match classify_status(status) {
                        RetryDisposition::Blocked => {
                            return Err(FetchError::Blocked {
                                status: status.as_u16(),
                                url: final_url,
                                body: body_text,
                            });
                        }
                        RetryDisposition::Retryable if attempt < self.backoff.max_retries => {
                            debug!(status = status.as_u16(), attempt, "retrying after server error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                        }
                        _ => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                                body: body_text,
                            });
                        }
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
