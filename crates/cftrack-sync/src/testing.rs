//! Scripted collaborators shared by the unit tests in this crate.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use cftrack_adapters::{JudgeClient, UpstreamError};
use cftrack_core::{
    ContestRecord, EmailLogEntry, FetchedProfileData, NewStudent, ProblemRecord, Profile,
    RatingChange, Student, Submission,
};
use cftrack_storage::{MemoryStore, RecordStore, StoreError, StoreResult};
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::notify::{Mailer, RatingSnapshot};

fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, d, h, m, 0).unwrap()
}

pub fn submission(id: i64, contest: i64, index: &str, verdict: &str, timestamp: DateTime<Utc>) -> Submission {
    Submission {
        submission_id: id,
        problem_contest_id: contest,
        problem_index: index.to_string(),
        problem_name: format!("Problem {contest}{index}"),
        problem_rating: Some(1200),
        tags: vec!["implementation".to_string()],
        verdict: Some(verdict.to_string()),
        timestamp,
    }
}

pub fn accepted(id: i64, contest: i64, index: &str, timestamp: DateTime<Utc>) -> Submission {
    submission(id, contest, index, "OK", timestamp)
}

pub fn rated(contest_id: i64, old_rating: i32, new_rating: i32, timestamp: DateTime<Utc>) -> RatingChange {
    RatingChange {
        contest_id,
        contest_name: format!("Codeforces Round {contest_id}"),
        rank: 812,
        old_rating,
        new_rating,
        timestamp,
    }
}

/// Two rated contests and two distinct accepted problems, one accepted twice.
pub fn sample_data() -> FetchedProfileData {
    FetchedProfileData {
        profile: Profile {
            handle: "ada_l".to_string(),
            current_rating: Some(1480),
            max_rating: Some(1512),
        },
        rating_history: vec![
            rated(1850, 1200, 1350, at(6, 17, 35)),
            rated(1857, 1350, 1480, at(20, 17, 35)),
        ],
        submissions: vec![
            submission(5, 1857, "C", "WRONG_ANSWER", at(20, 15, 0)),
            accepted(4, 1850, "B", at(7, 10, 0)),
            accepted(3, 1850, "B", at(6, 16, 30)),
            accepted(2, 1850, "A", at(6, 15, 10)),
            submission(1, 1850, "A", "COMPILATION_ERROR", at(6, 15, 0)),
        ],
    }
}

#[derive(Debug, Clone)]
pub enum Script {
    Data(FetchedProfileData),
    Blocked,
    NotFound,
}

/// Judge that answers from per-handle scripts; unknown handles are not found.
#[derive(Debug, Default)]
pub struct ScriptedJudge {
    scripts: HashMap<String, Script>,
    delay: Option<Duration>,
}

impl ScriptedJudge {
    pub fn with(mut self, handle: &str, script: Script) -> Self {
        self.scripts.insert(handle.to_ascii_lowercase(), script);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn answer(&self, handle: &str) -> Result<FetchedProfileData, UpstreamError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.scripts.get(&handle.to_ascii_lowercase()) {
            Some(Script::Data(data)) => Ok(data.clone()),
            Some(Script::Blocked) => Err(UpstreamError::Blocked("http 403".to_string())),
            Some(Script::NotFound) | None => Err(UpstreamError::NotFound(handle.to_string())),
        }
    }
}

#[async_trait]
impl JudgeClient for ScriptedJudge {
    async fn fetch_profile(&self, handle: &str) -> Result<Profile, UpstreamError> {
        Ok(self.answer(handle).await?.profile)
    }

    async fn fetch_rating_history(&self, handle: &str) -> Result<Vec<RatingChange>, UpstreamError> {
        Ok(self.answer(handle).await?.rating_history)
    }

    async fn fetch_submissions(
        &self,
        handle: &str,
        limit: usize,
    ) -> Result<Vec<Submission>, UpstreamError> {
        let mut submissions = self.answer(handle).await?.submissions;
        submissions.truncate(limit);
        Ok(submissions)
    }
}

pub struct FailingMailer;

#[async_trait]
impl Mailer for FailingMailer {
    async fn send(&self, _student: &Student, _snapshot: RatingSnapshot) -> anyhow::Result<()> {
        anyhow::bail!("smtp relay refused connection")
    }
}

/// Memory store that fails inserts for one contest or reports a concurrent
/// writer for one problem.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_contest: Option<i64>,
    conflicting_problem: Option<String>,
}

impl FlakyStore {
    pub fn failing_contest(contest_id: i64) -> Self {
        Self {
            failing_contest: Some(contest_id),
            ..Self::default()
        }
    }

    pub fn conflicting_problem(problem_id: &str) -> Self {
        Self {
            conflicting_problem: Some(problem_id.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn list_students(&self) -> StoreResult<Vec<Student>> {
        self.inner.list_students().await
    }

    async fn get_student(&self, id: Uuid) -> StoreResult<Option<Student>> {
        self.inner.get_student(id).await
    }

    async fn insert_student(&self, draft: NewStudent) -> StoreResult<Student> {
        self.inner.insert_student(draft).await
    }

    async fn update_student(&self, student: &Student) -> StoreResult<()> {
        self.inner.update_student(student).await
    }

    async fn delete_student(&self, id: Uuid) -> StoreResult<bool> {
        self.inner.delete_student(id).await
    }

    async fn find_contest(&self, student_id: Uuid, contest_id: i64) -> StoreResult<Option<ContestRecord>> {
        self.inner.find_contest(student_id, contest_id).await
    }

    async fn insert_contest(&self, contest: &ContestRecord) -> StoreResult<()> {
        if self.failing_contest == Some(contest.contest_id) {
            return Err(StoreError::Backend(anyhow::anyhow!("connection reset")));
        }
        self.inner.insert_contest(contest).await
    }

    async fn list_contests(&self, student_id: Uuid) -> StoreResult<Vec<ContestRecord>> {
        self.inner.list_contests(student_id).await
    }

    async fn find_problem(&self, student_id: Uuid, problem_id: &str) -> StoreResult<Option<ProblemRecord>> {
        self.inner.find_problem(student_id, problem_id).await
    }

    async fn insert_problem(&self, problem: &ProblemRecord) -> StoreResult<()> {
        if self.conflicting_problem.as_deref() == Some(problem.problem_id.as_str()) {
            return Err(StoreError::Conflict(format!("problem {}", problem.problem_id)));
        }
        self.inner.insert_problem(problem).await
    }

    async fn list_problems(&self, student_id: Uuid) -> StoreResult<Vec<ProblemRecord>> {
        self.inner.list_problems(student_id).await
    }

    async fn record_email(&self, entry: &EmailLogEntry) -> StoreResult<()> {
        self.inner.record_email(entry).await
    }

    async fn list_email_log(&self, student_id: Uuid) -> StoreResult<Vec<EmailLogEntry>> {
        self.inner.list_email_log(student_id).await
    }
}
