//! Sync orchestration: fetch, reconcile, refresh derived metrics, remind.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cftrack_adapters::{JudgeClient, UpstreamError, CODEFORCES_API_BASE};
use cftrack_analytics::{
    compute_streak, department_stats, evaluate_achievements, global_stats, leaderboard,
    merge_achievements, performance_history, performance_metrics, student_analytics,
    AchievementInput, DepartmentStats, GlobalStats, LeaderboardRow, PerformanceMetrics,
    StreakSummary, StudentAnalytics,
};
use cftrack_core::{
    Achievement, EmailKind, EmailLogEntry, EmailStatus, PerformancePoint, Student, StudentUpdate,
};
use cftrack_storage::{BackoffPolicy, HttpClientConfig, RecordStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod notify;
mod reconcile;
mod schedule;

pub use notify::{
    is_inactive, render_reminder, should_remind, Mailer, RatingSnapshot, ReminderMessage,
    TracingMailer,
};
pub use reconcile::{apply_profile, earliest_accepted, reconcile, ReconcileOutcome};
pub use schedule::{
    builtin_presets, load_schedule_presets, ScheduleController, ScheduleError, SchedulePreset,
    ScheduleState, ScheduleStatus, ScheduledTask,
};

pub const CRATE_NAME: &str = "cftrack-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_spacing_ms: u64,
    pub submission_limit: usize,
    pub inactivity_days: i64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub reports_dir: Option<PathBuf>,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub const DEFAULT_SYNC_CRON: &'static str = "0 2 * * *";

    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            api_base: std::env::var("CFTRACK_API_BASE")
                .unwrap_or_else(|_| CODEFORCES_API_BASE.to_string()),
            user_agent: std::env::var("CFTRACK_USER_AGENT")
                .unwrap_or_else(|_| "cftrack-bot/0.1".to_string()),
            http_timeout_secs: env_parse("CFTRACK_HTTP_TIMEOUT_SECS", 20),
            request_spacing_ms: env_parse("CFTRACK_REQUEST_SPACING_MS", 1000),
            submission_limit: env_parse("CFTRACK_SUBMISSION_LIMIT", 100),
            inactivity_days: env_parse("CFTRACK_INACTIVITY_DAYS", 7),
            scheduler_enabled: std::env::var("CFTRACK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("CFTRACK_SYNC_CRON")
                .unwrap_or_else(|_| Self::DEFAULT_SYNC_CRON.to_string()),
            reports_dir: std::env::var("CFTRACK_REPORTS_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            web_port: env_parse("CFTRACK_WEB_PORT", 8000),
            workspace_root: std::env::var("CFTRACK_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            min_request_spacing: Duration::from_millis(self.request_spacing_ms),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            submission_limit: self.submission_limit,
            inactivity_threshold: chrono::Duration::days(self.inactivity_days),
            reports_dir: self.reports_dir.clone(),
        }
    }
}

/// Knobs the orchestrator itself reads on every sync.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub submission_limit: usize,
    pub inactivity_threshold: chrono::Duration,
    pub reports_dir: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            submission_limit: 100,
            inactivity_threshold: chrono::Duration::days(7),
            reports_dir: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("student {0} not found")]
    StudentNotFound(Uuid),
    #[error("judge is blocking requests, try again later: {0}")]
    UpstreamBlocked(String),
    #[error("handle not found on judge: {0}")]
    UpstreamNotFound(String),
    #[error("transient judge failure: {0}")]
    UpstreamTransient(String),
    #[error("judge rejected request: {0}")]
    UpstreamRejected(String),
    #[error("malformed judge response: {0}")]
    UpstreamMalformed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<UpstreamError> for SyncError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Blocked(msg) => SyncError::UpstreamBlocked(msg),
            UpstreamError::NotFound(msg) => SyncError::UpstreamNotFound(msg),
            UpstreamError::Transient(msg) => SyncError::UpstreamTransient(msg),
            UpstreamError::Rejected(msg) => SyncError::UpstreamRejected(msg),
            UpstreamError::Malformed(msg) => SyncError::UpstreamMalformed(msg),
        }
    }
}

impl SyncError {
    /// Stable machine-readable code for reports and API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::StudentNotFound(_) => "STUDENT_NOT_FOUND",
            SyncError::UpstreamBlocked(_) => "UPSTREAM_BLOCKED",
            SyncError::UpstreamNotFound(_) => "UPSTREAM_NOT_FOUND",
            SyncError::UpstreamTransient(_) => "UPSTREAM_TRANSIENT",
            SyncError::UpstreamRejected(_) => "UPSTREAM_REJECTED",
            SyncError::UpstreamMalformed(_) => "UPSTREAM_MALFORMED",
            SyncError::Store(StoreError::Validation(_)) => "VALIDATION_ERROR",
            SyncError::Store(StoreError::Conflict(_)) => "CONFLICT",
            SyncError::Store(StoreError::NotFound(_)) => "NOT_FOUND",
            SyncError::Store(StoreError::Backend(_)) => "STORE_ERROR",
        }
    }
}

/// Result of one student's sync inside a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced {
        new_contests: usize,
        new_problems: usize,
        reminder_sent: bool,
    },
    Blocked {
        message: String,
    },
    Failed {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentOutcome {
    pub student_id: Uuid,
    pub handle: String,
    pub outcome: SyncOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<StudentOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Synced { .. }))
    }

    pub fn blocked(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Blocked { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&SyncOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.outcome)).count()
    }

    pub fn summary_markdown(&self) -> String {
        let mut lines = vec![
            "# cftrack sync report".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Students: {}", self.outcomes.len()),
            format!("- Synced: {}", self.succeeded()),
            format!("- Blocked: {}", self.blocked()),
            format!("- Failed: {}", self.failed()),
            String::new(),
            "## Students".to_string(),
        ];
        for item in &self.outcomes {
            let line = match &item.outcome {
                SyncOutcome::Synced {
                    new_contests,
                    new_problems,
                    reminder_sent,
                } => format!(
                    "- {}: synced (+{new_contests} contests, +{new_problems} problems{})",
                    item.handle,
                    if *reminder_sent { ", reminded" } else { "" }
                ),
                SyncOutcome::Blocked { message } => format!("- {}: blocked ({message})", item.handle),
                SyncOutcome::Failed { code, message } => {
                    format!("- {}: failed {code} ({message})", item.handle)
                }
            };
            lines.push(line);
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Writes `sync_report.json` and `summary.md` under `<dir>/<run_id>/`.
pub async fn write_batch_report(dir: &Path, report: &BatchReport) -> anyhow::Result<PathBuf> {
    let run_dir = dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing sync report")?;
    fs::write(run_dir.join("sync_report.json"), json)
        .await
        .context("writing sync_report.json")?;
    fs::write(run_dir.join("summary.md"), report.summary_markdown())
        .await
        .context("writing summary.md")?;
    Ok(run_dir)
}

/// Held achievements plus the ones granted by the latest evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AchievementReport {
    pub held: BTreeSet<Achievement>,
    pub newly_granted: Vec<Achievement>,
}

#[derive(Default)]
struct StudentLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl StudentLocks {
    async fn lock_for(&self, student_id: Uuid) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        // entries nobody holds or waits on
        map.retain(|id, lock| *id == student_id || Arc::strong_count(lock) > 1);
        map.entry(student_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn forget(&self, student_id: Uuid) {
        self.inner.lock().await.remove(&student_id);
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Drives per-student and batch syncs and serves analytics reads.
///
/// Syncs of the same student are serialized; different students may sync
/// concurrently.
pub struct SyncService {
    store: Arc<dyn RecordStore>,
    judge: Arc<dyn JudgeClient>,
    mailer: Arc<dyn Mailer>,
    settings: SyncSettings,
    locks: StudentLocks,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        judge: Arc<dyn JudgeClient>,
        mailer: Arc<dyn Mailer>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            judge,
            mailer,
            settings,
            locks: StudentLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn sync_one(&self, student_id: Uuid) -> Result<Student, SyncError> {
        Ok(self.sync_one_at(student_id, Utc::now()).await?.0)
    }

    /// Syncs one student as of `now`, returning the persisted student and what changed.
    pub async fn sync_one_at(
        &self,
        student_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Student, SyncOutcome), SyncError> {
        let lock = self.locks.lock_for(student_id).await;
        let _guard = lock.lock().await;

        let mut student = self
            .store
            .get_student(student_id)
            .await?
            .ok_or(SyncError::StudentNotFound(student_id))?;

        let span = info_span!("sync_student", %student_id, handle = %student.handle);
        let outcome = self.sync_loaded(&mut student, now).instrument(span).await?;
        Ok((student, outcome))
    }

    async fn sync_loaded(
        &self,
        student: &mut Student,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, SyncError> {
        let data = self
            .judge
            .fetch_all(&student.handle, self.settings.submission_limit)
            .await
            .inspect_err(|err| warn!(error = %err, "fetch failed"))?;

        let reconciled = reconcile(self.store.as_ref(), student, &data).await;
        self.refresh_derived(student, now).await?;

        let reminder_sent =
            if should_remind(student, &data.submissions, now, self.settings.inactivity_threshold) {
                self.send_reminder(student, now).await
            } else {
                false
            };

        student.last_updated = Some(now);
        self.store.update_student(student).await?;
        info!(
            new_contests = reconciled.new_contests.len(),
            new_problems = reconciled.new_problems.len(),
            skipped = reconciled.failed_writes,
            reminder_sent,
            "student synced"
        );
        Ok(SyncOutcome::Synced {
            new_contests: reconciled.new_contests.len(),
            new_problems: reconciled.new_problems.len(),
            reminder_sent,
        })
    }

    /// Recomputes streaks, rates, history and achievements from persisted records.
    async fn refresh_derived(&self, student: &mut Student, now: DateTime<Utc>) -> Result<(), SyncError> {
        let contests = self.store.list_contests(student.id).await?;
        let problems = self.store.list_problems(student.id).await?;

        let streak = compute_streak(&problems, now);
        student.current_streak = streak.current_streak;
        student.max_streak = streak.max_streak;
        student.last_active_date = streak.last_active_date;

        let metrics = performance_metrics(&contests, &problems);
        student.average_rating_change = metrics.average_rating_change;
        student.contest_participation_rate = metrics.contest_participation_rate;
        student.problem_solving_rate = metrics.problem_solving_rate;
        student.performance_history = performance_history(&contests, &problems);

        let earned = evaluate_achievements(&AchievementInput {
            current_rating: student.current_rating,
            current_streak: student.current_streak,
            total_problems_solved: student.total_problems_solved,
            contests: &contests,
            problems: &problems,
            held: &student.achievements,
            now,
        });
        if !earned.is_empty() {
            info!(achievements = ?earned, "achievements granted");
        }
        student.achievements = merge_achievements(&student.achievements, &earned);
        Ok(())
    }

    /// Sends the inactivity reminder and audits the attempt. Never fails the sync.
    async fn send_reminder(&self, student: &mut Student, now: DateTime<Utc>) -> bool {
        let result = self.mailer.send(student, RatingSnapshot::of(student)).await;
        let (status, error_message) = match &result {
            Ok(()) => {
                student.reminder_count += 1;
                info!(reminder_count = student.reminder_count, "inactivity reminder sent");
                (EmailStatus::Sent, None)
            }
            Err(err) => {
                warn!(error = %err, "inactivity reminder failed");
                (EmailStatus::Failed, Some(err.to_string()))
            }
        };
        let entry = EmailLogEntry {
            id: Uuid::new_v4(),
            student_id: student.id,
            kind: EmailKind::InactivityReminder,
            status,
            error_message,
            sent_at: now,
        };
        if let Err(err) = self.store.record_email(&entry).await {
            warn!(error = %err, "recording email audit entry failed");
        }
        result.is_ok()
    }

    /// Syncs every student in creation order. One student's failure never stops the batch.
    pub async fn sync_all(&self) -> Result<BatchReport, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let students = self.store.list_students().await?;
        info!(%run_id, students = students.len(), "batch sync started");

        let mut outcomes = Vec::with_capacity(students.len());
        for student in students {
            let outcome = match self.sync_one_at(student.id, Utc::now()).await {
                Ok((_, outcome)) => outcome,
                Err(SyncError::UpstreamBlocked(message)) => {
                    warn!(%run_id, handle = %student.handle, %message, "judge blocked request");
                    SyncOutcome::Blocked { message }
                }
                Err(err) => {
                    warn!(%run_id, handle = %student.handle, error = %err, "student sync failed");
                    SyncOutcome::Failed {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    }
                }
            };
            outcomes.push(StudentOutcome {
                student_id: student.id,
                handle: student.handle,
                outcome,
            });
        }

        let report = BatchReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        info!(
            %run_id,
            synced = report.succeeded(),
            blocked = report.blocked(),
            failed = report.failed(),
            "batch sync finished"
        );

        if let Some(dir) = &self.settings.reports_dir {
            match write_batch_report(dir, &report).await {
                Ok(path) => info!(%run_id, path = %path.display(), "batch report written"),
                Err(err) => warn!(%run_id, error = %err, "writing batch report failed"),
            }
        }
        Ok(report)
    }

    async fn require_student(&self, student_id: Uuid) -> Result<Student, SyncError> {
        self.store
            .get_student(student_id)
            .await?
            .ok_or(SyncError::StudentNotFound(student_id))
    }

    pub async fn get_streak(&self, student_id: Uuid) -> Result<StreakSummary, SyncError> {
        self.require_student(student_id).await?;
        let problems = self.store.list_problems(student_id).await?;
        Ok(compute_streak(&problems, Utc::now()))
    }

    pub async fn get_performance_metrics(
        &self,
        student_id: Uuid,
    ) -> Result<PerformanceMetrics, SyncError> {
        self.require_student(student_id).await?;
        let contests = self.store.list_contests(student_id).await?;
        let problems = self.store.list_problems(student_id).await?;
        Ok(performance_metrics(&contests, &problems))
    }

    pub async fn get_performance_history(
        &self,
        student_id: Uuid,
    ) -> Result<Vec<PerformancePoint>, SyncError> {
        self.require_student(student_id).await?;
        let contests = self.store.list_contests(student_id).await?;
        let problems = self.store.list_problems(student_id).await?;
        Ok(performance_history(&contests, &problems))
    }

    pub async fn get_student_analytics(
        &self,
        student_id: Uuid,
    ) -> Result<StudentAnalytics, SyncError> {
        self.require_student(student_id).await?;
        let contests = self.store.list_contests(student_id).await?;
        let problems = self.store.list_problems(student_id).await?;
        Ok(student_analytics(&contests, &problems, Utc::now()))
    }

    /// Applies an administrator edit. A changed handle triggers a resync; a failed
    /// resync is logged and the edit is kept.
    pub async fn update_student(
        &self,
        student_id: Uuid,
        update: StudentUpdate,
    ) -> Result<Student, SyncError> {
        let blank = update.blank_fields();
        if !blank.is_empty() {
            return Err(StoreError::Validation(format!("{} cannot be empty", blank.join(", "))).into());
        }

        let (student, handle_changed) = {
            let lock = self.locks.lock_for(student_id).await;
            let _guard = lock.lock().await;
            let mut student = self.require_student(student_id).await?;
            let handle_changed = update.apply(&mut student);
            self.store.update_student(&student).await?;
            info!(%student_id, handle = %student.handle, handle_changed, "student updated");
            (student, handle_changed)
        };

        if !handle_changed {
            return Ok(student);
        }
        match self.sync_one(student_id).await {
            Ok(synced) => Ok(synced),
            Err(err) => {
                warn!(%student_id, error = %err, "resync after handle change failed");
                Ok(student)
            }
        }
    }

    pub async fn toggle_reminders(&self, student_id: Uuid) -> Result<Student, SyncError> {
        let lock = self.locks.lock_for(student_id).await;
        let _guard = lock.lock().await;
        let mut student = self.require_student(student_id).await?;
        student.email_reminders_enabled = !student.email_reminders_enabled;
        self.store.update_student(&student).await?;
        info!(%student_id, enabled = student.email_reminders_enabled, "email reminders toggled");
        Ok(student)
    }

    /// Deletes the student and its history once no sync of it is in flight.
    pub async fn delete_student(&self, student_id: Uuid) -> Result<bool, SyncError> {
        let deleted = {
            let lock = self.locks.lock_for(student_id).await;
            let _guard = lock.lock().await;
            self.store.delete_student(student_id).await?
        };
        self.locks.forget(student_id).await;
        if deleted {
            info!(%student_id, "student deleted");
        }
        Ok(deleted)
    }

    pub async fn get_achievements(&self, student_id: Uuid) -> Result<AchievementReport, SyncError> {
        self.get_achievements_at(student_id, Utc::now()).await
    }

    /// Evaluates achievements as of `now` and persists any new ones on the student.
    pub async fn get_achievements_at(
        &self,
        student_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AchievementReport, SyncError> {
        let lock = self.locks.lock_for(student_id).await;
        let _guard = lock.lock().await;

        let mut student = self.require_student(student_id).await?;
        let contests = self.store.list_contests(student_id).await?;
        let problems = self.store.list_problems(student_id).await?;
        let newly_granted = evaluate_achievements(&AchievementInput {
            current_rating: student.current_rating,
            current_streak: student.current_streak,
            total_problems_solved: student.total_problems_solved,
            contests: &contests,
            problems: &problems,
            held: &student.achievements,
            now,
        });
        if !newly_granted.is_empty() {
            student.achievements = merge_achievements(&student.achievements, &newly_granted);
            self.store.update_student(&student).await?;
        }
        Ok(AchievementReport {
            held: student.achievements,
            newly_granted,
        })
    }

    pub async fn get_leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardRow>, SyncError> {
        let students = self.store.list_students().await?;
        Ok(leaderboard(&students, limit))
    }

    pub async fn get_department_stats(&self) -> Result<Vec<DepartmentStats>, SyncError> {
        let students = self.store.list_students().await?;
        Ok(department_stats(&students))
    }

    pub async fn get_global_stats(&self) -> Result<GlobalStats, SyncError> {
        let students = self.store.list_students().await?;
        Ok(global_stats(&students))
    }
}

#[async_trait]
impl ScheduledTask for SyncService {
    async fn run_scheduled(&self) {
        info!("scheduled sync triggered");
        if let Err(err) = self.sync_all().await {
            warn!(error = %err, "scheduled sync could not list students");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing;
