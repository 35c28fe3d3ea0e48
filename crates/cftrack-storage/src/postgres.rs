use std::collections::BTreeSet;

use anyhow::Context;
use async_trait::async_trait;
use cftrack_core::{
    Achievement, ContestRecord, EmailKind, EmailLogEntry, EmailStatus, NewStudent,
    PerformancePoint, ProblemRecord, Student,
};
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::{validate_new_student, RecordStore, StoreError, StoreResult};

const STUDENT_COLUMNS: &str = r#"
    id, name, email, phone, handle, department, year,
    current_rating, max_rating, total_problems_solved, current_streak, max_streak,
    last_active_date, average_rating_change, contest_participation_rate, problem_solving_rate,
    achievements, performance_history, email_reminders_enabled, reminder_count,
    created_at, last_updated
"#;

/// PostgreSQL-backed record store. Unique keys are enforced by the schema.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }
}

fn backend(err: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict(format!("{what}: {}", db.message()));
        }
    }
    StoreError::Backend(anyhow::Error::new(err).context(what.to_string()))
}

fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_count(value: i32) -> u32 {
    value.max(0) as u32
}

fn email_kind_str(kind: EmailKind) -> &'static str {
    match kind {
        EmailKind::InactivityReminder => "INACTIVITY_REMINDER",
    }
}

fn email_status_str(status: EmailStatus) -> &'static str {
    match status {
        EmailStatus::Sent => "SENT",
        EmailStatus::Failed => "FAILED",
    }
}

fn student_from_row(row: &PgRow) -> Result<Student, sqlx::Error> {
    let achievements: Json<BTreeSet<Achievement>> = row.try_get("achievements")?;
    let history: Json<Vec<PerformancePoint>> = row.try_get("performance_history")?;
    Ok(Student {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        handle: row.try_get("handle")?,
        department: row.try_get("department")?,
        year: row.try_get("year")?,
        current_rating: row.try_get("current_rating")?,
        max_rating: row.try_get("max_rating")?,
        total_problems_solved: from_db_count(row.try_get("total_problems_solved")?),
        current_streak: from_db_count(row.try_get("current_streak")?),
        max_streak: from_db_count(row.try_get("max_streak")?),
        last_active_date: row.try_get("last_active_date")?,
        average_rating_change: row.try_get("average_rating_change")?,
        contest_participation_rate: row.try_get("contest_participation_rate")?,
        problem_solving_rate: row.try_get("problem_solving_rate")?,
        achievements: achievements.0,
        performance_history: history.0,
        email_reminders_enabled: row.try_get("email_reminders_enabled")?,
        reminder_count: from_db_count(row.try_get("reminder_count")?),
        created_at: row.try_get("created_at")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn contest_from_row(row: &PgRow) -> Result<ContestRecord, sqlx::Error> {
    let solved: Option<i32> = row.try_get("problems_solved")?;
    let unsolved: Option<i32> = row.try_get("problems_unsolved")?;
    Ok(ContestRecord {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        contest_id: row.try_get("contest_id")?,
        contest_name: row.try_get("contest_name")?,
        rank: row.try_get("rank")?,
        old_rating: row.try_get("old_rating")?,
        new_rating: row.try_get("new_rating")?,
        problems_solved: solved.map(from_db_count),
        problems_unsolved: unsolved.map(from_db_count),
        contest_date: row.try_get("contest_date")?,
    })
}

fn problem_from_row(row: &PgRow) -> Result<ProblemRecord, sqlx::Error> {
    Ok(ProblemRecord {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        problem_id: row.try_get("problem_id")?,
        problem_name: row.try_get("problem_name")?,
        rating: row.try_get("rating")?,
        tags: row.try_get("tags")?,
        solved_date: row.try_get("solved_date")?,
        submission_id: row.try_get("submission_id")?,
    })
}

fn email_from_row(row: &PgRow) -> Result<EmailLogEntry, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(EmailLogEntry {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        kind: EmailKind::InactivityReminder,
        status: if status == "SENT" {
            EmailStatus::Sent
        } else {
            EmailStatus::Failed
        },
        error_message: row.try_get("error_message")?,
        sent_at: row.try_get("sent_at")?,
    })
}

#[async_trait]
impl RecordStore for PgStore {
    async fn list_students(&self) -> StoreResult<Vec<Student>> {
        let rows = sqlx::query(&format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY seq"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend(e, "listing students"))?;
        rows.iter()
            .map(student_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| backend(e, "decoding student"))
    }

    async fn get_student(&self, id: Uuid) -> StoreResult<Option<Student>> {
        let row = sqlx::query(&format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend(e, "loading student"))?;
        row.as_ref()
            .map(student_from_row)
            .transpose()
            .map_err(|e| backend(e, "decoding student"))
    }

    async fn insert_student(&self, draft: NewStudent) -> StoreResult<Student> {
        validate_new_student(&draft)?;
        let student = draft.into_student(Uuid::new_v4(), Utc::now());
        sqlx::query(
            r#"
            INSERT INTO students (id, name, email, phone, handle, department, year,
                                  email_reminders_enabled, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(student.id)
        .bind(&student.name)
        .bind(&student.email)
        .bind(&student.phone)
        .bind(&student.handle)
        .bind(&student.department)
        .bind(student.year)
        .bind(student.email_reminders_enabled)
        .bind(student.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| backend(e, "inserting student"))?;
        Ok(student)
    }

    async fn update_student(&self, student: &Student) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE students
               SET name = $2, email = $3, phone = $4, handle = $5, department = $6, year = $7,
                   current_rating = $8, max_rating = $9, total_problems_solved = $10,
                   current_streak = $11, max_streak = $12, last_active_date = $13,
                   average_rating_change = $14, contest_participation_rate = $15,
                   problem_solving_rate = $16, achievements = $17, performance_history = $18,
                   email_reminders_enabled = $19, reminder_count = $20, last_updated = $21
             WHERE id = $1
            "#,
        )
        .bind(student.id)
        .bind(&student.name)
        .bind(&student.email)
        .bind(&student.phone)
        .bind(&student.handle)
        .bind(&student.department)
        .bind(student.year)
        .bind(student.current_rating)
        .bind(student.max_rating)
        .bind(to_db_count(student.total_problems_solved))
        .bind(to_db_count(student.current_streak))
        .bind(to_db_count(student.max_streak))
        .bind(student.last_active_date)
        .bind(student.average_rating_change)
        .bind(student.contest_participation_rate)
        .bind(student.problem_solving_rate)
        .bind(Json(&student.achievements))
        .bind(Json(&student.performance_history))
        .bind(student.email_reminders_enabled)
        .bind(to_db_count(student.reminder_count))
        .bind(student.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|e| backend(e, "updating student"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("student {}", student.id)));
        }
        Ok(())
    }

    async fn delete_student(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM students WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| backend(e, "deleting student"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_contest(
        &self,
        student_id: Uuid,
        contest_id: i64,
    ) -> StoreResult<Option<ContestRecord>> {
        let row = sqlx::query("SELECT * FROM contests WHERE student_id = $1 AND contest_id = $2")
            .bind(student_id)
            .bind(contest_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend(e, "loading contest"))?;
        row.as_ref()
            .map(contest_from_row)
            .transpose()
            .map_err(|e| backend(e, "decoding contest"))
    }

    async fn insert_contest(&self, contest: &ContestRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO contests (id, student_id, contest_id, contest_name, rank, old_rating,
                                  new_rating, problems_solved, problems_unsolved, contest_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(contest.id)
        .bind(contest.student_id)
        .bind(contest.contest_id)
        .bind(&contest.contest_name)
        .bind(contest.rank)
        .bind(contest.old_rating)
        .bind(contest.new_rating)
        .bind(contest.problems_solved.map(to_db_count))
        .bind(contest.problems_unsolved.map(to_db_count))
        .bind(contest.contest_date)
        .execute(&self.pool)
        .await
        .map_err(|e| backend(e, "inserting contest"))?;
        Ok(())
    }

    async fn list_contests(&self, student_id: Uuid) -> StoreResult<Vec<ContestRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM contests WHERE student_id = $1 ORDER BY contest_date, contest_id",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend(e, "listing contests"))?;
        rows.iter()
            .map(contest_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| backend(e, "decoding contest"))
    }

    async fn find_problem(
        &self,
        student_id: Uuid,
        problem_id: &str,
    ) -> StoreResult<Option<ProblemRecord>> {
        let row = sqlx::query("SELECT * FROM problems WHERE student_id = $1 AND problem_id = $2")
            .bind(student_id)
            .bind(problem_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend(e, "loading problem"))?;
        row.as_ref()
            .map(problem_from_row)
            .transpose()
            .map_err(|e| backend(e, "decoding problem"))
    }

    async fn insert_problem(&self, problem: &ProblemRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO problems (id, student_id, problem_id, problem_name, rating, tags,
                                  solved_date, submission_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(problem.id)
        .bind(problem.student_id)
        .bind(&problem.problem_id)
        .bind(&problem.problem_name)
        .bind(problem.rating)
        .bind(&problem.tags)
        .bind(problem.solved_date)
        .bind(problem.submission_id)
        .execute(&self.pool)
        .await
        .map_err(|e| backend(e, "inserting problem"))?;
        Ok(())
    }

    async fn list_problems(&self, student_id: Uuid) -> StoreResult<Vec<ProblemRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM problems WHERE student_id = $1 ORDER BY solved_date, problem_id",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend(e, "listing problems"))?;
        rows.iter()
            .map(problem_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| backend(e, "decoding problem"))
    }

    async fn record_email(&self, entry: &EmailLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO email_log (id, student_id, kind, status, error_message, sent_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.student_id)
        .bind(email_kind_str(entry.kind))
        .bind(email_status_str(entry.status))
        .bind(&entry.error_message)
        .bind(entry.sent_at)
        .execute(&self.pool)
        .await
        .map_err(|e| backend(e, "recording email attempt"))?;
        Ok(())
    }

    async fn list_email_log(&self, student_id: Uuid) -> StoreResult<Vec<EmailLogEntry>> {
        let rows = sqlx::query("SELECT * FROM email_log WHERE student_id = $1 ORDER BY sent_at")
            .bind(student_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend(e, "listing email log"))?;
        rows.iter()
            .map(email_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| backend(e, "decoding email log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_clamp_at_database_bounds() {
        assert_eq!(to_db_count(u32::MAX), i32::MAX);
        assert_eq!(to_db_count(12), 12);
        assert_eq!(from_db_count(-4), 0);
        assert_eq!(from_db_count(7), 7);
    }

    #[test]
    fn email_enums_use_stable_column_values() {
        assert_eq!(email_kind_str(EmailKind::InactivityReminder), "INACTIVITY_REMINDER");
        assert_eq!(email_status_str(EmailStatus::Sent), "SENT");
        assert_eq!(email_status_str(EmailStatus::Failed), "FAILED");
    }
}
