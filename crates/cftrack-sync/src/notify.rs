use async_trait::async_trait;
use cftrack_core::{Student, Submission};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

/// Ratings quoted in a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RatingSnapshot {
    pub current_rating: i32,
    pub max_rating: i32,
}

impl RatingSnapshot {
    pub fn of(student: &Student) -> Self {
        Self {
            current_rating: student.current_rating,
            max_rating: student.max_rating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

pub fn render_reminder(student: &Student, snapshot: RatingSnapshot) -> ReminderMessage {
    ReminderMessage {
        to: student.email.clone(),
        subject: "Time to get back to problem solving!".to_string(),
        body: format!(
            "Hi {name},\n\nWe noticed you haven't submitted anything on Codeforces ({handle}) recently.\n\
             Current rating: {current}\nMax rating: {max}\n\n\
             A few problems a week keep the streak alive. Happy coding!\n",
            name = student.name,
            handle = student.handle,
            current = snapshot.current_rating,
            max = snapshot.max_rating,
        ),
    }
}

/// Outbound mail for inactivity reminders.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, student: &Student, snapshot: RatingSnapshot) -> anyhow::Result<()>;
}

/// Emits rendered reminders as log events instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMailer;

#[async_trait]
impl Mailer for TracingMailer {
    async fn send(&self, student: &Student, snapshot: RatingSnapshot) -> anyhow::Result<()> {
        let message = render_reminder(student, snapshot);
        info!(
            student_id = %student.id,
            to = %message.to,
            subject = %message.subject,
            body = %message.body,
            "inactivity reminder"
        );
        Ok(())
    }
}

/// Inactive when the newest submission of any verdict is older than `threshold`,
/// or when there are no submissions at all.
pub fn is_inactive(submissions: &[Submission], now: DateTime<Utc>, threshold: Duration) -> bool {
    match submissions.iter().map(|s| s.timestamp).max() {
        Some(latest) => now - latest > threshold,
        None => true,
    }
}

pub fn should_remind(
    student: &Student,
    submissions: &[Submission],
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    student.email_reminders_enabled && is_inactive(submissions, now, threshold)
}
