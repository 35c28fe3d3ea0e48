//! Core domain model and fetched-data contracts for cftrack.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cftrack-core";

pub const DEFAULT_DEPARTMENT: &str = "Computer Science";

/// Verdict string the judge reports for an accepted submission.
pub const ACCEPTED_VERDICT: &str = "OK";

/// Milestone flags derived from aggregate student state. Never revoked once held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Achievement {
    #[serde(rename = "first_contest")]
    FirstContest,
    #[serde(rename = "rating_1000")]
    Rating1000,
    #[serde(rename = "rating_1500")]
    Rating1500,
    #[serde(rename = "rating_2000")]
    Rating2000,
    #[serde(rename = "streak_7")]
    Streak7,
    #[serde(rename = "streak_30")]
    Streak30,
    #[serde(rename = "problems_50")]
    Problems50,
    #[serde(rename = "problems_100")]
    Problems100,
    #[serde(rename = "problems_200")]
    Problems200,
    #[serde(rename = "contest_master")]
    ContestMaster,
    #[serde(rename = "speed_solver")]
    SpeedSolver,
    #[serde(rename = "consistency_king")]
    ConsistencyKing,
}

impl Achievement {
    pub const ALL: [Achievement; 12] = [
        Achievement::FirstContest,
        Achievement::Rating1000,
        Achievement::Rating1500,
        Achievement::Rating2000,
        Achievement::Streak7,
        Achievement::Streak30,
        Achievement::Problems50,
        Achievement::Problems100,
        Achievement::Problems200,
        Achievement::ContestMaster,
        Achievement::SpeedSolver,
        Achievement::ConsistencyKing,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Self::FirstContest => "first_contest",
            Self::Rating1000 => "rating_1000",
            Self::Rating1500 => "rating_1500",
            Self::Rating2000 => "rating_2000",
            Self::Streak7 => "streak_7",
            Self::Streak30 => "streak_30",
            Self::Problems50 => "problems_50",
            Self::Problems100 => "problems_100",
            Self::Problems200 => "problems_200",
            Self::ContestMaster => "contest_master",
            Self::SpeedSolver => "speed_solver",
            Self::ConsistencyKing => "consistency_king",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::FirstContest => "First Contest",
            Self::Rating1000 => "Rating 1000+",
            Self::Rating1500 => "Rating 1500+",
            Self::Rating2000 => "Rating 2000+",
            Self::Streak7 => "7-Day Streak",
            Self::Streak30 => "30-Day Streak",
            Self::Problems50 => "50 Problems Solved",
            Self::Problems100 => "100 Problems Solved",
            Self::Problems200 => "200 Problems Solved",
            Self::ContestMaster => "Contest Master",
            Self::SpeedSolver => "Speed Solver",
            Self::ConsistencyKing => "Consistency King",
        }
    }
}

/// One point of a student's cumulative performance series, taken at a contest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformancePoint {
    pub date: DateTime<Utc>,
    pub rating: i32,
    pub problems_solved: u32,
    pub contests_participated: u32,
}

/// Persisted student profile. Owned by the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub handle: String,
    pub department: String,
    pub year: i32,
    pub current_rating: i32,
    pub max_rating: i32,
    pub total_problems_solved: u32,
    pub current_streak: u32,
    pub max_streak: u32,
    pub last_active_date: Option<DateTime<Utc>>,
    pub average_rating_change: f64,
    pub contest_participation_rate: f64,
    pub problem_solving_rate: f64,
    pub achievements: BTreeSet<Achievement>,
    pub performance_history: Vec<PerformancePoint>,
    pub email_reminders_enabled: bool,
    pub reminder_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Administrator-supplied fields for creating a student.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewStudent {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub handle: String,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub email_reminders_enabled: Option<bool>,
}

impl NewStudent {
    /// Names of required fields that are blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("name", &self.name),
            ("email", &self.email),
            ("phone", &self.phone),
            ("handle", &self.handle),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
        .collect()
    }

    pub fn into_student(self, id: Uuid, created_at: DateTime<Utc>) -> Student {
        Student {
            id,
            name: self.name.trim().to_string(),
            email: self.email.trim().to_string(),
            phone: self.phone.trim().to_string(),
            handle: self.handle.trim().to_string(),
            department: self
                .department
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| DEFAULT_DEPARTMENT.to_string()),
            year: self.year.unwrap_or(1),
            current_rating: 0,
            max_rating: 0,
            total_problems_solved: 0,
            current_streak: 0,
            max_streak: 0,
            last_active_date: None,
            average_rating_change: 0.0,
            contest_participation_rate: 0.0,
            problem_solving_rate: 0.0,
            achievements: BTreeSet::new(),
            performance_history: Vec::new(),
            email_reminders_enabled: self.email_reminders_enabled.unwrap_or(true),
            reminder_count: 0,
            created_at,
            last_updated: None,
        }
    }
}

/// Administrator edits to an existing student. Absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudentUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub email_reminders_enabled: Option<bool>,
}

impl StudentUpdate {
    /// Required fields present in the update but blank.
    pub fn blank_fields(&self) -> Vec<&'static str> {
        [
            ("name", &self.name),
            ("email", &self.email),
            ("phone", &self.phone),
            ("handle", &self.handle),
        ]
        .into_iter()
        .filter(|(_, value)| value.as_deref().is_some_and(|v| v.trim().is_empty()))
        .map(|(field, _)| field)
        .collect()
    }

    /// Writes the present fields onto `student`. Returns whether the handle changed.
    pub fn apply(self, student: &mut Student) -> bool {
        let trimmed = |value: String| value.trim().to_string();
        if let Some(name) = self.name {
            student.name = trimmed(name);
        }
        if let Some(email) = self.email {
            student.email = trimmed(email);
        }
        if let Some(phone) = self.phone {
            student.phone = trimmed(phone);
        }
        if let Some(department) = self.department.map(trimmed).filter(|d| !d.is_empty()) {
            student.department = department;
        }
        if let Some(year) = self.year {
            student.year = year;
        }
        if let Some(enabled) = self.email_reminders_enabled {
            student.email_reminders_enabled = enabled;
        }
        match self.handle.map(trimmed) {
            Some(handle) if handle != student.handle => {
                student.handle = handle;
                true
            }
            _ => false,
        }
    }
}

/// One rated contest for one student. Unique per `(student_id, contest_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub contest_id: i64,
    pub contest_name: String,
    pub rank: i64,
    pub old_rating: i32,
    pub new_rating: i32,
    /// Not derivable from the rating feed; left unset until a per-contest source exists.
    pub problems_solved: Option<u32>,
    pub problems_unsolved: Option<u32>,
    pub contest_date: DateTime<Utc>,
}

impl ContestRecord {
    pub fn rating_change(&self) -> i32 {
        self.new_rating - self.old_rating
    }
}

/// One solved problem for one student. Unique per `(student_id, problem_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub problem_id: String,
    pub problem_name: String,
    pub rating: Option<i32>,
    pub tags: Vec<String>,
    pub solved_date: DateTime<Utc>,
    pub submission_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailKind {
    InactivityReminder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailStatus {
    Sent,
    Failed,
}

/// Audit row for every outbound mail attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailLogEntry {
    pub id: Uuid,
    pub student_id: Uuid,
    pub kind: EmailKind,
    pub status: EmailStatus,
    pub error_message: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Profile snapshot as reported by the judge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub handle: String,
    /// Unrated accounts report no rating.
    pub current_rating: Option<i32>,
    pub max_rating: Option<i32>,
}

/// One entry of a handle's rating history, in the judge's chronological order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingChange {
    pub contest_id: i64,
    pub contest_name: String,
    pub rank: i64,
    pub old_rating: i32,
    pub new_rating: i32,
    pub timestamp: DateTime<Utc>,
}

/// One submission of a handle, newest first as the judge returns them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: i64,
    pub problem_contest_id: i64,
    pub problem_index: String,
    pub problem_name: String,
    pub problem_rating: Option<i32>,
    pub tags: Vec<String>,
    /// Absent while the submission is still being judged.
    pub verdict: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Submission {
    pub fn problem_id(&self) -> String {
        format!("{}-{}", self.problem_contest_id, self.problem_index)
    }

    pub fn is_accepted(&self) -> bool {
        self.verdict.as_deref() == Some(ACCEPTED_VERDICT)
    }
}

/// Everything fetched from the judge for one handle in one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedProfileData {
    pub profile: Profile,
    pub rating_history: Vec<RatingChange>,
    pub submissions: Vec<Submission>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn achievement_codes_round_trip_through_serde() {
        for achievement in Achievement::ALL {
            let json = serde_json::to_string(&achievement).unwrap();
            assert_eq!(json, format!("\"{}\"", achievement.code()));
            let back: Achievement = serde_json::from_str(&json).unwrap();
            assert_eq!(back, achievement);
        }
    }

    #[test]
    fn update_keeps_absent_fields_and_reports_handle_change() {
        let mut student = NewStudent {
            name: "Ada".into(),
            email: "ada@example.com".into(),
            phone: "555-0101".into(),
            handle: "ada_l".into(),
            ..Default::default()
        }
        .into_student(Uuid::nil(), Utc::now());

        let same_handle = StudentUpdate {
            department: Some(" Mathematics ".into()),
            handle: Some("ada_l".into()),
            ..Default::default()
        };
        assert!(same_handle.blank_fields().is_empty());
        assert!(!same_handle.apply(&mut student));
        assert_eq!(student.department, "Mathematics");
        assert_eq!(student.email, "ada@example.com");

        let renamed = StudentUpdate {
            handle: Some(" ada_lovelace ".into()),
            ..Default::default()
        };
        assert!(renamed.apply(&mut student));
        assert_eq!(student.handle, "ada_lovelace");

        let blank = StudentUpdate {
            email: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(blank.blank_fields(), vec!["email"]);
    }

    #[test]
    fn problem_id_joins_contest_and_index() {
        let sub = Submission {
            submission_id: 1,
            problem_contest_id: 1850,
            problem_index: "C2".into(),
            problem_name: "Sums".into(),
            problem_rating: Some(1200),
            tags: vec![],
            verdict: Some("OK".into()),
            timestamp: Utc::now(),
        };
        assert_eq!(sub.problem_id(), "1850-C2");
        assert!(sub.is_accepted());
    }

    #[test]
    fn new_student_reports_blank_required_fields() {
        let draft = NewStudent {
            name: "Ada".into(),
            email: " ".into(),
            handle: "ada_l".into(),
            ..Default::default()
        };
        assert_eq!(draft.missing_fields(), vec!["email", "phone"]);
    }

    #[test]
    fn new_student_defaults_department_and_reminders() {
        let student = NewStudent {
            name: "Ada".into(),
            email: "ada@example.com".into(),
            phone: "555".into(),
            handle: " ada_l ".into(),
            department: Some("   ".into()),
            ..Default::default()
        }
        .into_student(Uuid::new_v4(), Utc::now());
        assert_eq!(student.handle, "ada_l");
        assert_eq!(student.department, DEFAULT_DEPARTMENT);
        assert!(student.email_reminders_enabled);
        assert!(student.achievements.is_empty());
    }
}
