//! Derived analytics over persisted contest/problem history.
//!
//! Everything here is a pure function of its inputs; callers load records from the
//! store and pass an explicit `now` where time matters.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use cftrack_core::{Achievement, ContestRecord, PerformancePoint, ProblemRecord, Student};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cftrack-analytics";

pub const DEFAULT_LEADERBOARD_SIZE: usize = 10;

const DAYS_PER_MONTH: i64 = 30;
const SPEED_SOLVER_DAILY_PROBLEMS: usize = 5;
const CONTEST_MASTER_CONTESTS: usize = 10;
const CONSISTENCY_MONTHS: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakSummary {
    pub current_streak: u32,
    pub max_streak: u32,
    pub last_active_date: Option<DateTime<Utc>>,
    pub total_problems: usize,
}

/// Walks solve dates newest first; a gap of at most one whole day extends the run.
///
/// The current streak is the run that contains the most recent solve, counted only
/// when that solve happened within the last day.
pub fn compute_streak(problems: &[ProblemRecord], now: DateTime<Utc>) -> StreakSummary {
    let mut dates = problems.iter().map(|p| p.solved_date).collect::<Vec<_>>();
    dates.sort_unstable_by(|a, b| b.cmp(a));

    let Some(&latest) = dates.first() else {
        return StreakSummary {
            current_streak: 0,
            max_streak: 0,
            last_active_date: None,
            total_problems: 0,
        };
    };

    let mut run = 1u32;
    let mut max_streak = 1u32;
    let mut leading_run = 1u32;
    let mut leading_open = true;

    for pair in dates.windows(2) {
        let gap_days = (pair[0] - pair[1]).num_days();
        if gap_days <= 1 {
            run += 1;
        } else {
            run = 1;
            leading_open = false;
        }
        if leading_open {
            leading_run = run;
        }
        max_streak = max_streak.max(run);
    }

    let current_streak = if (now - latest).num_days() <= 0 {
        leading_run
    } else {
        0
    };

    StreakSummary {
        current_streak,
        max_streak,
        last_active_date: Some(latest),
        total_problems: dates.len(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub average_rating_change: f64,
    /// Contests per 30-day month over the span between first and last contest.
    pub contest_participation_rate: f64,
    /// Solved problems per 30-day month over the same span.
    pub problem_solving_rate: f64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Span between earliest and latest contest in 30-day months; zero without contests.
fn months_between_contests(contests: &[ContestRecord]) -> f64 {
    let earliest = contests.iter().map(|c| c.contest_date).min();
    let latest = contests.iter().map(|c| c.contest_date).max();
    match (earliest, latest) {
        (Some(first), Some(last)) => {
            (last - first).num_seconds() as f64 / Duration::days(DAYS_PER_MONTH).num_seconds() as f64
        }
        _ => 0.0,
    }
}

pub fn performance_metrics(contests: &[ContestRecord], problems: &[ProblemRecord]) -> PerformanceMetrics {
    if contests.is_empty() {
        return PerformanceMetrics {
            average_rating_change: 0.0,
            contest_participation_rate: 0.0,
            problem_solving_rate: 0.0,
        };
    }

    let total_change: i64 = contests.iter().map(|c| i64::from(c.rating_change())).sum();
    let average_rating_change = total_change as f64 / contests.len() as f64;

    let months = months_between_contests(contests);
    let (contest_rate, problem_rate) = if months > 0.0 {
        (
            contests.len() as f64 / months,
            problems.len() as f64 / months,
        )
    } else {
        (0.0, 0.0)
    };

    PerformanceMetrics {
        average_rating_change: round2(average_rating_change),
        contest_participation_rate: round2(contest_rate),
        problem_solving_rate: round2(problem_rate),
    }
}

/// One point per contest in chronological order, with cumulative solve and contest counts.
pub fn performance_history(
    contests: &[ContestRecord],
    problems: &[ProblemRecord],
) -> Vec<PerformancePoint> {
    let mut ordered = contests.iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| {
        a.contest_date
            .cmp(&b.contest_date)
            .then(a.contest_id.cmp(&b.contest_id))
    });

    let mut solve_dates = problems.iter().map(|p| p.solved_date).collect::<Vec<_>>();
    solve_dates.sort_unstable();

    ordered
        .into_iter()
        .enumerate()
        .map(|(idx, contest)| {
            let solved = solve_dates.partition_point(|d| *d <= contest.contest_date);
            PerformancePoint {
                date: contest.contest_date,
                rating: contest.new_rating,
                problems_solved: solved as u32,
                contests_participated: idx as u32 + 1,
            }
        })
        .collect()
}

/// Aggregate state the achievement table is checked against.
#[derive(Debug, Clone, Copy)]
pub struct AchievementInput<'a> {
    pub current_rating: i32,
    pub current_streak: u32,
    pub total_problems_solved: u32,
    pub contests: &'a [ContestRecord],
    pub problems: &'a [ProblemRecord],
    pub held: &'a BTreeSet<Achievement>,
    pub now: DateTime<Utc>,
}

fn has_speed_solving_day(problems: &[ProblemRecord]) -> bool {
    let mut per_day: HashMap<NaiveDate, usize> = HashMap::new();
    for problem in problems {
        *per_day.entry(problem.solved_date.date_naive()).or_default() += 1;
    }
    per_day
        .values()
        .any(|count| *count >= SPEED_SOLVER_DAILY_PROBLEMS)
}

fn months_since_first_contest(contests: &[ContestRecord], now: DateTime<Utc>) -> Option<f64> {
    let first = contests.iter().map(|c| c.contest_date).min()?;
    Some((now - first).num_seconds() as f64 / Duration::days(DAYS_PER_MONTH).num_seconds() as f64)
}

/// Returns the achievements earned by `input` that are not already held.
pub fn evaluate_achievements(input: &AchievementInput<'_>) -> Vec<Achievement> {
    let contest_count = input.contests.len();
    let checks = [
        (Achievement::Rating1000, input.current_rating >= 1000),
        (Achievement::Rating1500, input.current_rating >= 1500),
        (Achievement::Rating2000, input.current_rating >= 2000),
        (Achievement::Streak7, input.current_streak >= 7),
        (Achievement::Streak30, input.current_streak >= 30),
        (Achievement::Problems50, input.total_problems_solved >= 50),
        (Achievement::Problems100, input.total_problems_solved >= 100),
        (Achievement::Problems200, input.total_problems_solved >= 200),
        (
            Achievement::ContestMaster,
            contest_count >= CONTEST_MASTER_CONTESTS,
        ),
        (Achievement::SpeedSolver, has_speed_solving_day(input.problems)),
        (
            Achievement::ConsistencyKing,
            months_since_first_contest(input.contests, input.now)
                .is_some_and(|months| months >= CONSISTENCY_MONTHS),
        ),
        (Achievement::FirstContest, contest_count > 0),
    ];

    checks
        .into_iter()
        .filter(|(achievement, earned)| *earned && !input.held.contains(achievement))
        .map(|(achievement, _)| achievement)
        .collect()
}

/// Union of held and newly earned achievements; never drops a held code.
pub fn merge_achievements(
    held: &BTreeSet<Achievement>,
    earned: &[Achievement],
) -> BTreeSet<Achievement> {
    held.iter().chain(earned.iter()).copied().collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub rank: usize,
    pub student_id: Uuid,
    pub name: String,
    pub handle: String,
    pub current_rating: i32,
    pub max_rating: i32,
    pub total_problems_solved: u32,
    pub current_streak: u32,
    pub department: String,
}

/// Top `limit` students by current rating.
///
/// Ties keep creation order: the sort is stable over `students`, which the store
/// returns oldest first, and equal ratings are further ordered by `created_at`.
pub fn leaderboard(students: &[Student], limit: usize) -> Vec<LeaderboardRow> {
    let mut ordered = students.iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| {
        b.current_rating
            .cmp(&a.current_rating)
            .then(a.created_at.cmp(&b.created_at))
    });
    ordered
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(idx, s)| LeaderboardRow {
            rank: idx + 1,
            student_id: s.id,
            name: s.name.clone(),
            handle: s.handle.clone(),
            current_rating: s.current_rating,
            max_rating: s.max_rating,
            total_problems_solved: s.total_problems_solved,
            current_streak: s.current_streak,
            department: s.department.clone(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepartmentStats {
    pub department: String,
    pub count: usize,
    pub avg_rating: i64,
    pub avg_problems: i64,
    pub total_problems: u64,
}

#[derive(Default)]
struct DepartmentAccumulator {
    count: usize,
    rating_sum: i64,
    problems_sum: u64,
}

/// Per-department aggregates ordered by mean rating, highest first.
pub fn department_stats(students: &[Student]) -> Vec<DepartmentStats> {
    let mut groups: BTreeMap<&str, DepartmentAccumulator> = BTreeMap::new();
    for student in students {
        let acc = groups.entry(student.department.as_str()).or_default();
        acc.count += 1;
        acc.rating_sum += i64::from(student.current_rating);
        acc.problems_sum += u64::from(student.total_problems_solved);
    }

    let mut stats = groups
        .into_iter()
        .map(|(department, acc)| {
            let count = acc.count as f64;
            DepartmentStats {
                department: department.to_string(),
                count: acc.count,
                avg_rating: (acc.rating_sum as f64 / count).round() as i64,
                avg_problems: (acc.problems_sum as f64 / count).round() as i64,
                total_problems: acc.problems_sum,
            }
        })
        .collect::<Vec<_>>();
    // BTreeMap iteration already orders ties by department name.
    stats.sort_by(|a, b| b.avg_rating.cmp(&a.avg_rating));
    stats
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopPerformer {
    pub student_id: Uuid,
    pub name: String,
    pub rating: i32,
    pub problems: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_students: usize,
    pub total_problems_solved: u64,
    pub average_rating: i64,
    pub top_performer: Option<TopPerformer>,
}

pub fn global_stats(students: &[Student]) -> GlobalStats {
    let total_problems_solved = students
        .iter()
        .map(|s| u64::from(s.total_problems_solved))
        .sum();
    let average_rating = if students.is_empty() {
        0
    } else {
        let sum: i64 = students.iter().map(|s| i64::from(s.current_rating)).sum();
        (sum as f64 / students.len() as f64).round() as i64
    };
    let top_performer = leaderboard(students, 1).into_iter().next().map(|row| TopPerformer {
        student_id: row.student_id,
        name: row.name,
        rating: row.current_rating,
        problems: row.total_problems_solved,
    });
    GlobalStats {
        total_students: students.len(),
        total_problems_solved,
        average_rating,
        top_performer,
    }
}

/// Streak, rate metrics and history for one student, as served on the read path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentAnalytics {
    pub streak: StreakSummary,
    pub performance: PerformanceMetrics,
    pub history: Vec<PerformancePoint>,
}

pub fn student_analytics(
    contests: &[ContestRecord],
    problems: &[ProblemRecord],
    now: DateTime<Utc>,
) -> StudentAnalytics {
    StudentAnalytics {
        streak: compute_streak(problems, now),
        performance: performance_metrics(contests, problems),
        history: performance_history(contests, problems),
    }
}
