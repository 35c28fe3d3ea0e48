use std::collections::BTreeMap;

use cftrack_core::{ContestRecord, FetchedProfileData, ProblemRecord, RatingChange, Student, Submission};
use cftrack_storage::{RecordStore, StoreError};
use tracing::{debug, warn};
use uuid::Uuid;

/// What one reconciliation pass created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub new_contests: Vec<ContestRecord>,
    pub new_problems: Vec<ProblemRecord>,
    /// Distinct accepted problem ids in the fetched submission set.
    pub distinct_solved: u32,
    /// Per-entity lookups or writes that failed and were skipped.
    pub failed_writes: usize,
}

/// Earliest accepted submission per derived problem id.
///
/// Ties on timestamp fall back to the lower submission id so the winner does not
/// depend on input order.
pub fn earliest_accepted(submissions: &[Submission]) -> BTreeMap<String, &Submission> {
    submissions
        .iter()
        .filter(|s| s.is_accepted())
        .fold(BTreeMap::<String, &Submission>::new(), |mut winners, candidate| {
            winners
                .entry(candidate.problem_id())
                .and_modify(|current| {
                    if (candidate.timestamp, candidate.submission_id)
                        < (current.timestamp, current.submission_id)
                    {
                        *current = candidate;
                    }
                })
                .or_insert(candidate);
            winners
        })
}

/// Applies the fetched profile to the student's rating fields in place.
///
/// `max_rating` only ever grows; the judge's own max is preferred and the current
/// rating stands in when the judge reports none.
pub fn apply_profile(student: &mut Student, data: &FetchedProfileData, distinct_solved: u32) {
    let current = data.profile.current_rating.unwrap_or(0);
    let reported_max = data.profile.max_rating.unwrap_or(current);
    student.current_rating = current;
    student.max_rating = student.max_rating.max(reported_max);
    student.total_problems_solved = distinct_solved;
}

fn contest_record(student_id: Uuid, change: &RatingChange) -> ContestRecord {
    ContestRecord {
        id: Uuid::new_v4(),
        student_id,
        contest_id: change.contest_id,
        contest_name: change.contest_name.clone(),
        rank: change.rank,
        old_rating: change.old_rating,
        new_rating: change.new_rating,
        problems_solved: None,
        problems_unsolved: None,
        contest_date: change.timestamp,
    }
}

fn problem_record(student_id: Uuid, submission: &Submission) -> ProblemRecord {
    ProblemRecord {
        id: Uuid::new_v4(),
        student_id,
        problem_id: submission.problem_id(),
        problem_name: submission.problem_name.clone(),
        rating: submission.problem_rating,
        tags: submission.tags.clone(),
        solved_date: submission.timestamp,
        submission_id: submission.submission_id,
    }
}

/// Merges fetched contests and solves into the store, then updates `student`'s
/// rating fields in memory. The caller persists the student.
///
/// A per-entity failure is logged and skipped. A unique-key conflict on insert means
/// a concurrent writer got there first and counts as neither created nor failed.
pub async fn reconcile(
    store: &dyn RecordStore,
    student: &mut Student,
    data: &FetchedProfileData,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    for change in &data.rating_history {
        match store.find_contest(student.id, change.contest_id).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(err) => {
                warn!(student_id = %student.id, contest_id = change.contest_id, error = %err, "contest lookup failed; skipping");
                outcome.failed_writes += 1;
                continue;
            }
        }
        let record = contest_record(student.id, change);
        match store.insert_contest(&record).await {
            Ok(()) => outcome.new_contests.push(record),
            Err(StoreError::Conflict(detail)) => {
                debug!(student_id = %student.id, %detail, "contest already recorded");
            }
            Err(err) => {
                warn!(student_id = %student.id, contest_id = change.contest_id, error = %err, "contest insert failed; skipping");
                outcome.failed_writes += 1;
            }
        }
    }

    let winners = earliest_accepted(&data.submissions);
    outcome.distinct_solved = u32::try_from(winners.len()).unwrap_or(u32::MAX);

    for (problem_id, submission) in &winners {
        match store.find_problem(student.id, problem_id).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(err) => {
                warn!(student_id = %student.id, %problem_id, error = %err, "problem lookup failed; skipping");
                outcome.failed_writes += 1;
                continue;
            }
        }
        let record = problem_record(student.id, submission);
        match store.insert_problem(&record).await {
            Ok(()) => outcome.new_problems.push(record),
            Err(StoreError::Conflict(detail)) => {
                debug!(student_id = %student.id, %detail, "problem already recorded");
            }
            Err(err) => {
                warn!(student_id = %student.id, %problem_id, error = %err, "problem insert failed; skipping");
                outcome.failed_writes += 1;
            }
        }
    }

    apply_profile(student, data, outcome.distinct_solved);
    outcome
}
