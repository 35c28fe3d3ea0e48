use std::collections::BTreeMap;

use async_trait::async_trait;
use cftrack_core::{ContestRecord, EmailLogEntry, NewStudent, ProblemRecord, Student};
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{validate_new_student, RecordStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct MemoryState {
    /// Creation order is insertion order.
    students: Vec<Student>,
    contests: BTreeMap<(Uuid, i64), ContestRecord>,
    problems: BTreeMap<(Uuid, String), ProblemRecord>,
    emails: Vec<EmailLogEntry>,
}

/// In-process record store with the same unique-key and cascade semantics as
/// [`crate::PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Mirrors the `students` unique indexes: handle (case-insensitive), email, phone.
fn unique_violation(
    students: &[Student],
    id: Option<Uuid>,
    handle: &str,
    email: &str,
    phone: &str,
) -> Option<StoreError> {
    let others = students.iter().filter(|s| Some(s.id) != id);
    for other in others {
        if other.handle.eq_ignore_ascii_case(handle) {
            return Some(StoreError::Conflict(format!("handle {handle} already registered")));
        }
        if other.email == email {
            return Some(StoreError::Conflict(format!("email {email} already registered")));
        }
        if other.phone == phone {
            return Some(StoreError::Conflict(format!("phone {phone} already registered")));
        }
    }
    None
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list_students(&self) -> StoreResult<Vec<Student>> {
        Ok(self.state.read().await.students.clone())
    }

    async fn get_student(&self, id: Uuid) -> StoreResult<Option<Student>> {
        let state = self.state.read().await;
        Ok(state.students.iter().find(|s| s.id == id).cloned())
    }

    async fn insert_student(&self, draft: NewStudent) -> StoreResult<Student> {
        validate_new_student(&draft)?;
        let mut state = self.state.write().await;
        let student = draft.into_student(Uuid::new_v4(), Utc::now());
        if let Some(err) = unique_violation(
            &state.students,
            None,
            &student.handle,
            &student.email,
            &student.phone,
        ) {
            return Err(err);
        }
        state.students.push(student.clone());
        Ok(student)
    }

    async fn update_student(&self, student: &Student) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(err) = unique_violation(
            &state.students,
            Some(student.id),
            &student.handle,
            &student.email,
            &student.phone,
        ) {
            return Err(err);
        }
        let slot = state
            .students
            .iter_mut()
            .find(|s| s.id == student.id)
            .ok_or_else(|| StoreError::NotFound(format!("student {}", student.id)))?;
        *slot = student.clone();
        Ok(())
    }

    async fn delete_student(&self, id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let before = state.students.len();
        state.students.retain(|s| s.id != id);
        if state.students.len() == before {
            return Ok(false);
        }
        state.contests.retain(|(student_id, _), _| *student_id != id);
        state.problems.retain(|(student_id, _), _| *student_id != id);
        state.emails.retain(|entry| entry.student_id != id);
        Ok(true)
    }

    async fn find_contest(
        &self,
        student_id: Uuid,
        contest_id: i64,
    ) -> StoreResult<Option<ContestRecord>> {
        let state = self.state.read().await;
        Ok(state.contests.get(&(student_id, contest_id)).cloned())
    }

    async fn insert_contest(&self, contest: &ContestRecord) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let key = (contest.student_id, contest.contest_id);
        if state.contests.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "contest {} for student {}",
                contest.contest_id, contest.student_id
            )));
        }
        state.contests.insert(key, contest.clone());
        Ok(())
    }

    async fn list_contests(&self, student_id: Uuid) -> StoreResult<Vec<ContestRecord>> {
        let state = self.state.read().await;
        let mut contests = state
            .contests
            .values()
            .filter(|c| c.student_id == student_id)
            .cloned()
            .collect::<Vec<_>>();
        contests.sort_by_key(|c| c.contest_date);
        Ok(contests)
    }

    async fn find_problem(
        &self,
        student_id: Uuid,
        problem_id: &str,
    ) -> StoreResult<Option<ProblemRecord>> {
        let state = self.state.read().await;
        Ok(state
            .problems
            .get(&(student_id, problem_id.to_string()))
            .cloned())
    }

    async fn insert_problem(&self, problem: &ProblemRecord) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let key = (problem.student_id, problem.problem_id.clone());
        if state.problems.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "problem {} for student {}",
                problem.problem_id, problem.student_id
            )));
        }
        state.problems.insert(key, problem.clone());
        Ok(())
    }

    async fn list_problems(&self, student_id: Uuid) -> StoreResult<Vec<ProblemRecord>> {
        let state = self.state.read().await;
        let mut problems = state
            .problems
            .values()
            .filter(|p| p.student_id == student_id)
            .cloned()
            .collect::<Vec<_>>();
        problems.sort_by_key(|p| p.solved_date);
        Ok(problems)
    }

    async fn record_email(&self, entry: &EmailLogEntry) -> StoreResult<()> {
        self.state.write().await.emails.push(entry.clone());
        Ok(())
    }

    async fn list_email_log(&self, student_id: Uuid) -> StoreResult<Vec<EmailLogEntry>> {
        let state = self.state.read().await;
        Ok(state
            .emails
            .iter()
            .filter(|e| e.student_id == student_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cftrack_core::{EmailKind, EmailStatus};
    use chrono::TimeZone;

    fn draft(handle: &str) -> NewStudent {
        NewStudent {
            name: format!("Student {handle}"),
            email: format!("{handle}@example.com"),
            phone: format!("555-{handle}"),
            handle: handle.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn handles_are_unique_case_insensitively() {
        let store = MemoryStore::new();
        store.insert_student(draft("Petr")).await.unwrap();
        let err = store.insert_student(draft("petr")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.list_students().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn contest_insert_is_unique_per_student_and_contest() {
        let store = MemoryStore::new();
        let student = store.insert_student(draft("tourist")).await.unwrap();
        let contest = ContestRecord {
            id: Uuid::new_v4(),
            student_id: student.id,
            contest_id: 1900,
            contest_name: "Round 1900".into(),
            rank: 3,
            old_rating: 3500,
            new_rating: 3550,
            problems_solved: None,
            problems_unsolved: None,
            contest_date: Utc.with_ymd_and_hms(2026, 1, 10, 18, 0, 0).unwrap(),
        };
        store.insert_contest(&contest).await.unwrap();
        let dup = ContestRecord {
            id: Uuid::new_v4(),
            rank: 99,
            ..contest.clone()
        };
        assert!(store.insert_contest(&dup).await.unwrap_err().is_conflict());
        let stored = store.find_contest(student.id, 1900).await.unwrap().unwrap();
        assert_eq!(stored.rank, 3);
    }

    #[tokio::test]
    async fn deleting_a_student_cascades_history() {
        let store = MemoryStore::new();
        let student = store.insert_student(draft("jiangly")).await.unwrap();
        store
            .insert_problem(&ProblemRecord {
                id: Uuid::new_v4(),
                student_id: student.id,
                problem_id: "1-A".into(),
                problem_name: "Theatre Square".into(),
                rating: Some(1000),
                tags: vec!["math".into()],
                solved_date: Utc::now(),
                submission_id: 42,
            })
            .await
            .unwrap();
        store
            .record_email(&EmailLogEntry {
                id: Uuid::new_v4(),
                student_id: student.id,
                kind: EmailKind::InactivityReminder,
                status: EmailStatus::Sent,
                error_message: None,
                sent_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(store.delete_student(student.id).await.unwrap());
        assert!(store.list_problems(student.id).await.unwrap().is_empty());
        assert!(store.list_email_log(student.id).await.unwrap().is_empty());
        assert!(!store.delete_student(student.id).await.unwrap());
    }

    #[tokio::test]
    async fn email_and_phone_are_unique_on_insert_and_update() {
        let store = MemoryStore::new();
        let petr = store.insert_student(draft("Petr")).await.unwrap();
        let same_email = NewStudent {
            email: "Petr@example.com".into(),
            ..draft("benq")
        };
        assert!(store.insert_student(same_email).await.unwrap_err().is_conflict());
        let same_phone = NewStudent {
            phone: " 555-Petr ".into(),
            ..draft("benq")
        };
        assert!(store.insert_student(same_phone).await.unwrap_err().is_conflict());

        let benq = store.insert_student(draft("benq")).await.unwrap();
        let stolen = Student {
            email: petr.email.clone(),
            ..benq.clone()
        };
        assert!(store.update_student(&stolen).await.unwrap_err().is_conflict());
        // a student keeps its own contact details on update
        store.update_student(&benq).await.unwrap();
        assert_eq!(store.list_students().await.unwrap().len(), 2);
    }
}
