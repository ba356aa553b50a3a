use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::Submission;
use crate::verdict::{FailingCase, Status, Verdict};

/// One judged submission as kept in the submitter's history
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    pub problem_id: String,
    pub problem_name: String,
    pub status: Status,
    pub message: Option<String>,
    pub submitted_at: String,
    pub elapsed_ms: u64,
    pub source_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_case: Option<FailingCase>,
}

impl SubmissionRecord {
    pub fn new(
        submission: &Submission,
        problem_name: &str,
        verdict: &Verdict,
        submitted_at: String,
    ) -> Self {
        Self {
            problem_id: submission.problem_id.clone(),
            problem_name: problem_name.to_string(),
            status: verdict.status,
            message: verdict.message.clone(),
            submitted_at,
            elapsed_ms: verdict.elapsed_ms,
            source_code: submission.source_code.clone(),
            failing_case: verdict.failing_case.clone(),
        }
    }
}

/// Judging-related part of a user's profile
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserJudgingStats {
    pub problems_solved: BTreeSet<String>,
    pub problems_attempted: BTreeSet<String>,
    pub solved_count: u64,
    pub attempted_count: u64,
}

impl UserJudgingStats {
    /// Folds one verdict into the stats
    ///
    /// Accepted adds the problem to the solved set at most once, bumping the
    /// counter only on first insertion; every other status is an idempotent
    /// insert into the attempted set. Returns whether the stats changed.
    pub fn merge(&mut self, problem_id: &str, status: Status) -> bool {
        let (set, count) = if status == Status::Accepted {
            (&mut self.problems_solved, &mut self.solved_count)
        } else {
            (&mut self.problems_attempted, &mut self.attempted_count)
        };
        let inserted = set.insert(problem_id.to_string());
        if inserted {
            *count += 1;
        }
        inserted
    }
}

/// A value together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// 0 means nothing has been stored yet
    pub version: u64,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { version: u64 },
    /// Someone else wrote the user record since it was loaded
    Conflict,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed stored data: {0}")]
    Malformed(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable per-user judging state: an append-only history plus versioned stats
///
/// `commit` must apply the appended record and the new stats as one unit, and
/// only if the stored version still equals `expected_version`.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn load_stats(&self, submitter_id: &str) -> Result<Versioned<UserJudgingStats>, StoreError>;

    async fn commit(
        &self,
        submitter_id: &str,
        expected_version: u64,
        record: &SubmissionRecord,
        stats: &UserJudgingStats,
    ) -> Result<CommitOutcome, StoreError>;

    /// Records of one user for one problem, oldest first
    async fn submissions(
        &self,
        submitter_id: &str,
        problem_id: &str,
    ) -> Result<Vec<SubmissionRecord>, StoreError>;
}

#[derive(Default)]
struct UserDocument {
    version: u64,
    stats: UserJudgingStats,
    history: Vec<SubmissionRecord>,
}

/// Process-local store, used when no database is configured and in tests
///
/// Offers hooks to make upcoming commits fail or conflict so the
/// recorder's retry path can be exercised.
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<String, UserDocument>>,
    failing_commits: AtomicU32,
    conflicting_commits: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` commits fail with `StoreError::Unavailable`
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// The next `n` commits behave as if another writer got there first
    pub fn conflict_next_commits(&self, n: u32) {
        self.conflicting_commits.store(n, Ordering::SeqCst);
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn load_stats(&self, submitter_id: &str) -> Result<Versioned<UserJudgingStats>, StoreError> {
        let users = self.users.lock();
        Ok(users
            .get(submitter_id)
            .map(|doc| Versioned {
                version: doc.version,
                value: doc.stats.clone(),
            })
            .unwrap_or(Versioned {
                version: 0,
                value: UserJudgingStats::default(),
            }))
    }

    async fn commit(
        &self,
        submitter_id: &str,
        expected_version: u64,
        record: &SubmissionRecord,
        stats: &UserJudgingStats,
    ) -> Result<CommitOutcome, StoreError> {
        if Self::take_one(&self.failing_commits) {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }

        let mut users = self.users.lock();
        let doc = users.entry(submitter_id.to_string()).or_default();
        if Self::take_one(&self.conflicting_commits) {
            doc.version += 1;
        }
        if doc.version != expected_version {
            return Ok(CommitOutcome::Conflict);
        }

        doc.version += 1;
        doc.stats = stats.clone();
        doc.history.push(record.clone());
        Ok(CommitOutcome::Committed {
            version: doc.version,
        })
    }

    async fn submissions(
        &self,
        submitter_id: &str,
        problem_id: &str,
    ) -> Result<Vec<SubmissionRecord>, StoreError> {
        let users = self.users.lock();
        Ok(users
            .get(submitter_id)
            .map(|doc| {
                doc.history
                    .iter()
                    .filter(|r| r.problem_id == problem_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(problem_id: &str, status: Status) -> SubmissionRecord {
        SubmissionRecord {
            problem_id: problem_id.to_string(),
            problem_name: "Add".to_string(),
            status,
            message: None,
            submitted_at: crate::create_timestamp(),
            elapsed_ms: 1,
            source_code: "function add(a,b){return a+b}".to_string(),
            failing_case: None,
        }
    }

    #[test]
    fn solved_is_counted_once_per_problem() {
        let mut stats = UserJudgingStats::default();
        assert!(stats.merge("add", Status::Accepted));
        assert!(!stats.merge("add", Status::Accepted));
        assert_eq!(stats.solved_count, 1);
        assert_eq!(stats.problems_solved.len(), 1);
    }

    #[test]
    fn attempted_and_solved_may_overlap() {
        let mut stats = UserJudgingStats::default();
        stats.merge("add", Status::WrongAnswer);
        stats.merge("add", Status::RuntimeError);
        stats.merge("add", Status::Accepted);
        assert_eq!(stats.attempted_count, 1);
        assert_eq!(stats.solved_count, 1);
        assert!(stats.problems_attempted.contains("add"));
        assert!(stats.problems_solved.contains("add"));
    }

    #[tokio::test]
    async fn memory_store_checks_versions() {
        let store = MemoryStore::new();
        let loaded = store.load_stats("u1").await.unwrap();
        assert_eq!(loaded.version, 0);

        let mut stats = loaded.value.clone();
        stats.merge("add", Status::Accepted);
        let first = store
            .commit("u1", 0, &record("add", Status::Accepted), &stats)
            .await
            .unwrap();
        assert_eq!(first, CommitOutcome::Committed { version: 1 });

        let stale = store
            .commit("u1", 0, &record("add", Status::Accepted), &stats)
            .await
            .unwrap();
        assert_eq!(stale, CommitOutcome::Conflict);

        let history = store.submissions("u1", "add").await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(store.submissions("u1", "other").await.unwrap().is_empty());
        assert_eq!(store.load_stats("u1").await.unwrap().value, stats);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);
        let stats = UserJudgingStats::default();
        let rec = record("add", Status::WrongAnswer);
        assert!(store.commit("u1", 0, &rec, &stats).await.is_err());
        assert!(store.commit("u1", 0, &rec, &stats).await.is_ok());
    }
}
