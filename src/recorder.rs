use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::config::RecorderConfig;
use crate::engine::Submission;
use crate::store::{CommitOutcome, HistoryStore, StoreError, SubmissionRecord, UserJudgingStats};
use crate::verdict::Verdict;

/// Persisting a judged result failed; the verdict itself is still valid
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("history of {submitter_id} kept changing, gave up after {attempts} attempts")]
    Contention { submitter_id: String, attempts: u32 },
    #[error("store failed after {attempts} attempts: {source}")]
    Store {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl RecorderError {
    /// Persistence can always be attempted again without re-judging
    pub fn retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the base up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&RecorderConfig> for RetryPolicy {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Folds a verdict into the current stats without touching the input
pub fn merge_stats(current: &UserJudgingStats, record: &SubmissionRecord) -> UserJudgingStats {
    let mut next = current.clone();
    next.merge(&record.problem_id, record.status);
    next
}

/// Where a verdict ended up after the recording step
#[derive(Debug)]
pub enum Recorded {
    Persisted(Verdict),
    Pending {
        verdict: Verdict,
        pending_id: String,
        error: RecorderError,
    },
}

impl Recorded {
    pub fn verdict(&self) -> &Verdict {
        match self {
            Recorded::Persisted(verdict) | Recorded::Pending { verdict, .. } => verdict,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRecord {
    submitter_id: String,
    verdict: Verdict,
    record: SubmissionRecord,
}

/// Judged results whose persistence failed, keyed by pending id
#[derive(Default)]
struct PendingRecords {
    next_id: AtomicU64,
    entries: parking_lot::Mutex<HashMap<String, PendingRecord>>,
}

impl PendingRecords {
    fn park(&self, entry: PendingRecord) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending_id = format!("pending-{n}");
        self.entries.lock().insert(pending_id.clone(), entry);
        pending_id
    }

    fn restore(&self, pending_id: &str, entry: PendingRecord) {
        self.entries.lock().insert(pending_id.to_string(), entry);
    }

    fn take(&self, pending_id: &str) -> Option<PendingRecord> {
        self.entries.lock().remove(pending_id)
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

type UserLock = Arc<tokio::sync::Mutex<()>>;

/// The only writer of judged results into per-user durable state
///
/// Writes for the same submitter are serialized through a per-user async
/// mutex; each write is additionally an optimistic read-merge-commit cycle
/// against the store's version so writers in other processes cannot lose
/// updates either.
pub struct Recorder {
    store: Arc<dyn HistoryStore>,
    policy: RetryPolicy,
    locks: parking_lot::Mutex<HashMap<String, UserLock>>,
    pending: PendingRecords,
}

impl Recorder {
    pub fn new(store: Arc<dyn HistoryStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            locks: parking_lot::Mutex::new(HashMap::new()),
            pending: PendingRecords::default(),
        }
    }

    /// Builds the history record for a fresh verdict and persists it
    ///
    /// When persistence keeps failing the record is parked, and the returned
    /// pending id can be handed to [`Recorder::retry_pending`] later.
    pub async fn record(
        &self,
        submission: &Submission,
        problem_name: &str,
        verdict: Verdict,
    ) -> Recorded {
        let record = SubmissionRecord::new(
            submission,
            problem_name,
            &verdict,
            crate::create_timestamp(),
        );
        match self.persist(&submission.submitter_id, &record).await {
            Ok(_) => Recorded::Persisted(verdict),
            Err(error) => {
                let pending_id = self.pending.park(PendingRecord {
                    submitter_id: submission.submitter_id.clone(),
                    verdict: verdict.clone(),
                    record,
                });
                log::warn!(
                    "Verdict of {} parked as pending {pending_id}: {error}",
                    submission.submitter_id
                );
                Recorded::Pending {
                    verdict,
                    pending_id,
                    error,
                }
            }
        }
    }

    /// Retries the persistence step of a parked verdict without re-judging
    ///
    /// Returns `None` for an unknown id, including one already persisted.
    pub async fn retry_pending(&self, pending_id: &str) -> Option<Recorded> {
        let entry = self.pending.take(pending_id)?;
        match self.persist(&entry.submitter_id, &entry.record).await {
            Ok(_) => {
                log::info!("Pending {pending_id} of {} persisted", entry.submitter_id);
                Some(Recorded::Persisted(entry.verdict))
            }
            Err(error) => {
                let verdict = entry.verdict.clone();
                self.pending.restore(pending_id, entry);
                Some(Recorded::Pending {
                    verdict,
                    pending_id: pending_id.to_string(),
                    error,
                })
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Appends `record` to the submitter's history and merges it into their
    /// stats, returning the new version of the user record
    pub async fn persist(
        &self,
        submitter_id: &str,
        record: &SubmissionRecord,
    ) -> Result<u64, RecorderError> {
        let lock = self.user_lock(submitter_id);
        let result = {
            let _guard = lock.lock().await;
            self.commit_with_retry(submitter_id, record).await
        };
        self.release_user_lock(submitter_id, lock);
        result
    }

    pub async fn history(
        &self,
        submitter_id: &str,
        problem_id: &str,
    ) -> Result<Vec<SubmissionRecord>, StoreError> {
        self.store.submissions(submitter_id, problem_id).await
    }

    pub async fn stats(&self, submitter_id: &str) -> Result<UserJudgingStats, StoreError> {
        Ok(self.store.load_stats(submitter_id).await?.value)
    }

    async fn commit_with_retry(
        &self,
        submitter_id: &str,
        record: &SubmissionRecord,
    ) -> Result<u64, RecorderError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_commit(submitter_id, record).await {
                Ok(CommitOutcome::Committed { version }) => {
                    log::debug!(
                        "Recorded {} for {submitter_id} at version {version} (attempt {attempt})",
                        record.status.as_str()
                    );
                    return Ok(version);
                }
                Ok(CommitOutcome::Conflict) => {
                    log::debug!("Version conflict for {submitter_id} on attempt {attempt}");
                    if attempt >= self.policy.max_attempts {
                        log::warn!("Giving up recording for {submitter_id} after {attempt} conflicts");
                        return Err(RecorderError::Contention {
                            submitter_id: submitter_id.to_string(),
                            attempts: attempt,
                        });
                    }
                }
                Err(e) => {
                    log::warn!("Recording for {submitter_id} failed on attempt {attempt}: {e}");
                    if attempt >= self.policy.max_attempts {
                        return Err(RecorderError::Store {
                            attempts: attempt,
                            source: e,
                        });
                    }
                }
            }
            tokio::time::sleep(self.policy.backoff(attempt)).await;
        }
    }

    async fn try_commit(
        &self,
        submitter_id: &str,
        record: &SubmissionRecord,
    ) -> Result<CommitOutcome, StoreError> {
        let current = self.store.load_stats(submitter_id).await?;
        let next = merge_stats(&current.value, record);
        self.store
            .commit(submitter_id, current.version, record, &next)
            .await
    }

    fn user_lock(&self, submitter_id: &str) -> UserLock {
        self.locks
            .lock()
            .entry(submitter_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops the map entry once no other task holds or waits on it
    fn release_user_lock(&self, submitter_id: &str, lock: UserLock) {
        let mut locks = self.locks.lock();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(submitter_id);
        }
        drop(lock);
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.locks.lock().len()
    }
}
