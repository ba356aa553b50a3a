use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::catalog::ProblemCatalog;
use crate::engine::{JudgeError, Submission};
use crate::queue::{Job, JobQueue, QueueError};
use crate::recorder::{Recorded, Recorder};
use crate::store::{StoreError, SubmissionRecord, UserJudgingStats};

/// A submission as received from a caller, before the catalog fills in defaults
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRequest {
    pub submitter_id: String,
    pub problem_id: String,
    pub source_code: String,
    pub entry_point_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("problem {0} not found")]
    UnknownProblem(String),
    #[error("pending verdict {0} not found")]
    UnknownPending(String),
    #[error(transparent)]
    Busy(#[from] QueueError),
    #[error("worker dropped the submission")]
    WorkerGone,
    #[error(transparent)]
    Judge(#[from] JudgeError),
}

/// Entry point of the judging engine for any outer surface
pub struct JudgeService {
    catalog: Arc<dyn ProblemCatalog>,
    queue: Arc<JobQueue>,
    recorder: Arc<Recorder>,
}

impl JudgeService {
    pub fn new(
        catalog: Arc<dyn ProblemCatalog>,
        queue: Arc<JobQueue>,
        recorder: Arc<Recorder>,
    ) -> Self {
        Self {
            catalog,
            queue,
            recorder,
        }
    }

    /// Queues a submission and waits for its judged, recorded result
    pub async fn submit(&self, request: SubmissionRequest) -> Result<Recorded, SubmitError> {
        if request.submitter_id.trim().is_empty() {
            return Err(SubmitError::InvalidArgument(
                "submitterId must not be empty".to_string(),
            ));
        }
        let problem = self
            .catalog
            .problem(&request.problem_id)
            .ok_or_else(|| SubmitError::UnknownProblem(request.problem_id.clone()))?;

        let submission = Submission {
            entry_point_name: request
                .entry_point_name
                .unwrap_or_else(|| problem.entry_point.clone()),
            submitter_id: request.submitter_id,
            problem_id: request.problem_id,
            source_code: request.source_code,
        };

        let (job, receiver) = Job::new(submission, problem);
        self.queue.push(job).await.inspect_err(|e| {
            log::warn!("Submission refused: {e}");
        })?;
        log::debug!("Queued submission, {} waiting", self.queue.len().await);

        match receiver.await {
            Ok(result) => Ok(result?),
            Err(_) => {
                log::error!("Worker dropped a submission without answering");
                Err(SubmitError::WorkerGone)
            }
        }
    }

    /// Retries persistence of a verdict that was judged but not recorded
    pub async fn retry_persist(&self, pending_id: &str) -> Result<Recorded, SubmitError> {
        self.recorder
            .retry_pending(pending_id)
            .await
            .ok_or_else(|| SubmitError::UnknownPending(pending_id.to_string()))
    }

    pub async fn history(
        &self,
        submitter_id: &str,
        problem_id: &str,
    ) -> Result<Vec<SubmissionRecord>, StoreError> {
        self.recorder.history(submitter_id, problem_id).await
    }

    pub async fn stats(&self, submitter_id: &str) -> Result<UserJudgingStats, StoreError> {
        self.recorder.stats(submitter_id).await
    }

    pub fn has_problem(&self, problem_id: &str) -> bool {
        self.catalog.problem(problem_id).is_some()
    }
}
