use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{JudgeConfig, SandboxConfig};
use crate::engine::{DefaultLimits, Judge};
use crate::queue::{Job, JobQueue};
use crate::recorder::Recorder;
use crate::sandbox::create_sandbox_runner;
use crate::validator::Validator;

/// Builds this worker's own sandbox and judge, then serves the queue
pub async fn worker(
    id: u8,
    judge_config: Arc<JudgeConfig>,
    sandbox_config: Arc<SandboxConfig>,
    recorder: Arc<Recorder>,
    queue: Arc<JobQueue>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let sandbox = create_sandbox_runner(id, &sandbox_config)?;
    let judge = Judge::new(
        Validator::new(judge_config.max_source_bytes),
        sandbox,
        DefaultLimits::from(judge_config.as_ref()),
    );
    log::info!("Worker {id} initialized");

    serve(id, judge, recorder, queue, token).await
}

/// Judges one queued submission at a time until cancelled
pub async fn serve(
    id: u8,
    judge: Judge,
    recorder: Arc<Recorder>,
    queue: Arc<JobQueue>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            job = queue.pop() => {
                let Job { submission, problem, responder } = job;
                log::info!(
                    "Worker {id} got submission by {} for {} from queue",
                    submission.submitter_id,
                    problem.id
                );

                let result = match judge.judge(&submission, &problem).await {
                    // Persisted even if the caller has gone away
                    Ok(verdict) => Ok(recorder.record(&submission, &problem.name, verdict).await),
                    Err(e) => {
                        log::error!(
                            "Judging submission by {} for {} failed on worker {id}: {e}",
                            submission.submitter_id,
                            problem.id
                        );
                        Err(e)
                    }
                };

                if responder.send(result).is_err() {
                    log::warn!(
                        "Caller of submission by {} left before its result was ready",
                        submission.submitter_id
                    );
                } else {
                    log::debug!("Result sent back from worker {id}");
                }
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}
