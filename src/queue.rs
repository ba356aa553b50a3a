use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, Notify, oneshot};

use crate::catalog::Problem;
use crate::engine::{JudgeError, Submission};
use crate::recorder::Recorded;

/// What a worker sends back once a job is finished
pub type JobResult = Result<Recorded, JudgeError>;

pub struct Job {
    pub submission: Submission,
    pub problem: Arc<Problem>,
    pub responder: oneshot::Sender<JobResult>,
}

impl Job {
    /// Creates a job and the receiver its result will arrive on
    pub fn new(
        submission: Submission,
        problem: Arc<Problem>,
    ) -> (Self, oneshot::Receiver<JobResult>) {
        let (responder, receiver) = oneshot::channel();
        let job = Self {
            submission,
            problem,
            responder,
        };
        (job, receiver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("judge is busy: {capacity} submissions already waiting")]
    Busy { capacity: usize },
}

/// Bounded FIFO of jobs waiting for a free worker
pub struct JobQueue {
    queue: Mutex<VecDeque<Job>>,
    notify: Notify,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueues a job, refusing it instead of waiting when the queue is full
    pub async fn push(&self, job: Job) -> Result<(), QueueError> {
        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.capacity {
                return Err(QueueError::Busy {
                    capacity: self.capacity,
                });
            }
            queue.push_back(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub async fn pop(&self) -> Job {
        loop {
            if let Some(job) = self.queue.lock().await.pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
