use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::JobError;
use crate::generation::{GenerationEvent, GenerationId, GenerationProgress};
use crate::job::{FaultReason, Job, JobReport, JobStatus, SubmitRetry};

const COMMAND_BUFFER: usize = 32;

/// Point-in-time view of a job owned by an actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub finalized: bool,
    pub completed_successfully: bool,
    pub any_failing: bool,
    pub progress: BTreeMap<GenerationId, GenerationProgress>,
}

impl JobSnapshot {
    fn of<P>(job: &Job<P>) -> Self {
        Self {
            status: job.status(),
            finalized: job.job_finalized(),
            completed_successfully: job.job_completed_successfully(),
            any_failing: job.any_generation_failing(),
            progress: job
                .generations()
                .iter()
                .map(|(id, generation)| (id.clone(), generation.generation_progress()))
                .collect(),
        }
    }
}

enum Command<P> {
    Apply {
        id: GenerationId,
        event: GenerationEvent,
        reply: oneshot::Sender<Result<GenerationProgress, JobError>>,
    },
    ReportError {
        id: GenerationId,
        message: String,
        exception: Option<anyhow::Error>,
        reply: oneshot::Sender<Result<GenerationProgress, JobError>>,
    },
    Snapshot {
        reply: oneshot::Sender<JobSnapshot>,
    },
    Report {
        reply: oneshot::Sender<JobReport>,
    },
    Fault {
        reason: FaultReason,
        reply: oneshot::Sender<bool>,
    },
    RecordFailedSubmit {
        reply: oneshot::Sender<SubmitRetry>,
    },
    RecordSuccessfulSubmit,
    Shutdown {
        reply: oneshot::Sender<Job<P>>,
    },
}

/// Owns a [`Job`] on a tokio task so several tasks can drive it without locks.
pub struct JobActor;

impl JobActor {
    /// Move `job` into a new task. Must be called within a tokio runtime.
    ///
    /// The task ends on [`JobHandle::shutdown`] or when every handle is dropped.
    pub fn spawn<P: Send + 'static>(job: Job<P>) -> JobHandle<P> {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run(job, rx));
        JobHandle { tx }
    }
}

async fn run<P>(mut job: Job<P>, mut rx: mpsc::Receiver<Command<P>>) {
    while let Some(command) = rx.recv().await {
        // Replies are best-effort: a caller that stopped waiting is not an error.
        match command {
            Command::Apply { id, event, reply } => {
                let _ = reply.send(job.apply(&id, event));
            }
            Command::ReportError {
                id,
                message,
                exception,
                reply,
            } => {
                let outcome = job
                    .generation_mut(&id)
                    .and_then(|generation| {
                        generation
                            .on_error(message, exception)
                            .map_err(JobError::from)
                    });
                let _ = reply.send(outcome);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(JobSnapshot::of(&job));
            }
            Command::Report { reply } => {
                let _ = reply.send(job.report());
            }
            Command::Fault { reason, reply } => {
                let _ = reply.send(job.set_job_faulted(reason));
            }
            Command::RecordFailedSubmit { reply } => {
                let _ = reply.send(job.record_failed_submit());
            }
            Command::RecordSuccessfulSubmit => job.record_successful_submit(),
            Command::Shutdown { reply } => {
                debug!(job = %job.identifier(), "job actor shutting down");
                let _ = reply.send(job);
                return;
            }
        }
    }
    debug!(job = %job.identifier(), "all job handles dropped");
}

/// Cloneable sender side of a [`JobActor`].
pub struct JobHandle<P> {
    tx: mpsc::Sender<Command<P>>,
}

impl<P> Clone for JobHandle<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<P> JobHandle<P> {
    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command<P>,
    ) -> Result<R, JobError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| JobError::ActorClosed)?;
        response.await.map_err(|_| JobError::ActorClosed)
    }

    pub async fn apply(
        &self,
        id: GenerationId,
        event: GenerationEvent,
    ) -> Result<GenerationProgress, JobError> {
        self.request(|reply| Command::Apply { id, event, reply })
            .await?
    }

    /// [`SingleGeneration::on_error`](crate::SingleGeneration::on_error) with an exception attached.
    pub async fn report_error(
        &self,
        id: GenerationId,
        message: impl Into<String>,
        exception: Option<anyhow::Error>,
    ) -> Result<GenerationProgress, JobError> {
        let message = message.into();
        self.request(|reply| Command::ReportError {
            id,
            message,
            exception,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<JobSnapshot, JobError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn report(&self) -> Result<JobReport, JobError> {
        self.request(|reply| Command::Report { reply }).await
    }

    pub async fn fault(&self, reason: FaultReason) -> Result<bool, JobError> {
        self.request(|reply| Command::Fault { reason, reply }).await
    }

    pub async fn record_failed_submit(&self) -> Result<SubmitRetry, JobError> {
        self.request(|reply| Command::RecordFailedSubmit { reply })
            .await
    }

    pub async fn record_successful_submit(&self) -> Result<(), JobError> {
        self.tx
            .send(Command::RecordSuccessfulSubmit)
            .await
            .map_err(|_| JobError::ActorClosed)
    }

    /// Stop the actor and take the job back.
    pub async fn shutdown(&self) -> Result<Job<P>, JobError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
