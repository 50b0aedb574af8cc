use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::JobConfig;
use crate::dispatch::{DispatchParameters, GenerationParameters};
use crate::error::JobError;
use crate::generation::{
    GenerationEvent, GenerationId, GenerationKind, GenerationProgress, SingleGeneration,
};

/// Why a whole job was faulted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FaultReason {
    UnhandledException,
    UnhandledExceptionFromBackend,
    SystemOutOfMemory,
    GpuOutOfMemory,
    /// A timeout or connection error talking to the dispatcher.
    NetworkIssue,
    /// A step ran past a sane time limit, e.g. a model that never finished loading.
    SafeguardTimeout,
    Other(String),
}

impl FaultReason {
    pub fn as_str(&self) -> &str {
        match self {
            FaultReason::UnhandledException => "UNHANDLED_EXCEPTION",
            FaultReason::UnhandledExceptionFromBackend => "UNHANDLED_EXCEPTION_FROM_BACKEND",
            FaultReason::SystemOutOfMemory => "SYSTEM_OUT_OF_MEMORY",
            FaultReason::GpuOutOfMemory => "GPU_OUT_OF_MEMORY",
            FaultReason::NetworkIssue => "NETWORK_ISSUE",
            FaultReason::SafeguardTimeout => "SAFEGUARD_TIMEOUT",
            FaultReason::Other(reason) => reason,
        }
    }
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultReason {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "UNHANDLED_EXCEPTION" => FaultReason::UnhandledException,
            "UNHANDLED_EXCEPTION_FROM_BACKEND" => FaultReason::UnhandledExceptionFromBackend,
            "SYSTEM_OUT_OF_MEMORY" => FaultReason::SystemOutOfMemory,
            "GPU_OUT_OF_MEMORY" => FaultReason::GpuOutOfMemory,
            "NETWORK_ISSUE" => FaultReason::NetworkIssue,
            "SAFEGUARD_TIMEOUT" => FaultReason::SafeguardTimeout,
            other => FaultReason::Other(other.to_string()),
        })
    }
}

impl From<String> for FaultReason {
    fn from(reason: String) -> Self {
        match reason.parse() {
            Ok(parsed) => parsed,
            Err(never) => match never {},
        }
    }
}

impl From<FaultReason> for String {
    fn from(reason: FaultReason) -> Self {
        reason.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub reason: FaultReason,
    pub faulted_at: DateTime<Utc>,
}

/// Coarse job status, derived from the generations and the fault record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Faulted,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "Pending"),
            JobStatus::InProgress => write!(f, "InProgress"),
            JobStatus::Completed => write!(f, "Completed"),
            JobStatus::Failed => write!(f, "Failed"),
            JobStatus::Faulted => write!(f, "Faulted"),
        }
    }
}

/// What the caller should do after a failed submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRetry {
    RetryAfter(Duration),
    /// The job was faulted and every generation abandoned. Do not contact the dispatcher again.
    Abandoned,
}

/// A batch of generations sharing one dispatch and one configuration.
///
/// Like its generations, a job has a single owner; see [`JobActor`](crate::JobActor)
/// for driving one from several tasks.
#[derive(Debug)]
pub struct Job<P> {
    parameters: P,
    config: JobConfig,
    generations: BTreeMap<GenerationId, SingleGeneration>,
    consecutive_failed_submits: u32,
    fault: Option<FaultRecord>,
    should_censor_nsfw: bool,
    received_at: DateTime<Utc>,
    submitted_at: Option<DateTime<Utc>>,
}

impl<P: GenerationParameters> Job<P> {
    /// Build a job whose generation ids come from `parameters`, or fresh v4
    /// UUIDs (one per expected result) if it names none.
    pub fn new(parameters: P, config: JobConfig) -> Result<Self, JobError> {
        let ids = parameters.generation_ids().unwrap_or_else(|| {
            (0..parameters.expected_result_count())
                .map(|_| GenerationId::random())
                .collect()
        });
        Self::with_generation_ids(parameters, ids, config)
    }

    /// Build a job using the dispatcher's ids, if it supplied any.
    pub fn from_dispatch(
        parameters: P,
        dispatch: &DispatchParameters,
        config: JobConfig,
    ) -> Result<Self, JobError> {
        if dispatch.generation_ids.is_empty() {
            Self::new(parameters, config)
        } else {
            Self::with_generation_ids(parameters, dispatch.generation_ids.clone(), config)
        }
    }

    /// Fails with [`JobError::DuplicateGeneration`] if an id repeats.
    pub fn with_generation_ids(
        parameters: P,
        ids: impl IntoIterator<Item = GenerationId>,
        config: JobConfig,
    ) -> Result<Self, JobError> {
        let kind = parameters.kind();
        let capabilities = parameters.capabilities();
        let mut generations = BTreeMap::new();
        for id in ids {
            let generation = SingleGeneration::new(
                id.clone(),
                kind,
                capabilities,
                config.state_error_limits.clone(),
            )?;
            if generations.contains_key(&id) {
                return Err(JobError::DuplicateGeneration(id));
            }
            generations.insert(id, generation);
        }

        Ok(Self {
            parameters,
            config,
            generations,
            consecutive_failed_submits: 0,
            fault: None,
            should_censor_nsfw: false,
            received_at: Utc::now(),
            submitted_at: None,
        })
    }

    pub fn kind(&self) -> GenerationKind {
        self.parameters.kind()
    }
}

impl<P> Job<P> {
    pub fn with_extra_logging(mut self, extra_logging: bool) -> Self {
        self.generations = std::mem::take(&mut self.generations)
            .into_iter()
            .map(|(id, generation)| (id, generation.with_extra_logging(extra_logging)))
            .collect();
        self
    }

    /// Record that the requesting user asked for NSFW results to be censored.
    pub fn with_censor_nsfw(mut self, should_censor_nsfw: bool) -> Self {
        self.should_censor_nsfw = should_censor_nsfw;
        self
    }

    pub fn parameters(&self) -> &P {
        &self.parameters
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn generations(&self) -> &BTreeMap<GenerationId, SingleGeneration> {
        &self.generations
    }

    pub fn ids(&self) -> impl Iterator<Item = &GenerationId> {
        self.generations.keys()
    }

    /// Ids joined for log lines, e.g. `[a, b]`.
    pub fn identifier(&self) -> String {
        let ids: Vec<&str> = self.generations.keys().map(GenerationId::as_str).collect();
        format!("[{}]", ids.join(", "))
    }

    pub fn get_generation(&self, id: &GenerationId) -> Option<&SingleGeneration> {
        self.generations.get(id)
    }

    pub fn get_generation_mut(&mut self, id: &GenerationId) -> Option<&mut SingleGeneration> {
        self.generations.get_mut(id)
    }

    pub(crate) fn generation_mut(
        &mut self,
        id: &GenerationId,
    ) -> Result<&mut SingleGeneration, JobError> {
        self.generations
            .get_mut(id)
            .ok_or_else(|| JobError::UnknownGeneration(id.clone()))
    }

    /// Drive one generation by event.
    pub fn apply(
        &mut self,
        id: &GenerationId,
        event: GenerationEvent,
    ) -> Result<GenerationProgress, JobError> {
        Ok(self.generation_mut(id)?.apply(event)?)
    }

    pub fn should_censor_nsfw(&self) -> bool {
        self.should_censor_nsfw
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn mark_submitted(&mut self) {
        self.submitted_at = Some(Utc::now());
    }

    /// Whether any generation is failing. `false` for an empty job.
    pub fn any_generation_failing(&self) -> bool {
        self.generations
            .values()
            .any(|generation| generation.is_failing())
    }

    /// Every generation is in one of the four terminal states.
    pub fn job_finalized(&self) -> bool {
        self.generations
            .values()
            .all(|generation| generation.is_finalized())
    }

    pub fn job_completed_successfully(&self) -> bool {
        self.generations.values().all(|generation| {
            generation.generation_progress() == GenerationProgress::SubmitComplete
        })
    }

    /// `None` for an empty job; unchecked generations count as clean.
    pub fn any_generation_censored(&self) -> Option<bool> {
        if self.generations.is_empty() {
            return None;
        }
        Some(self.generations.values().any(|generation| {
            generation.is_nsfw().unwrap_or(false) || generation.is_csam().unwrap_or(false)
        }))
    }

    /// Generations that failed more often than `max_generation_failures`.
    pub fn generations_over_failure_limit(&self) -> Vec<GenerationId> {
        self.generations
            .iter()
            .filter(|(_, generation)| {
                generation.generation_failure_count() > self.config.max_generation_failures
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn status(&self) -> JobStatus {
        if self.fault.is_some() {
            JobStatus::Faulted
        } else if self.job_finalized() && self.job_completed_successfully() {
            JobStatus::Completed
        } else if self.job_finalized() {
            JobStatus::Failed
        } else if self
            .generations
            .values()
            .all(|generation| generation.generation_progress() == GenerationProgress::NotStarted)
        {
            JobStatus::Pending
        } else {
            JobStatus::InProgress
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    pub fn fault(&self) -> Option<&FaultRecord> {
        self.fault.as_ref()
    }

    pub fn faulted_reason(&self) -> Option<&FaultReason> {
        self.fault.as_ref().map(|fault| &fault.reason)
    }

    pub fn faulted_at(&self) -> Option<DateTime<Utc>> {
        self.fault.as_ref().map(|fault| fault.faulted_at)
    }

    /// Fault the whole job, aborting every generation with `reason`.
    ///
    /// Completed generations are aborted too. Only the first call has an
    /// effect; later calls log a warning and return `false`.
    pub fn set_job_faulted(&mut self, reason: FaultReason) -> bool {
        if let Some(fault) = &self.fault {
            warn!(
                job = %self.identifier(),
                reason = %fault.reason,
                faulted_at = %fault.faulted_at,
                ignored_reason = %reason,
                "job is already faulted",
            );
            return false;
        }

        error!(job = %self.identifier(), %reason, "faulting job");
        let message = reason.to_string();
        for generation in self.generations.values_mut() {
            generation.on_abort(message.clone(), None);
        }
        self.fault = Some(FaultRecord {
            reason,
            faulted_at: Utc::now(),
        });
        true
    }

    pub fn consecutive_failed_submits(&self) -> u32 {
        self.consecutive_failed_submits
    }

    /// Count a failed submit. Once the count exceeds
    /// `max_consecutive_failed_job_submits` the job is faulted with
    /// [`FaultReason::NetworkIssue`] and every generation abandoned, with no
    /// further attempt to reach the dispatcher.
    pub fn record_failed_submit(&mut self) -> SubmitRetry {
        self.consecutive_failed_submits += 1;
        if self.consecutive_failed_submits <= self.config.max_consecutive_failed_job_submits {
            warn!(
                job = %self.identifier(),
                failed_submits = self.consecutive_failed_submits,
                limit = self.config.max_consecutive_failed_job_submits,
                "job submit failed",
            );
            return SubmitRetry::RetryAfter(self.config.job_submit_retry_delay());
        }

        self.set_job_faulted(FaultReason::NetworkIssue);
        for generation in self.generations.values_mut() {
            generation.on_abandoned("too many consecutive failed submits");
        }
        SubmitRetry::Abandoned
    }

    pub fn record_successful_submit(&mut self) {
        if self.consecutive_failed_submits > 0 {
            info!(
                job = %self.identifier(),
                failed_submits = self.consecutive_failed_submits,
                "job submit recovered",
            );
        }
        self.consecutive_failed_submits = 0;
    }

    pub fn report(&self) -> JobReport {
        JobReport::from_job(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub id: GenerationId,
    pub progress: GenerationProgress,
    pub failure_count: u32,
    pub failure_messages: Vec<String>,
    pub error_counts: BTreeMap<GenerationProgress, u32>,
    pub is_nsfw: Option<bool>,
    pub is_csam: Option<bool>,
    pub has_result: bool,
}

/// Serializable snapshot of a job, for logs and the worker's own bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub status: JobStatus,
    pub generations: Vec<GenerationReport>,
    pub fault: Option<FaultRecord>,
    pub consecutive_failed_submits: u32,
    pub received_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub reported_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl JobReport {
    pub fn from_job<P>(job: &Job<P>) -> Self {
        let now = Utc::now();
        let generations = job
            .generations
            .values()
            .map(|generation| GenerationReport {
                id: generation.id().clone(),
                progress: generation.generation_progress(),
                failure_count: generation.generation_failure_count(),
                failure_messages: generation.failure_messages().to_vec(),
                error_counts: generation.error_counts().clone(),
                is_nsfw: generation.is_nsfw(),
                is_csam: generation.is_csam(),
                has_result: generation.generation_result().is_some(),
            })
            .collect();

        Self {
            status: job.status(),
            generations,
            fault: job.fault.clone(),
            consecutive_failed_submits: job.consecutive_failed_submits,
            received_at: job.received_at,
            submitted_at: job.submitted_at,
            reported_at: now,
            duration_ms: (now - job.received_at).num_milliseconds(),
        }
    }
}
