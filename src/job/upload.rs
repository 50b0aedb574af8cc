use std::collections::{BTreeMap, BTreeSet};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::worker_job::Job;
use crate::config::JobConfig;
use crate::dispatch::{DispatchParameters, GenerationParameters};
use crate::error::{JobError, TransportError};
use crate::generation::{GenerationId, GenerationProgress};
use crate::transport::{UploadMethod, UploadTransport};

/// A job whose results are delivered to per-generation URLs.
///
/// Map entries with no URL are "no upload" and always count as delivered.
#[derive(Debug)]
pub struct UploadJob<P> {
    job: Job<P>,
    upload_map: BTreeMap<GenerationId, Option<String>>,
    method: UploadMethod,
}

impl<P: GenerationParameters> UploadJob<P> {
    /// One generation per key of `upload_map`.
    pub fn new(
        parameters: P,
        upload_map: BTreeMap<GenerationId, Option<String>>,
        config: JobConfig,
    ) -> Result<Self, JobError> {
        let job = Job::with_generation_ids(parameters, upload_map.keys().cloned(), config)?;
        Ok(Self {
            job,
            upload_map,
            method: UploadMethod::default(),
        })
    }

    pub fn from_dispatch(
        parameters: P,
        dispatch: &DispatchParameters,
        config: JobConfig,
    ) -> Result<Self, JobError> {
        Self::new(parameters, dispatch.upload_map(), config)
    }
}

impl<P> UploadJob<P> {
    pub fn with_method(mut self, method: UploadMethod) -> Self {
        self.method = method;
        self
    }

    pub fn method(&self) -> UploadMethod {
        self.method
    }

    pub fn job(&self) -> &Job<P> {
        &self.job
    }

    pub fn job_mut(&mut self) -> &mut Job<P> {
        &mut self.job
    }

    pub fn into_job(self) -> Job<P> {
        self.job
    }

    pub fn upload_map(&self) -> &BTreeMap<GenerationId, Option<String>> {
        &self.upload_map
    }

    pub fn upload_url(&self, id: &GenerationId) -> Option<&str> {
        self.upload_map.get(id).and_then(|url| url.as_deref())
    }

    /// Deliver one generation's result, retrying up to `max_retries` times.
    ///
    /// Returns `Ok(false)` once the retry budget is spent. Errors are reserved
    /// for an unknown id or a generation with a URL but no result.
    pub async fn upload_one<T: UploadTransport>(
        &self,
        transport: &T,
        id: &GenerationId,
    ) -> Result<bool, JobError> {
        let url = match self.upload_map.get(id) {
            None => return Err(JobError::UnknownGeneration(id.clone())),
            Some(None) => {
                debug!(generation_id = %id, "no upload requested");
                return Ok(true);
            }
            Some(Some(url)) => url,
        };
        let body = self
            .job
            .get_generation(id)
            .ok_or_else(|| JobError::UnknownGeneration(id.clone()))?
            .generation_result()
            .ok_or_else(|| JobError::MissingResult(id.clone()))?
            .as_bytes();

        Ok(deliver(transport, self.method, id, url, body, self.job.config()).await)
    }

    /// Upload every result one after another. `true` only if all succeeded.
    pub async fn upload_all_sequential<T: UploadTransport>(
        &self,
        transport: &T,
    ) -> Result<bool, JobError> {
        let mut all_succeeded = true;
        for id in self.upload_map.keys() {
            all_succeeded &= self.upload_one(transport, id).await?;
        }
        Ok(all_succeeded)
    }

    /// Blocking form of [`upload_all_sequential`](Self::upload_all_sequential)
    /// on a private current-thread runtime.
    ///
    /// Call it from a plain thread. Inside a tokio runtime it returns
    /// [`JobError::InsideRuntime`].
    pub fn upload_all_sync<T: UploadTransport>(&self, transport: &T) -> Result<bool, JobError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(JobError::InsideRuntime);
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(JobError::Runtime)?;
        runtime.block_on(self.upload_all_sequential(transport))
    }

    /// Upload every result concurrently over one shared transport and wait
    /// for all of them. `true` only if all succeeded.
    ///
    /// Cancelling `cancel` drops the in-flight uploads, moves each generation
    /// whose upload had not finished to `UserRequestedAbort`, and returns
    /// [`JobError::UploadCancelled`].
    pub async fn upload_all_concurrent<T: UploadTransport>(
        &mut self,
        transport: &T,
        cancel: &CancellationToken,
    ) -> Result<bool, JobError> {
        self.check_results()?;

        let mut all_succeeded = true;
        let unfinished: Vec<GenerationId> = {
            let this = &*self;
            let mut remaining: BTreeSet<&GenerationId> = this.upload_map.keys().collect();
            let mut uploads: FuturesUnordered<_> = this
                .upload_map
                .keys()
                .map(|id| async move { (id, this.upload_one(transport, id).await) })
                .collect();

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = uploads.next() => match next {
                        Some((id, outcome)) => {
                            remaining.remove(id);
                            all_succeeded &= outcome?;
                        }
                        None => break,
                    },
                }
            }
            remaining.into_iter().cloned().collect()
        };

        if unfinished.is_empty() {
            return Ok(all_succeeded);
        }

        info!(
            job = %self.job.identifier(),
            unfinished = unfinished.len(),
            "upload batch cancelled",
        );
        for id in &unfinished {
            self.request_abort(id);
        }
        Err(JobError::UploadCancelled)
    }

    fn check_results(&self) -> Result<(), JobError> {
        for (id, url) in &self.upload_map {
            if url.is_none() {
                continue;
            }
            let generation = self
                .job
                .get_generation(id)
                .ok_or_else(|| JobError::UnknownGeneration(id.clone()))?;
            if generation.generation_result().is_none() {
                return Err(JobError::MissingResult(id.clone()));
            }
        }
        Ok(())
    }

    fn request_abort(&mut self, id: &GenerationId) {
        let Some(generation) = self.job.get_generation_mut(id) else {
            return;
        };
        let progress = generation.generation_progress();
        if progress.is_terminal() || progress == GenerationProgress::UserRequestedAbort {
            return;
        }
        if let Err(err) = generation.on_user_requested_abort() {
            warn!(generation_id = %id, state = %progress, error = %err, "could not mark cancelled upload");
        }
    }
}

async fn deliver<T: UploadTransport>(
    transport: &T,
    method: UploadMethod,
    id: &GenerationId,
    url: &str,
    body: &[u8],
    config: &JobConfig,
) -> bool {
    let attempts = config.max_retries.max(1);
    for attempt in 1..=attempts {
        let outcome = match timeout(config.upload_timeout(), transport.send(method, url, body)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout),
        };

        match outcome {
            Ok(status) if (200..300).contains(&status) => {
                debug!(generation_id = %id, %method, attempt, status, "upload complete");
                return true;
            }
            // R2 returns 500 under load; transient.
            Ok(500) => {
                warn!(generation_id = %id, %method, attempt, status = 500, "upload failed, retrying");
            }
            Ok(status) => {
                error!(generation_id = %id, %method, attempt, status, "upload rejected");
            }
            Err(err) => {
                warn!(generation_id = %id, %method, attempt, error = %err, "upload failed, retrying");
            }
        }

        if attempt < attempts {
            sleep(config.retry_delay()).await;
        }
    }

    error!(generation_id = %id, %method, attempts, "upload failed after all attempts");
    false
}
