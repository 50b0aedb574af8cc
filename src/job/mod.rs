mod upload;
mod worker_job;

pub use upload::UploadJob;
pub use worker_job::{
    FaultReason, FaultRecord, GenerationReport, Job, JobReport, JobStatus, SubmitRetry,
};
