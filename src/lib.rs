//! Generation lifecycle tracking and job orchestration for workers on a
//! crowdsourced generative-compute network.
//!
//! A worker pops a job from the dispatcher, builds a [`Job`] (one
//! [`SingleGeneration`] per expected result), drives each generation through
//! preloading, inference, post-processing, safety checking and submission,
//! and finally delivers results with an [`UploadJob`].

pub mod actor;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod generation;
pub mod job;
pub mod telemetry;
pub mod transport;

pub use actor::{JobActor, JobHandle, JobSnapshot};
pub use config::JobConfig;
pub use dispatch::{DispatchConverter, DispatchParameters, GenerationParameters, ParameterSet};
pub use error::{
    ConfigError, ErrorClass, GenerationError, JobError, TelemetryError, TransportError,
    UnknownProgress,
};
pub use generation::{
    Capabilities, GenerationEvent, GenerationId, GenerationKind, GenerationProgress,
    SingleGeneration, TransitionTable, WorkResult,
};
pub use job::{FaultReason, Job, JobReport, JobStatus, SubmitRetry, UploadJob};
pub use transport::{ReqwestTransport, UploadMethod, UploadTransport};
