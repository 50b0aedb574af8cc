use thiserror::Error;

use crate::generation::{GenerationId, GenerationKind, GenerationProgress, ResultKind};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation {id} is already in {state}")]
    SelfTransition {
        id: GenerationId,
        state: GenerationProgress,
    },

    #[error("invalid transition for generation {id} from {from} to {to}")]
    InvalidTransition {
        id: GenerationId,
        from: GenerationProgress,
        to: GenerationProgress,
    },

    #[error("generation {id} cannot enter or leave ERROR before taking any action")]
    ErrorWithoutHistory { id: GenerationId },

    #[error("generation {id} exceeded its error limit for {state} ({count} > {limit})")]
    StateErrorLimitExceeded {
        id: GenerationId,
        state: GenerationProgress,
        count: u32,
        limit: u32,
    },

    #[error("generation {id} has no work result yet")]
    MissingWorkResult { id: GenerationId },

    #[error("generation {id} already has a work result")]
    ResultAlreadySet { id: GenerationId },

    #[error("generation {id} expects a {expected} result, got {actual}")]
    ResultKindMismatch {
        id: GenerationId,
        expected: ResultKind,
        actual: ResultKind,
    },

    #[error("{kind} generations require {capability}")]
    CapabilityMismatch {
        kind: GenerationKind,
        capability: &'static str,
    },
}

/// Classifies a generation failure for escalation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The driver broke the state contract.
    Protocol,
    /// A state ran out of error retries; escalate to a job fault.
    BudgetExhausted,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Protocol => write!(f, "Protocol"),
            ErrorClass::BudgetExhausted => write!(f, "BudgetExhausted"),
        }
    }
}

impl GenerationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GenerationError::StateErrorLimitExceeded { .. } => ErrorClass::BudgetExhausted,
            _ => ErrorClass::Protocol,
        }
    }

    /// Neither class is resolved by re-entering the failed state.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Unknown generation: {0}")]
    UnknownGeneration(GenerationId),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Generation {0} has no result to upload")]
    MissingResult(GenerationId),

    #[error("Upload cancelled")]
    UploadCancelled,

    #[error("Failed to start upload runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("Job actor has shut down")]
    ActorClosed,

    #[error("Blocking upload called from inside a tokio runtime; use upload_all_sequential")]
    InsideRuntime,

    #[error("Duplicate generation id: {0}")]
    DuplicateGeneration(GenerationId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown generation state: {0}")]
pub struct UnknownProgress(pub String);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to install tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_errors_are_classified_apart_from_protocol_errors() {
        let exhausted = GenerationError::StateErrorLimitExceeded {
            id: "g".into(),
            state: GenerationProgress::Preloading,
            count: 4,
            limit: 3,
        };
        assert_eq!(exhausted.class(), ErrorClass::BudgetExhausted);
        assert_eq!(
            exhausted.to_string(),
            "generation g exceeded its error limit for PRELOADING (4 > 3)"
        );

        let protocol = GenerationError::MissingWorkResult { id: "g".into() };
        assert_eq!(protocol.class(), ErrorClass::Protocol);
        assert!(protocol.is_fatal());
    }

    #[test]
    fn job_error_wraps_generation_error() {
        let err: JobError = GenerationError::ResultAlreadySet { id: "g".into() }.into();
        assert_eq!(err.to_string(), "generation g already has a work result");
    }

    #[test]
    fn unknown_progress_names_the_rejected_value() {
        let err = "WARMING_UP".parse::<GenerationProgress>().unwrap_err();
        assert_eq!(err, UnknownProgress("WARMING_UP".to_string()));
        assert_eq!(err.to_string(), "unknown generation state: WARMING_UP");
    }
}
