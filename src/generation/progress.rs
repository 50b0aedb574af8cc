use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UnknownProgress;

/// The lifecycle state of a single generation.
///
/// Every generation starts in `NotStarted`. The four terminal states are
/// `SubmitComplete`, `ReportedFailed`, `UserAbortComplete` and `Abandoned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationProgress {
    NotStarted,
    Preloading,
    PreloadingComplete,
    Generating,
    PendingPostProcessing,
    PostProcessing,
    PendingSafetyCheck,
    SafetyChecking,
    PendingSubmit,
    Submitting,
    SubmitComplete,
    /// One or more steps failed too many times. The dispatcher still needs to be told.
    Aborted,
    ReportedFailed,
    UserRequestedAbort,
    UserAbortComplete,
    /// Failed and the dispatcher could not be notified; the generation was discarded.
    Abandoned,
    /// The most recent step failed and may be retried.
    Error,
}

impl GenerationProgress {
    pub const ALL: [GenerationProgress; 17] = [
        GenerationProgress::NotStarted,
        GenerationProgress::Preloading,
        GenerationProgress::PreloadingComplete,
        GenerationProgress::Generating,
        GenerationProgress::PendingPostProcessing,
        GenerationProgress::PostProcessing,
        GenerationProgress::PendingSafetyCheck,
        GenerationProgress::SafetyChecking,
        GenerationProgress::PendingSubmit,
        GenerationProgress::Submitting,
        GenerationProgress::SubmitComplete,
        GenerationProgress::Aborted,
        GenerationProgress::ReportedFailed,
        GenerationProgress::UserRequestedAbort,
        GenerationProgress::UserAbortComplete,
        GenerationProgress::Abandoned,
        GenerationProgress::Error,
    ];

    /// The wire name of the state, e.g. `PENDING_SAFETY_CHECK`.
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationProgress::NotStarted => "NOT_STARTED",
            GenerationProgress::Preloading => "PRELOADING",
            GenerationProgress::PreloadingComplete => "PRELOADING_COMPLETE",
            GenerationProgress::Generating => "GENERATING",
            GenerationProgress::PendingPostProcessing => "PENDING_POST_PROCESSING",
            GenerationProgress::PostProcessing => "POST_PROCESSING",
            GenerationProgress::PendingSafetyCheck => "PENDING_SAFETY_CHECK",
            GenerationProgress::SafetyChecking => "SAFETY_CHECKING",
            GenerationProgress::PendingSubmit => "PENDING_SUBMIT",
            GenerationProgress::Submitting => "SUBMITTING",
            GenerationProgress::SubmitComplete => "SUBMIT_COMPLETE",
            GenerationProgress::Aborted => "ABORTED",
            GenerationProgress::ReportedFailed => "REPORTED_FAILED",
            GenerationProgress::UserRequestedAbort => "USER_REQUESTED_ABORT",
            GenerationProgress::UserAbortComplete => "USER_ABORT_COMPLETE",
            GenerationProgress::Abandoned => "ABANDONED",
            GenerationProgress::Error => "ERROR",
        }
    }

    /// Whether nothing more will ever happen to a generation in this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GenerationProgress::SubmitComplete
                | GenerationProgress::ReportedFailed
                | GenerationProgress::UserAbortComplete
                | GenerationProgress::Abandoned
        )
    }

    /// Whether the state indicates a failing, aborting or discarded generation.
    pub fn is_failing(self) -> bool {
        matches!(
            self,
            GenerationProgress::Error
                | GenerationProgress::Aborted
                | GenerationProgress::ReportedFailed
                | GenerationProgress::UserRequestedAbort
                | GenerationProgress::Abandoned
        )
    }
}

impl fmt::Display for GenerationProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationProgress {
    type Err = UnknownProgress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        GenerationProgress::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| UnknownProgress(s.to_string()))
    }
}

/// Static table of legal next states.
///
/// `WithSafetyCheck` routes finished work through the safety check;
/// `WithoutSafetyCheck` lets it go straight to submission. `Error` has no
/// entry of its own: a generation in `Error` is judged by the table entry of
/// the last state it was in before failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionTable {
    WithSafetyCheck,
    WithoutSafetyCheck,
}

impl TransitionTable {
    /// The legal next states from `from`.
    pub fn next_states(self, from: GenerationProgress) -> &'static [GenerationProgress] {
        use GenerationProgress::*;

        match (self, from) {
            (_, NotStarted) => &[
                Preloading,
                Generating,
                PendingPostProcessing,
                PostProcessing,
                UserRequestedAbort,
            ],
            (_, Preloading) => &[PreloadingComplete, Error, UserRequestedAbort],
            (_, PreloadingComplete) => &[
                Generating,
                PendingPostProcessing,
                PostProcessing,
                Error,
                UserRequestedAbort,
            ],
            (TransitionTable::WithSafetyCheck, Generating) => &[
                PendingPostProcessing,
                PostProcessing,
                PendingSafetyCheck,
                SafetyChecking,
                Error,
                UserRequestedAbort,
            ],
            (TransitionTable::WithoutSafetyCheck, Generating) => &[
                PendingPostProcessing,
                PostProcessing,
                PendingSubmit,
                Submitting,
                Error,
                UserRequestedAbort,
            ],
            (_, PendingPostProcessing) => &[PostProcessing, Error, UserRequestedAbort],
            (TransitionTable::WithSafetyCheck, PostProcessing) => &[
                PendingSafetyCheck,
                SafetyChecking,
                Error,
                UserRequestedAbort,
            ],
            (TransitionTable::WithoutSafetyCheck, PostProcessing) => {
                &[PendingSubmit, Error, UserRequestedAbort]
            }
            (_, PendingSafetyCheck) => &[SafetyChecking, Error, UserRequestedAbort],
            (_, SafetyChecking) => &[PendingSubmit, Error, UserRequestedAbort],
            (_, PendingSubmit) => &[Submitting, Error, UserRequestedAbort],
            (_, Submitting) => &[SubmitComplete, Error, Abandoned, UserRequestedAbort],
            (_, Aborted) => &[ReportedFailed, Error, Abandoned],
            (_, UserRequestedAbort) => &[UserAbortComplete, Abandoned, Error],
            (_, SubmitComplete | ReportedFailed | UserAbortComplete | Abandoned | Error) => &[],
        }
    }

    pub fn allows(self, from: GenerationProgress, to: GenerationProgress) -> bool {
        self.next_states(from).contains(&to)
    }
}
