use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use super::GenerationId;
use super::kind::{Capabilities, GenerationKind, WorkResult};
use super::progress::{GenerationProgress, TransitionTable};
use crate::config::default_state_error_limits;
use crate::error::GenerationError;

/// A driver-side step, for callers that drive generations by message.
#[derive(Debug)]
pub enum GenerationEvent {
    Preloading,
    PreloadingComplete,
    Generating,
    GenerationWorkComplete,
    PostProcessing,
    PostProcessingComplete,
    SafetyChecking,
    SafetyCheckComplete { is_nsfw: bool, is_csam: bool },
    Submitting,
    SubmitComplete,
    UserRequestedAbort,
    UserAbortComplete,
    WorkResult(WorkResult),
    Failed { message: String },
}

/// One unit of generative work tracked from `NotStarted` to a terminal state.
///
/// A generation is driven by exactly one owner. Every mutating method takes
/// `&mut self`, so concurrent mutation is ruled out at compile time; share a
/// generation across tasks by moving its job into a [`JobActor`](crate::JobActor).
#[derive(Debug)]
pub struct SingleGeneration {
    id: GenerationId,
    kind: GenerationKind,
    capabilities: Capabilities,
    table: TransitionTable,
    state_error_limits: BTreeMap<GenerationProgress, u32>,
    progress: GenerationProgress,
    progress_history: Vec<(GenerationProgress, Instant)>,
    errored_states: Vec<(GenerationProgress, Instant)>,
    error_counts: BTreeMap<GenerationProgress, u32>,
    failure_messages: Vec<String>,
    failure_exceptions: Vec<anyhow::Error>,
    failure_count: u32,
    is_nsfw: Option<bool>,
    is_csam: Option<bool>,
    result: Option<WorkResult>,
    extra_logging: bool,
}

impl SingleGeneration {
    /// Create a generation, rejecting capabilities that break the kind's contract.
    pub fn new(
        id: GenerationId,
        kind: GenerationKind,
        capabilities: Capabilities,
        state_error_limits: BTreeMap<GenerationProgress, u32>,
    ) -> Result<Self, GenerationError> {
        capabilities.validate(kind)?;
        Ok(Self::build(id, kind, capabilities, state_error_limits))
    }

    /// A generation with the kind's default capabilities and error limits.
    pub fn for_kind(id: GenerationId, kind: GenerationKind) -> Self {
        Self::build(
            id,
            kind,
            Capabilities::for_kind(kind),
            default_state_error_limits(),
        )
    }

    fn build(
        id: GenerationId,
        kind: GenerationKind,
        capabilities: Capabilities,
        state_error_limits: BTreeMap<GenerationProgress, u32>,
    ) -> Self {
        // NOT_STARTED must be first so ERROR is never reachable before an action state.
        Self {
            id,
            kind,
            capabilities,
            table: capabilities.transition_table(),
            state_error_limits,
            progress: GenerationProgress::NotStarted,
            progress_history: vec![(GenerationProgress::NotStarted, Instant::now())],
            errored_states: Vec::new(),
            error_counts: BTreeMap::new(),
            failure_messages: Vec::new(),
            failure_exceptions: Vec::new(),
            failure_count: 0,
            is_nsfw: None,
            is_csam: None,
            result: None,
            extra_logging: false,
        }
    }

    /// Log transitions at `debug` instead of `trace`.
    pub fn with_extra_logging(mut self, extra_logging: bool) -> Self {
        self.extra_logging = extra_logging;
        self
    }

    pub fn id(&self) -> &GenerationId {
        &self.id
    }

    pub fn kind(&self) -> GenerationKind {
        self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn requires_generation(&self) -> bool {
        self.capabilities.requires_generation
    }

    pub fn requires_post_processing(&self) -> bool {
        self.capabilities.requires_post_processing
    }

    pub fn requires_safety_check(&self) -> bool {
        self.capabilities.requires_safety_check
    }

    pub fn transition_table(&self) -> TransitionTable {
        self.table
    }

    pub fn state_error_limits(&self) -> &BTreeMap<GenerationProgress, u32> {
        &self.state_error_limits
    }

    pub fn generation_progress(&self) -> GenerationProgress {
        self.progress
    }

    /// Every state entered so far, oldest first.
    pub fn progress_history(&self) -> &[(GenerationProgress, Instant)] {
        &self.progress_history
    }

    /// The state that failed and when it was retried, one entry per error cycle.
    pub fn errored_states(&self) -> &[(GenerationProgress, Instant)] {
        &self.errored_states
    }

    pub fn error_counts(&self) -> &BTreeMap<GenerationProgress, u32> {
        &self.error_counts
    }

    pub fn generation_failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn failure_messages(&self) -> &[String] {
        &self.failure_messages
    }

    pub fn failure_exceptions(&self) -> &[anyhow::Error] {
        &self.failure_exceptions
    }

    pub fn is_nsfw(&self) -> Option<bool> {
        self.is_nsfw
    }

    pub fn is_csam(&self) -> Option<bool> {
        self.is_csam
    }

    pub fn generation_result(&self) -> Option<&WorkResult> {
        self.result.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.progress.is_terminal()
    }

    pub fn is_failing(&self) -> bool {
        self.progress.is_failing()
    }

    /// Move to `next`, validating against the transition table.
    ///
    /// From `Error`, the target is checked against the last state before the
    /// failure; re-entering that state is a retry and counts against its
    /// error limit. Exceeding the limit aborts the generation and returns
    /// [`GenerationError::StateErrorLimitExceeded`].
    pub fn advance(
        &mut self,
        next: GenerationProgress,
    ) -> Result<GenerationProgress, GenerationError> {
        let current = self.progress;
        if next == current {
            return Err(GenerationError::SelfTransition {
                id: self.id.clone(),
                state: current,
            });
        }

        let erroring = current == GenerationProgress::Error || next == GenerationProgress::Error;
        if erroring && self.progress_history.len() < 2 {
            return Err(GenerationError::ErrorWithoutHistory {
                id: self.id.clone(),
            });
        }

        let last_non_error = if current == GenerationProgress::Error {
            self.progress_history[self.progress_history.len() - 2].0
        } else {
            current
        };

        if next != last_non_error && !self.table.allows(last_non_error, next) {
            return Err(GenerationError::InvalidTransition {
                id: self.id.clone(),
                from: current,
                to: next,
            });
        }

        if current == GenerationProgress::Error {
            self.errored_states.push((last_non_error, Instant::now()));
            *self.error_counts.entry(last_non_error).or_insert(0) += 1;
            if next == last_non_error {
                self.log_transition(current, next, "retrying after error");
            }
        }

        if let Some(&limit) = self.state_error_limits.get(&next) {
            let count = self.error_counts.get(&next).copied().unwrap_or(0);
            if count > limit {
                error!(
                    generation_id = %self.id,
                    state = %next,
                    count,
                    limit,
                    "generation exceeded its error limit",
                );
                self.on_abort(format!("error limit exceeded for {next}"), None);
                return Err(GenerationError::StateErrorLimitExceeded {
                    id: self.id.clone(),
                    state: next,
                    count,
                    limit,
                });
            }
        }

        self.set_progress(next);
        Ok(next)
    }

    /// [`advance`](Self::advance), recording why the step is being taken.
    pub fn advance_with_failure(
        &mut self,
        next: GenerationProgress,
        failed_message: impl Into<String>,
        failure_exception: Option<anyhow::Error>,
    ) -> Result<GenerationProgress, GenerationError> {
        self.record_failure(failed_message.into(), failure_exception);
        self.advance(next)
    }

    /// Record that the current step cannot complete and move to `Error`.
    ///
    /// Reserve this for failures that make the step impossible, such as an
    /// OOM-killed backend process.
    pub fn on_error(
        &mut self,
        failed_message: impl Into<String>,
        failure_exception: Option<anyhow::Error>,
    ) -> Result<GenerationProgress, GenerationError> {
        let failed_message = failed_message.into();
        self.failure_count += 1;
        warn!(
            generation_id = %self.id,
            state = %self.progress,
            failures = self.failure_count,
            exception = ?failure_exception,
            "generation step failed: {failed_message}",
        );
        self.record_failure(failed_message, failure_exception);
        self.advance(GenerationProgress::Error)
    }

    /// Force the generation into `Aborted`, bypassing the transition table.
    ///
    /// Returns `false` if it was already aborted.
    pub fn on_abort(
        &mut self,
        failed_message: impl Into<String>,
        failure_exception: Option<anyhow::Error>,
    ) -> bool {
        self.force(GenerationProgress::Aborted, failed_message.into(), failure_exception)
    }

    /// Force the generation into `Abandoned`, bypassing the transition table.
    pub fn on_abandoned(&mut self, reason: impl Into<String>) -> bool {
        self.force(GenerationProgress::Abandoned, reason.into(), None)
    }

    pub fn on_preloading(&mut self) -> Result<GenerationProgress, GenerationError> {
        self.advance(GenerationProgress::Preloading)
    }

    pub fn on_preloading_complete(&mut self) -> Result<GenerationProgress, GenerationError> {
        self.advance(GenerationProgress::PreloadingComplete)
    }

    pub fn on_generating(&mut self) -> Result<GenerationProgress, GenerationError> {
        self.advance(GenerationProgress::Generating)
    }

    /// Inference (or the alchemy operation) returned. Safety checks and
    /// submission may still be pending.
    pub fn on_generation_work_complete(
        &mut self,
    ) -> Result<GenerationProgress, GenerationError> {
        if self.capabilities.requires_post_processing {
            self.advance(GenerationProgress::PendingPostProcessing)
        } else {
            self.work_complete()
        }
    }

    pub fn on_post_processing(&mut self) -> Result<GenerationProgress, GenerationError> {
        self.advance(GenerationProgress::PostProcessing)
    }

    pub fn on_post_processing_complete(
        &mut self,
    ) -> Result<GenerationProgress, GenerationError> {
        self.work_complete()
    }

    fn work_complete(&mut self) -> Result<GenerationProgress, GenerationError> {
        if self.capabilities.requires_safety_check {
            self.advance(GenerationProgress::PendingSafetyCheck)
        } else {
            self.advance(GenerationProgress::PendingSubmit)
        }
    }

    pub fn on_safety_checking(&mut self) -> Result<GenerationProgress, GenerationError> {
        self.advance(GenerationProgress::SafetyChecking)
    }

    /// Store the safety verdict and move on to `PendingSubmit`.
    ///
    /// Fails without changing state if no work result has been set.
    pub fn on_safety_check_complete(
        &mut self,
        is_nsfw: bool,
        is_csam: bool,
    ) -> Result<GenerationProgress, GenerationError> {
        if self.result.is_none() {
            return Err(GenerationError::MissingWorkResult {
                id: self.id.clone(),
            });
        }
        let next = self.advance(GenerationProgress::PendingSubmit)?;
        self.is_nsfw = Some(is_nsfw);
        self.is_csam = Some(is_csam);
        Ok(next)
    }

    pub fn on_submitting(&mut self) -> Result<GenerationProgress, GenerationError> {
        self.advance(GenerationProgress::Submitting)
    }

    pub fn on_submit_complete(&mut self) -> Result<GenerationProgress, GenerationError> {
        self.advance(GenerationProgress::SubmitComplete)
    }

    pub fn on_user_requested_abort(&mut self) -> Result<GenerationProgress, GenerationError> {
        self.advance(GenerationProgress::UserRequestedAbort)
    }

    pub fn on_user_abort_complete(&mut self) -> Result<GenerationProgress, GenerationError> {
        self.advance(GenerationProgress::UserAbortComplete)
    }

    /// Store the produced artifact. It must match the kind's result type and
    /// may only be set once.
    pub fn set_work_result(&mut self, result: WorkResult) -> Result<(), GenerationError> {
        let expected = self.kind.profile().result_kind;
        if result.kind() != expected {
            return Err(GenerationError::ResultKindMismatch {
                id: self.id.clone(),
                expected,
                actual: result.kind(),
            });
        }
        if self.result.is_some() {
            return Err(GenerationError::ResultAlreadySet {
                id: self.id.clone(),
            });
        }
        trace!(generation_id = %self.id, result = ?result, "work result set");
        self.result = Some(result);
        Ok(())
    }

    /// Dispatch `event` to the matching callback.
    pub fn apply(&mut self, event: GenerationEvent) -> Result<GenerationProgress, GenerationError> {
        match event {
            GenerationEvent::Preloading => self.on_preloading(),
            GenerationEvent::PreloadingComplete => self.on_preloading_complete(),
            GenerationEvent::Generating => self.on_generating(),
            GenerationEvent::GenerationWorkComplete => self.on_generation_work_complete(),
            GenerationEvent::PostProcessing => self.on_post_processing(),
            GenerationEvent::PostProcessingComplete => self.on_post_processing_complete(),
            GenerationEvent::SafetyChecking => self.on_safety_checking(),
            GenerationEvent::SafetyCheckComplete { is_nsfw, is_csam } => {
                self.on_safety_check_complete(is_nsfw, is_csam)
            }
            GenerationEvent::Submitting => self.on_submitting(),
            GenerationEvent::SubmitComplete => self.on_submit_complete(),
            GenerationEvent::UserRequestedAbort => self.on_user_requested_abort(),
            GenerationEvent::UserAbortComplete => self.on_user_abort_complete(),
            GenerationEvent::WorkResult(result) => {
                self.set_work_result(result)?;
                Ok(self.progress)
            }
            GenerationEvent::Failed { message } => self.on_error(message, None),
        }
    }

    fn record_failure(&mut self, message: String, exception: Option<anyhow::Error>) {
        self.failure_messages.push(message);
        if let Some(exception) = exception {
            self.failure_exceptions.push(exception);
        }
    }

    fn force(
        &mut self,
        next: GenerationProgress,
        message: String,
        exception: Option<anyhow::Error>,
    ) -> bool {
        if self.progress == next {
            debug!(generation_id = %self.id, state = %next, "generation already in forced state");
            return false;
        }
        warn!(
            generation_id = %self.id,
            from = %self.progress,
            to = %next,
            reason = %message,
            "forcing generation state",
        );
        self.record_failure(message, exception);
        self.set_progress(next);
        true
    }

    fn set_progress(&mut self, next: GenerationProgress) {
        let from = self.progress;
        self.progress = next;
        self.progress_history.push((next, Instant::now()));
        self.log_transition(from, next, "generation transitioned");
    }

    fn log_transition(&self, from: GenerationProgress, to: GenerationProgress, message: &str) {
        if self.extra_logging {
            debug!(generation_id = %self.id, %from, %to, "{message}");
        } else {
            trace!(generation_id = %self.id, %from, %to, "{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use super::*;
    use crate::error::ErrorClass;

    const IMAGE_ID: &str = "00000000-0000-0000-0000-000000000000";

    fn image() -> SingleGeneration {
        SingleGeneration::for_kind(IMAGE_ID.into(), GenerationKind::Image)
    }

    fn text() -> SingleGeneration {
        SingleGeneration::for_kind("text-1".into(), GenerationKind::Text)
    }

    fn states(generation: &SingleGeneration) -> Vec<GenerationProgress> {
        generation.progress_history().iter().map(|(s, _)| *s).collect()
    }

    /// Shortest table path from `start` to `target`, never passing through `Error`.
    fn path_from(
        table: TransitionTable,
        start: GenerationProgress,
        target: GenerationProgress,
    ) -> Option<Vec<GenerationProgress>> {
        let mut parents: HashMap<GenerationProgress, GenerationProgress> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(state) = queue.pop_front() {
            if state == target {
                let mut path = vec![target];
                let mut cursor = target;
                while let Some(&parent) = parents.get(&cursor) {
                    if parent == start {
                        break;
                    }
                    path.push(parent);
                    cursor = parent;
                }
                path.reverse();
                return Some(path);
            }
            for &next in table.next_states(state) {
                if next == GenerationProgress::Error || next == start || parents.contains_key(&next) {
                    continue;
                }
                parents.insert(next, state);
                queue.push_back(next);
            }
        }
        None
    }

    /// Drive a fresh generation into `target`. Returns false if unreachable.
    fn drive_to(generation: &mut SingleGeneration, target: GenerationProgress) -> bool {
        match target {
            GenerationProgress::NotStarted => true,
            GenerationProgress::Error => {
                generation.on_preloading().unwrap();
                generation.on_error("driven into error", None).unwrap();
                true
            }
            GenerationProgress::Aborted => {
                generation.on_preloading().unwrap();
                generation.on_abort("driven into abort", None)
            }
            _ => {
                let table = generation.transition_table();
                if let Some(path) = path_from(table, GenerationProgress::NotStarted, target) {
                    for state in path {
                        generation.advance(state).unwrap();
                    }
                    return true;
                }
                match path_from(table, GenerationProgress::Aborted, target) {
                    Some(path) => {
                        drive_to(generation, GenerationProgress::Aborted);
                        for state in path {
                            generation.advance(state).unwrap();
                        }
                        true
                    }
                    None => false,
                }
            }
        }
    }

    #[test]
    fn starts_not_started_with_clean_logs() {
        let generation = image();
        assert_eq!(generation.id().as_str(), IMAGE_ID);
        assert_eq!(generation.generation_progress(), GenerationProgress::NotStarted);
        assert_eq!(states(&generation), vec![GenerationProgress::NotStarted]);
        assert!(generation.errored_states().is_empty());
        assert_eq!(generation.generation_failure_count(), 0);
        assert_eq!(generation.is_nsfw(), None);
        assert_eq!(generation.is_csam(), None);
        assert!(generation.generation_result().is_none());
    }

    #[test]
    fn image_without_post_processing_walks_safety_check() {
        let mut generation = image();

        generation.on_preloading().unwrap();
        generation.on_preloading_complete().unwrap();
        generation.on_generating().unwrap();
        generation
            .set_work_result(WorkResult::Image(vec![1, 2, 3]))
            .unwrap();
        assert_eq!(
            generation.on_generation_work_complete().unwrap(),
            GenerationProgress::PendingSafetyCheck
        );
        generation.on_safety_checking().unwrap();
        generation.on_safety_check_complete(false, false).unwrap();
        generation.on_submitting().unwrap();
        generation.on_submit_complete().unwrap();

        assert_eq!(
            states(&generation),
            vec![
                GenerationProgress::NotStarted,
                GenerationProgress::Preloading,
                GenerationProgress::PreloadingComplete,
                GenerationProgress::Generating,
                GenerationProgress::PendingSafetyCheck,
                GenerationProgress::SafetyChecking,
                GenerationProgress::PendingSubmit,
                GenerationProgress::Submitting,
                GenerationProgress::SubmitComplete,
            ]
        );
        assert!(generation.is_finalized());
        assert_eq!(generation.is_nsfw(), Some(false));
        assert_eq!(generation.is_csam(), Some(false));
    }

    #[test]
    fn image_with_post_processing() {
        let caps = Capabilities::for_kind(GenerationKind::Image).with_post_processing(true);
        let mut generation = SingleGeneration::new(
            "img-pp".into(),
            GenerationKind::Image,
            caps,
            default_state_error_limits(),
        )
        .unwrap();

        generation.on_generating().unwrap();
        assert_eq!(
            generation.on_generation_work_complete().unwrap(),
            GenerationProgress::PendingPostProcessing
        );
        generation.on_post_processing().unwrap();
        assert_eq!(
            generation.on_post_processing_complete().unwrap(),
            GenerationProgress::PendingSafetyCheck
        );
    }

    #[test]
    fn text_skips_safety_check() {
        let mut generation = text();
        generation.on_generating().unwrap();
        generation
            .set_work_result(WorkResult::Text("once upon a time".into()))
            .unwrap();
        assert_eq!(
            generation.on_generation_work_complete().unwrap(),
            GenerationProgress::PendingSubmit
        );
        generation.on_submitting().unwrap();
        generation.on_submit_complete().unwrap();
        assert!(generation.is_finalized());
    }

    #[test]
    fn alchemy_post_processes_without_generation() {
        let mut generation = SingleGeneration::for_kind("alc-1".into(), GenerationKind::Alchemy);
        generation.on_preloading().unwrap();
        generation.on_preloading_complete().unwrap();
        generation.on_post_processing().unwrap();
        generation
            .set_work_result(WorkResult::Image(vec![9; 16]))
            .unwrap();
        assert_eq!(
            generation.on_post_processing_complete().unwrap(),
            GenerationProgress::PendingSubmit
        );
        generation.on_submitting().unwrap();
        generation.on_submit_complete().unwrap();
        assert_eq!(generation.generation_progress(), GenerationProgress::SubmitComplete);
    }

    #[test]
    fn every_table_edge_is_reachable_without_error() {
        for make in [image as fn() -> SingleGeneration, text] {
            let table = make().transition_table();
            for from in GenerationProgress::ALL {
                for &to in table.next_states(from) {
                    let mut generation = make();
                    if !drive_to(&mut generation, from) {
                        continue;
                    }
                    assert_eq!(generation.generation_progress(), from);
                    generation
                        .advance(to)
                        .unwrap_or_else(|e| panic!("{table:?}: {from} -> {to} failed: {e}"));
                }
            }
        }
    }

    #[test]
    fn self_transition_always_fails() {
        for make in [image as fn() -> SingleGeneration, text] {
            for state in GenerationProgress::ALL {
                let mut generation = make();
                if !drive_to(&mut generation, state) {
                    continue;
                }
                let err = generation.advance(state).unwrap_err();
                assert!(
                    matches!(err, GenerationError::SelfTransition { .. }),
                    "{state}: {err}"
                );
                assert_eq!(err.class(), ErrorClass::Protocol);
            }
        }
    }

    #[test]
    fn legal_exits_from_error_follow_last_non_error_state() {
        let lasts = [
            GenerationProgress::Preloading,
            GenerationProgress::Generating,
            GenerationProgress::SafetyChecking,
            GenerationProgress::Submitting,
        ];
        for last in lasts {
            let table = image().transition_table();
            for candidate in GenerationProgress::ALL {
                if candidate == GenerationProgress::Error {
                    continue;
                }
                let mut generation = image();
                assert!(drive_to(&mut generation, last));
                generation.on_error("step failed", None).unwrap();

                let expected = candidate == last || table.allows(last, candidate);
                let outcome = generation.advance(candidate);
                assert_eq!(
                    outcome.is_ok(),
                    expected,
                    "from ERROR (after {last}) to {candidate}: {outcome:?}"
                );
                if expected {
                    assert_eq!(generation.errored_states().len(), 1);
                    assert_eq!(generation.errored_states()[0].0, last);
                } else {
                    assert_eq!(generation.generation_progress(), GenerationProgress::Error);
                    assert!(generation.errored_states().is_empty());
                    assert!(generation.error_counts().values().all(|count| *count == 0));
                }
            }
        }
    }

    #[test]
    fn error_limit_allows_configured_retries_then_aborts() {
        let limits = BTreeMap::from([(GenerationProgress::Preloading, 3)]);
        let mut generation = SingleGeneration::new(
            IMAGE_ID.into(),
            GenerationKind::Image,
            Capabilities::for_kind(GenerationKind::Image),
            limits,
        )
        .unwrap();

        generation.on_preloading().unwrap();
        for cycle in 1..=3 {
            generation.on_error(format!("preload failed #{cycle}"), None).unwrap();
            generation.on_preloading().unwrap();
        }
        assert_eq!(generation.generation_progress(), GenerationProgress::Preloading);

        generation.on_error("preload failed #4", None).unwrap();
        let err = generation.on_preloading().unwrap_err();
        match &err {
            GenerationError::StateErrorLimitExceeded {
                state, count, limit, ..
            } => {
                assert_eq!(*state, GenerationProgress::Preloading);
                assert_eq!(*count, 4);
                assert_eq!(*limit, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.class(), ErrorClass::BudgetExhausted);
        assert!(err.is_fatal());
        assert_eq!(generation.generation_progress(), GenerationProgress::Aborted);
        assert_eq!(generation.generation_failure_count(), 4);
        assert_eq!(generation.errored_states().len(), 4);
        assert_eq!(generation.error_counts()[&GenerationProgress::Preloading], 4);
    }

    #[test]
    fn states_without_a_limit_retry_freely() {
        let mut generation = SingleGeneration::new(
            "unlimited".into(),
            GenerationKind::Text,
            Capabilities::for_kind(GenerationKind::Text),
            BTreeMap::new(),
        )
        .unwrap();
        generation.on_generating().unwrap();
        for _ in 0..25 {
            generation.on_error("flaky backend", None).unwrap();
            generation.on_generating().unwrap();
        }
        assert_eq!(generation.error_counts()[&GenerationProgress::Generating], 25);
    }

    #[test]
    fn error_before_any_action_is_a_driver_bug() {
        let mut generation = image();
        let err = generation.on_error("too early", None).unwrap_err();
        assert!(matches!(err, GenerationError::ErrorWithoutHistory { .. }));
        assert_eq!(generation.generation_progress(), GenerationProgress::NotStarted);
        assert_eq!(generation.generation_failure_count(), 1);
    }

    #[test]
    fn failure_messages_and_exceptions_are_logged() {
        let mut generation = image();
        generation.on_preloading().unwrap();
        generation
            .on_error("out of vram", Some(anyhow::anyhow!("CUDA error 2")))
            .unwrap();
        assert_eq!(generation.failure_messages(), ["out of vram".to_string()]);
        assert_eq!(generation.failure_exceptions().len(), 1);
        assert_eq!(generation.failure_exceptions()[0].to_string(), "CUDA error 2");
    }

    #[test]
    fn invalid_transition_is_rejected_without_side_effects() {
        let mut generation = image();
        generation.on_preloading().unwrap();
        let err = generation.on_submit_complete().unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("invalid transition for generation {IMAGE_ID} from PRELOADING to SUBMIT_COMPLETE")
        );
        assert_eq!(generation.generation_progress(), GenerationProgress::Preloading);
        assert_eq!(states(&generation).len(), 2);
    }

    #[test]
    fn safety_check_complete_requires_a_result() {
        let mut generation = image();
        generation.on_generating().unwrap();
        generation.on_generation_work_complete().unwrap();
        generation.on_safety_checking().unwrap();

        let err = generation.on_safety_check_complete(true, false).unwrap_err();
        assert!(matches!(err, GenerationError::MissingWorkResult { .. }));
        assert_eq!(generation.generation_progress(), GenerationProgress::SafetyChecking);
        assert_eq!(generation.is_nsfw(), None);

        generation
            .set_work_result(WorkResult::Image(vec![0xff]))
            .unwrap();
        generation.on_safety_check_complete(true, false).unwrap();
        assert_eq!(generation.is_nsfw(), Some(true));
        assert_eq!(generation.is_csam(), Some(false));
    }

    #[test]
    fn work_result_must_match_kind_and_is_set_once() {
        let mut generation = image();
        let err = generation
            .set_work_result(WorkResult::Text("not an image".into()))
            .unwrap_err();
        assert!(matches!(err, GenerationError::ResultKindMismatch { .. }));

        generation.set_work_result(WorkResult::Image(vec![1])).unwrap();
        let err = generation
            .set_work_result(WorkResult::Image(vec![2]))
            .unwrap_err();
        assert!(matches!(err, GenerationError::ResultAlreadySet { .. }));
        assert_eq!(generation.generation_result(), Some(&WorkResult::Image(vec![1])));
    }

    #[test]
    fn abort_is_forced_and_idempotent() {
        let mut generation = image();
        assert!(generation.on_abort("GPU_OUT_OF_MEMORY", None));
        assert_eq!(generation.generation_progress(), GenerationProgress::Aborted);
        assert!(!generation.on_abort("GPU_OUT_OF_MEMORY", None));
        assert_eq!(generation.failure_messages(), ["GPU_OUT_OF_MEMORY".to_string()]);

        generation.advance(GenerationProgress::ReportedFailed).unwrap();
        assert!(generation.is_finalized());
    }

    #[test]
    fn failed_report_can_be_retried_from_aborted() {
        let mut generation = text();
        generation.on_generating().unwrap();
        generation.on_abort("UNHANDLED_EXCEPTION", None);
        generation.on_error("dispatcher unreachable", None).unwrap();
        generation.advance(GenerationProgress::Aborted).unwrap();
        generation.advance(GenerationProgress::ReportedFailed).unwrap();
        assert_eq!(generation.error_counts()[&GenerationProgress::Aborted], 1);
    }

    #[test]
    fn user_abort_path() {
        let mut generation = text();
        generation.on_generating().unwrap();
        generation.on_user_requested_abort().unwrap();
        assert!(generation.is_failing());
        generation.on_user_abort_complete().unwrap();
        assert!(generation.is_finalized());
    }

    #[test]
    fn events_drive_the_same_callbacks() {
        let mut generation = text();
        let events = vec![
            GenerationEvent::Preloading,
            GenerationEvent::PreloadingComplete,
            GenerationEvent::Generating,
            GenerationEvent::Failed {
                message: "timeout".into(),
            },
            GenerationEvent::Generating,
            GenerationEvent::WorkResult(WorkResult::Text("done".into())),
            GenerationEvent::GenerationWorkComplete,
            GenerationEvent::Submitting,
            GenerationEvent::SubmitComplete,
        ];
        for event in events {
            generation.apply(event).unwrap();
        }
        assert_eq!(generation.generation_progress(), GenerationProgress::SubmitComplete);
        assert_eq!(generation.generation_failure_count(), 1);
        assert_eq!(generation.error_counts()[&GenerationProgress::Generating], 1);
    }
}
