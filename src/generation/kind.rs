use std::fmt;

use serde::{Deserialize, Serialize};

use super::progress::TransitionTable;
use crate::error::GenerationError;

/// The type of work a generation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Image,
    Text,
    /// Transformative or analytical work on an existing input (upscaling, captioning, NSFW detection).
    Alchemy,
}

/// Static contract shared by every generation of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindProfile {
    pub requires_generation: bool,
    pub requires_safety_check: bool,
    pub default_post_processing: bool,
    pub result_kind: ResultKind,
    pub default_table: TransitionTable,
}

const IMAGE_PROFILE: KindProfile = KindProfile {
    requires_generation: true,
    requires_safety_check: true,
    default_post_processing: false,
    result_kind: ResultKind::Image,
    default_table: TransitionTable::WithSafetyCheck,
};

const TEXT_PROFILE: KindProfile = KindProfile {
    requires_generation: true,
    requires_safety_check: false,
    default_post_processing: false,
    result_kind: ResultKind::Text,
    default_table: TransitionTable::WithoutSafetyCheck,
};

const ALCHEMY_PROFILE: KindProfile = KindProfile {
    requires_generation: false,
    requires_safety_check: false,
    default_post_processing: true,
    result_kind: ResultKind::Image,
    default_table: TransitionTable::WithoutSafetyCheck,
};

impl GenerationKind {
    pub fn profile(self) -> &'static KindProfile {
        match self {
            GenerationKind::Image => &IMAGE_PROFILE,
            GenerationKind::Text => &TEXT_PROFILE,
            GenerationKind::Alchemy => &ALCHEMY_PROFILE,
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationKind::Image => write!(f, "image"),
            GenerationKind::Text => write!(f, "text"),
            GenerationKind::Alchemy => write!(f, "alchemy"),
        }
    }
}

/// The steps a particular generation goes through, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub requires_generation: bool,
    pub requires_post_processing: bool,
    pub requires_safety_check: bool,
}

impl Capabilities {
    /// The default capabilities for `kind`.
    pub fn for_kind(kind: GenerationKind) -> Self {
        let profile = kind.profile();
        Self {
            requires_generation: profile.requires_generation,
            requires_post_processing: profile.default_post_processing,
            requires_safety_check: profile.requires_safety_check,
        }
    }

    pub fn with_post_processing(mut self, requires_post_processing: bool) -> Self {
        self.requires_post_processing = requires_post_processing;
        self
    }

    pub fn with_safety_check(mut self, requires_safety_check: bool) -> Self {
        self.requires_safety_check = requires_safety_check;
        self
    }

    pub fn with_generation(mut self, requires_generation: bool) -> Self {
        self.requires_generation = requires_generation;
        self
    }

    /// Reject capability sets that drop a step the kind always needs.
    pub fn validate(&self, kind: GenerationKind) -> Result<(), GenerationError> {
        let profile = kind.profile();
        if profile.requires_generation && !self.requires_generation {
            return Err(GenerationError::CapabilityMismatch {
                kind,
                capability: "generation",
            });
        }
        if profile.requires_safety_check && !self.requires_safety_check {
            return Err(GenerationError::CapabilityMismatch {
                kind,
                capability: "a safety check",
            });
        }
        Ok(())
    }

    /// The table a generation with these capabilities follows.
    pub fn transition_table(&self) -> TransitionTable {
        if self.requires_safety_check {
            TransitionTable::WithSafetyCheck
        } else {
            TransitionTable::WithoutSafetyCheck
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Image,
    Text,
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultKind::Image => write!(f, "image"),
            ResultKind::Text => write!(f, "text"),
        }
    }
}

/// The artifact a generation produced.
#[derive(Clone, PartialEq, Eq)]
pub enum WorkResult {
    /// Encoded image bytes, ready to upload.
    Image(Vec<u8>),
    Text(String),
}

impl WorkResult {
    pub fn kind(&self) -> ResultKind {
        match self {
            WorkResult::Image(_) => ResultKind::Image,
            WorkResult::Text(_) => ResultKind::Text,
        }
    }

    /// The bytes delivered on upload. Text is sent as UTF-8.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WorkResult::Image(bytes) => bytes,
            WorkResult::Text(text) => text.as_bytes(),
        }
    }
}

impl fmt::Debug for WorkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkResult::Image(bytes) => write!(f, "Image({} bytes)", bytes.len()),
            WorkResult::Text(text) => f.debug_tuple("Text").field(text).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_contract_requires_generation_and_safety_check() {
        let caps = Capabilities::for_kind(GenerationKind::Image);
        assert!(caps.validate(GenerationKind::Image).is_ok());
        assert_eq!(caps.transition_table(), TransitionTable::WithSafetyCheck);

        let err = caps
            .with_safety_check(false)
            .validate(GenerationKind::Image)
            .unwrap_err();
        assert!(matches!(
            err,
            GenerationError::CapabilityMismatch {
                kind: GenerationKind::Image,
                ..
            }
        ));

        let err = caps
            .with_generation(false)
            .validate(GenerationKind::Image)
            .unwrap_err();
        assert_eq!(err.to_string(), "image generations require generation");
    }

    #[test]
    fn text_may_opt_into_safety_check() {
        let caps = Capabilities::for_kind(GenerationKind::Text);
        assert_eq!(caps.transition_table(), TransitionTable::WithoutSafetyCheck);

        let checked = caps.with_safety_check(true);
        assert!(checked.validate(GenerationKind::Text).is_ok());
        assert_eq!(checked.transition_table(), TransitionTable::WithSafetyCheck);
    }

    #[test]
    fn alchemy_defaults() {
        let caps = Capabilities::for_kind(GenerationKind::Alchemy);
        assert!(!caps.requires_generation);
        assert!(caps.requires_post_processing);
        assert!(!caps.requires_safety_check);
        assert!(caps.validate(GenerationKind::Alchemy).is_ok());
        assert_eq!(GenerationKind::Alchemy.profile().result_kind, ResultKind::Image);
    }

    #[test]
    fn text_result_uploads_as_utf8() {
        let result = WorkResult::Text("héllo".into());
        assert_eq!(result.kind(), ResultKind::Text);
        assert_eq!(result.as_bytes(), "héllo".as_bytes());
        assert_eq!(format!("{:?}", WorkResult::Image(vec![0; 4])), "Image(4 bytes)");
    }
}
