mod kind;
mod progress;
mod single;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use kind::{Capabilities, GenerationKind, KindProfile, ResultKind, WorkResult};
pub use progress::{GenerationProgress, TransitionTable};
pub use single::{GenerationEvent, SingleGeneration};

/// Opaque, caller-supplied identifier of one generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(String);

impl GenerationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh v4 UUID, for dispatches that did not name their generations.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GenerationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for GenerationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Uuid> for GenerationId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}
