//! What a job is built from.
//!
//! A [`DispatchConverter`] turns a dispatcher's raw "pop" response into a
//! parameter set (what to generate) and [`DispatchParameters`] (ids, TTL,
//! upload URLs). Converters for concrete APIs live with their API client;
//! this module only fixes the contract.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::generation::{Capabilities, GenerationId, GenerationKind};

/// What a job needs to know about its generations.
pub trait GenerationParameters {
    fn kind(&self) -> GenerationKind;

    /// Number of results the job must produce. Used when no ids are supplied.
    fn expected_result_count(&self) -> usize {
        1
    }

    /// Caller-chosen generation ids, if any.
    fn generation_ids(&self) -> Option<Vec<GenerationId>> {
        None
    }

    fn requires_post_processing(&self) -> bool {
        self.kind().profile().default_post_processing
    }

    fn requires_safety_check(&self) -> bool {
        self.kind().profile().requires_safety_check
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::for_kind(self.kind())
            .with_post_processing(self.requires_post_processing())
            .with_safety_check(self.requires_safety_check())
    }
}

/// A plain parameter set for callers without a richer API model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub kind: GenerationKind,
    #[serde(default = "default_result_count")]
    pub result_count: usize,
    #[serde(default)]
    pub generation_ids: Option<Vec<GenerationId>>,
    #[serde(default)]
    pub post_processing: Option<bool>,
    #[serde(default)]
    pub safety_check: Option<bool>,
}

fn default_result_count() -> usize {
    1
}

impl ParameterSet {
    pub fn new(kind: GenerationKind) -> Self {
        Self {
            kind,
            result_count: 1,
            generation_ids: None,
            post_processing: None,
            safety_check: None,
        }
    }

    pub fn with_result_count(mut self, result_count: usize) -> Self {
        self.result_count = result_count;
        self
    }

    pub fn with_generation_ids(mut self, ids: impl IntoIterator<Item = GenerationId>) -> Self {
        self.generation_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_post_processing(mut self, post_processing: bool) -> Self {
        self.post_processing = Some(post_processing);
        self
    }

    pub fn with_safety_check(mut self, safety_check: bool) -> Self {
        self.safety_check = Some(safety_check);
        self
    }
}

impl GenerationParameters for ParameterSet {
    fn kind(&self) -> GenerationKind {
        self.kind
    }

    fn expected_result_count(&self) -> usize {
        self.generation_ids
            .as_ref()
            .map_or(self.result_count, Vec::len)
    }

    fn generation_ids(&self) -> Option<Vec<GenerationId>> {
        self.generation_ids.clone()
    }

    fn requires_post_processing(&self) -> bool {
        self.post_processing
            .unwrap_or(self.kind.profile().default_post_processing)
    }

    fn requires_safety_check(&self) -> bool {
        self.safety_check
            .unwrap_or(self.kind.profile().requires_safety_check)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchSource {
    #[default]
    #[serde(rename = "LOCAL_CUSTOM_3RD_PARTY")]
    LocalCustom3rdParty,
    AiHordeApiOfficial,
    AiHordeApiFork,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferenceBackend {
    /// The backend name is prefixed to the model name.
    InModelName,
    CustomUnpublished,
    Comfyui,
    A1111,
    HordeAlchemist,
    KoboldCpp,
    Aphrodite,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendConstraints {
    #[default]
    Any,
    Specified,
    DefaultImage,
    DefaultText,
    DefaultAudio,
    DefaultVideo,
    DefaultAlchemy,
    NoCustom,
    OnlyCustom,
}

/// What to do when a requested source image is unusable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceImageFallback {
    Txt2imgFallback,
    #[default]
    Abandon,
    UseWhiteImage,
    UseBlackImage,
    UseNoiseImage,
}

/// Dispatcher-side metadata for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchParameters {
    /// One id per expected result.
    pub generation_ids: Vec<GenerationId>,
    #[serde(default)]
    pub dispatch_source: DispatchSource,
    /// Seconds before the dispatcher considers the job stale.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub inference_backend: Option<InferenceBackend>,
    #[serde(default)]
    pub requested_backend_constraints: BackendConstraints,
    #[serde(default)]
    pub source_image_fallback_choice: SourceImageFallback,
    /// Destination URL per generation. Ids without an entry are not uploaded.
    #[serde(default)]
    pub upload_urls: BTreeMap<GenerationId, String>,
}

impl DispatchParameters {
    pub fn new(generation_ids: impl IntoIterator<Item = GenerationId>) -> Self {
        Self {
            generation_ids: generation_ids.into_iter().collect(),
            dispatch_source: DispatchSource::default(),
            ttl_secs: None,
            inference_backend: None,
            requested_backend_constraints: BackendConstraints::default(),
            source_image_fallback_choice: SourceImageFallback::default(),
            upload_urls: BTreeMap::new(),
        }
    }

    pub fn with_upload_url(mut self, id: GenerationId, url: impl Into<String>) -> Self {
        self.upload_urls.insert(id, url.into());
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    /// Every generation id mapped to its upload URL, or `None` for "no upload".
    pub fn upload_map(&self) -> BTreeMap<GenerationId, Option<String>> {
        self.generation_ids
            .iter()
            .map(|id| (id.clone(), self.upload_urls.get(id).cloned()))
            .collect()
    }
}

/// Translates an API-specific pop response into job inputs.
pub trait DispatchConverter {
    type PopResponse;
    type Parameters: GenerationParameters;
    type Error: std::error::Error;

    fn convert(
        &self,
        response: &Self::PopResponse,
    ) -> Result<(Self::Parameters, DispatchParameters), Self::Error>;
}
