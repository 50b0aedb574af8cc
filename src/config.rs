//! Job configuration, typically loaded from a TOML file.
//!
//! Every field has a default, so an empty file (or none at all) yields a
//! usable [`JobConfig`]. Loaders always validate the result.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::generation::GenerationProgress;

/// Limits and timings shared by every generation of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Failed submits in a row before the job is faulted and abandoned.
    #[serde(default = "default_max_consecutive_failed_job_submits")]
    pub max_consecutive_failed_job_submits: u32,

    /// Failures per generation before it counts as over the limit.
    #[serde(default = "default_max_generation_failures")]
    pub max_generation_failures: u32,

    #[serde(default = "default_job_submit_retry_delay_ms")]
    pub job_submit_retry_delay_ms: u64,

    /// Timeout for a single upload attempt.
    #[serde(default = "default_upload_timeout_ms")]
    pub upload_timeout_ms: u64,

    /// Upload attempts per result.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Maximum error-retry cycles per state. States not listed are unlimited.
    #[serde(default = "default_state_error_limits", with = "state_limits")]
    pub state_error_limits: BTreeMap<GenerationProgress, u32>,
}

fn default_max_consecutive_failed_job_submits() -> u32 {
    3
}

fn default_max_generation_failures() -> u32 {
    3
}

fn default_job_submit_retry_delay_ms() -> u64 {
    2000
}

fn default_upload_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    1000
}

/// The error budget used when a job does not configure its own.
pub fn default_state_error_limits() -> BTreeMap<GenerationProgress, u32> {
    BTreeMap::from([
        (GenerationProgress::Preloading, 3),
        (GenerationProgress::Generating, 3),
        (GenerationProgress::SafetyChecking, 3),
        (GenerationProgress::Submitting, 10),
        (GenerationProgress::UserRequestedAbort, 10),
    ])
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failed_job_submits: default_max_consecutive_failed_job_submits(),
            max_generation_failures: default_max_generation_failures(),
            job_submit_retry_delay_ms: default_job_submit_retry_delay_ms(),
            upload_timeout_ms: default_upload_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            state_error_limits: default_state_error_limits(),
        }
    }
}

impl JobConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: JobConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults if the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=10).contains(&self.max_consecutive_failed_job_submits) {
            return Err(ConfigError::Invalid {
                field: "max_consecutive_failed_job_submits",
                message: format!(
                    "{} is outside 1..=10",
                    self.max_consecutive_failed_job_submits
                ),
            });
        }
        if self.max_generation_failures > 10 {
            return Err(ConfigError::Invalid {
                field: "max_generation_failures",
                message: format!("{} is outside 0..=10", self.max_generation_failures),
            });
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "max_retries",
                message: "at least one upload attempt is required".to_string(),
            });
        }
        if self.upload_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "upload_timeout_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn job_submit_retry_delay(&self) -> Duration {
        Duration::from_millis(self.job_submit_retry_delay_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// TOML tables are keyed by the wire names, e.g. `PRELOADING = 3`.
mod state_limits {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::generation::GenerationProgress;

    pub fn serialize<S>(
        limits: &BTreeMap<GenerationProgress, u32>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let named: BTreeMap<&str, u32> = limits
            .iter()
            .map(|(state, limit)| (state.as_str(), *limit))
            .collect();
        named.serialize(serializer)
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<BTreeMap<GenerationProgress, u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        BTreeMap::<String, u32>::deserialize(deserializer)?
            .into_iter()
            .map(|(name, limit)| {
                name.parse::<GenerationProgress>()
                    .map(|state| (state, limit))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
