//! Engine Configuration

use serde::Deserialize;
use std::time::Duration;
use trellis_job::JobConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per offloaded job before the session is failed.
    pub job_max_attempts: u32,
    /// Delay between job attempts, in milliseconds.
    pub job_retry_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            job_max_attempts: 3,
            job_retry_delay_ms: 500,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn job_config(&self) -> JobConfig {
        JobConfig {
            max_attempts: self.job_max_attempts,
            retry_delay: Duration::from_millis(self.job_retry_delay_ms),
        }
    }
}
