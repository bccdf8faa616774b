//! Server configuration, loaded from `<storage root>/config.toml` when
//! present. Every section has serde defaults so a partial file is fine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ReviewError, Result};
use crate::models::Strictness;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: HttpConfig,
    pub storage: StorageConfig,
    pub consensus: ConsensusConfig,
    pub dedup: DedupConfig,
    pub runner: RunnerConfig,
    pub assist: AssistConfig,
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    /// Broadcast capacity per session; SSE subscribers that lag past this
    /// drop activity events but never miss a later phase change.
    pub event_capacity: usize,
    pub max_subscribers: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            event_capacity: 256,
            max_subscribers: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".arv"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// A side wins when it exceeds the other by at least this weight.
    pub threshold: f64,
    pub max_turns: u32,
    pub max_verification_rounds: u32,
    /// Minimum weight for an explicit confidence vote.
    pub min_confidence_weight: f64,
    pub strict_weight: f64,
    pub balanced_weight: f64,
    pub lenient_weight: f64,
    /// Seconds before non-responders are skipped and the turn advances.
    pub turn_deadline_secs: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: 2.0,
            max_turns: 3,
            max_verification_rounds: 2,
            min_confidence_weight: 0.1,
            strict_weight: 1.0,
            balanced_weight: 0.7,
            lenient_weight: 0.4,
            turn_deadline_secs: 600,
        }
    }
}

impl ConsensusConfig {
    pub fn strictness_weight(&self, strictness: Strictness) -> f64 {
        match strictness {
            Strictness::Strict => self.strict_weight,
            Strictness::Balanced => self.balanced_weight,
            Strictness::Lenient => self.lenient_weight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Line-range proximity window for merging candidate duplicates.
    pub line_proximity: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { line_proximity: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// When false the engine never launches client subprocesses; reviewers
    /// are triggered externally and talk back over the API (manual mode).
    pub autospawn: bool,
    /// Soft deadline for one reviewer run.
    pub deadline_secs: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_grace_secs: u64,
    /// Retained tail of stdout/stderr, per stream.
    pub stream_tail_bytes: usize,
    /// Activity events retained per model; overflow drops oldest.
    pub activity_capacity: usize,
    /// Backoff delays for transient spawn failures.
    pub retry_delays_secs: Vec<u64>,
    /// Runtime text fields (last_output/last_error) are clipped to this.
    pub runtime_text_limit: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            autospawn: true,
            deadline_secs: 1800,
            kill_grace_secs: 5,
            stream_tail_bytes: 8 * 1024,
            activity_capacity: 50,
            retry_delays_secs: vec![1, 2],
            runtime_text_limit: 12_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistConfig {
    pub timeout_secs: u64,
}

impl Default for AssistConfig {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

impl ServerConfig {
    pub async fn load(storage_root: &Path) -> Result<Self> {
        let config_path = storage_root.join("config.toml");
        let mut config: Self = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.storage.root = storage_root.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.consensus.threshold <= 0.0 {
            errors.push("consensus.threshold must be positive");
        }
        if self.consensus.max_turns == 0 {
            errors.push("consensus.max_turns must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.consensus.min_confidence_weight) {
            errors.push("consensus.min_confidence_weight must be within [0, 1]");
        }
        for (name, w) in [
            ("strict_weight", self.consensus.strict_weight),
            ("balanced_weight", self.consensus.balanced_weight),
            ("lenient_weight", self.consensus.lenient_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                errors.push(match name {
                    "strict_weight" => "consensus.strict_weight must be within [0, 1]",
                    "balanced_weight" => "consensus.balanced_weight must be within [0, 1]",
                    _ => "consensus.lenient_weight must be within [0, 1]",
                });
            }
        }
        if self.runner.deadline_secs == 0 {
            errors.push("runner.deadline_secs must be greater than 0");
        }
        if self.runner.activity_capacity < 50 {
            errors.push("runner.activity_capacity must be at least 50");
        }
        if self.runner.stream_tail_bytes < 8 * 1024 {
            errors.push("runner.stream_tail_bytes must be at least 8 KiB");
        }
        if self.server.event_capacity == 0 {
            errors.push("server.event_capacity must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReviewError::Config(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_strictness_weights() {
        let c = ConsensusConfig::default();
        assert_eq!(c.strictness_weight(Strictness::Strict), 1.0);
        assert_eq!(c.strictness_weight(Strictness::Balanced), 0.7);
        assert_eq!(c.strictness_weight(Strictness::Lenient), 0.4);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ServerConfig =
            toml::from_str("[consensus]\nthreshold = 3.0\n").unwrap();
        assert_eq!(config.consensus.threshold, 3.0);
        assert_eq!(config.consensus.max_turns, 3);
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = ServerConfig::default();
        config.consensus.threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_activity_capacity_floor() {
        let mut config = ServerConfig::default();
        config.runner.activity_capacity = 10;
        assert!(config.validate().is_err());
    }
}
