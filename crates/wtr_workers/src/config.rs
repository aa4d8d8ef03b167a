use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use wtr_queue::chunker::{ChunkType, Chunker};
use wtr_queue::{GroupPolicy, QueueError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config")]
    Parse(#[from] toml::de::Error),
}

/// Settings for one test run.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Requested number of managers. Fewer run if there are fewer groups.
    pub processes: usize,
    pub group_policy: GroupPolicy,
    pub chunk_type: ChunkType,
    /// Chunk of the run to execute, counting from 1.
    pub this_chunk: usize,
    pub total_chunks: usize,
    pub timeout_multiplier: f64,
    /// Consecutive failed browser starts tolerated before a manager gives up.
    pub max_restarts: usize,
    pub restart_on_unexpected: bool,
    pub restart_on_new_group: bool,
    pub pause_after_test: bool,
    pub pause_on_unexpected: bool,
    /// Never time tests out, and stop once the browser is closed.
    pub debug_interactive: bool,
    /// Times each test is run.
    pub rerun: u32,
    /// Non-zero when re-running unexpected results; every test then gets a fresh browser.
    pub retry_index: u32,
    pub sanitizer: bool,
    pub poll_interval_ms: u64,
    pub runner_stop_timeout_ms: u64,
    pub cleanup_timeout_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            processes: 1,
            group_policy: GroupPolicy::SingleTestSource,
            chunk_type: ChunkType::None,
            this_chunk: 1,
            total_chunks: 1,
            timeout_multiplier: 1.0,
            max_restarts: 5,
            restart_on_unexpected: true,
            restart_on_new_group: true,
            pause_after_test: false,
            pause_on_unexpected: false,
            debug_interactive: false,
            rerun: 1,
            retry_index: 0,
            sanitizer: false,
            poll_interval_ms: 1000,
            runner_stop_timeout_ms: 10_000,
            cleanup_timeout_ms: 10_000,
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let toml_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&toml_str)
    }

    pub fn chunker(&self) -> Result<Chunker, QueueError> {
        Chunker::new(self.chunk_type.clone(), self.this_chunk, self.total_chunks)
    }

    /// Time a test is given before the manager declares it hung.
    pub fn external_timeout(&self, test_timeout: Duration, extra_timeout: Duration) -> Duration {
        // Executors nest several timeouts of their own inside the test's, each with up to
        // `extra_timeout` of slack.
        let multiplier = if self.timeout_multiplier.is_finite() && self.timeout_multiplier > 0.0 {
            self.timeout_multiplier
        } else {
            1.0
        };
        let scaled = Duration::try_from_secs_f64(test_timeout.as_secs_f64() * multiplier)
            .unwrap_or(Duration::MAX);
        scaled.saturating_add(extra_timeout.saturating_mul(3))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn runner_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.runner_stop_timeout_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::time::Duration;

    use indoc::indoc;
    use tempfile::NamedTempFile;
    use wtr_queue::chunker::ChunkType;
    use wtr_queue::GroupPolicy;

    use super::{ConfigError, RunConfig};

    #[test]
    fn empty_config_is_default() {
        assert_eq!(RunConfig::from_toml_str("").unwrap(), RunConfig::default());
    }

    #[test]
    fn parse_full_config() {
        let config = RunConfig::from_toml_str(indoc! {r#"
            processes = 4
            timeout_multiplier = 2.5
            max_restarts = 2
            restart_on_unexpected = false
            rerun = 3
            sanitizer = true
            poll_interval_ms = 50
            total_chunks = 3
            this_chunk = 2

            [group_policy]
            kind = "path-grouped"
            depth = 2

            [chunk_type]
            kind = "dir-hash"
            depth = 1
        "#})
        .unwrap();

        assert_eq!(config.processes, 4);
        assert_eq!(config.max_restarts, 2);
        assert!(!config.restart_on_unexpected);
        assert!(config.restart_on_new_group);
        assert_eq!(config.rerun, 3);
        assert!(config.sanitizer);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(
            config.group_policy,
            GroupPolicy::PathGrouped {
                depth: Some(2),
                small_subsuite_size: 10
            }
        );
        assert_eq!(config.chunk_type, ChunkType::DirHash { depth: Some(1) });
        assert!(config.chunker().is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = RunConfig::from_toml_str("procesess = 4").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn external_timeout_scales_and_pads() {
        let config = RunConfig {
            timeout_multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(
            config.external_timeout(Duration::from_secs(10), Duration::from_secs(1)),
            Duration::from_secs(23)
        );
    }

    #[test]
    fn external_timeout_saturates() {
        let config = RunConfig {
            timeout_multiplier: 4.0,
            ..Default::default()
        };
        assert_eq!(
            config.external_timeout(Duration::MAX, Duration::ZERO),
            Duration::MAX
        );
        assert_eq!(
            config.external_timeout(Duration::from_secs(1), Duration::MAX),
            Duration::MAX
        );
    }

    #[test]
    fn read_config_from_disk() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "processes = 7").unwrap();
        let config = RunConfig::from_path(file.path()).unwrap();
        assert_eq!(config.processes, 7);

        let missing = RunConfig::from_path("/no/such/config.toml".as_ref()).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
