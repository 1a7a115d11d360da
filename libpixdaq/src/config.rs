use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::error::ConfigError;
use super::event_builder::EventWindow;

/// Structure representing the acquisition configuration.
/// Configs are serializable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Fixed cadence of the FIFO polling loop, milliseconds
    pub poll_interval_ms: u64,
    /// Raise NoDataTimeout when no words arrive for this long, seconds
    pub no_data_timeout_s: Option<f64>,
    /// Bounded wait when joining the reader thread on stop, seconds
    pub stop_timeout_s: f64,
    /// Depth of the distribution and per-channel queues, in chunks
    pub queue_depth: usize,
    /// Sampling cadence of the error-counter watchdog, milliseconds
    pub watchdog_interval_ms: u64,
    /// Abort the readout when the hardware reports discarded words
    pub abort_on_fifo_error: bool,
    /// Check the soft/hard link error counters (normally left off)
    pub check_link_errors: bool,
    /// Target chunk size for offline processing of stored data, in words
    pub chunk_size: u64,
    /// Trigger acceptance window, hardware clock ticks (open interval).
    /// The upper bound must stay below the hardware veto length.
    pub event_window: EventWindow,
    /// One row in `shift_period` is enabled per shift step
    pub shift_period: usize,
    /// Column stagger of the shift pattern (0 for straight rows)
    pub shift_stagger: usize,
    /// Skip shift steps whose enable plane comes out empty
    pub skip_empty_steps: bool,
    /// Record register-write batches so an identical scan can be replayed
    pub cache_shift_commands: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            no_data_timeout_s: Some(10.0),
            stop_timeout_s: 5.0,
            queue_depth: 64,
            watchdog_interval_ms: 1000,
            abort_on_fifo_error: true,
            check_link_errors: false,
            chunk_size: 1_000_000,
            event_window: EventWindow::default(),
            shift_period: 4,
            shift_stagger: 1,
            skip_empty_steps: true,
            cache_shift_commands: false,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn no_data_timeout(&self) -> Option<Duration> {
        self.no_data_timeout_s.map(Duration::from_secs_f64)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout_s)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}
