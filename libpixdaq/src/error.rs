use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced through the readout error callback.
///
/// Decoder-level frame desync and trigger-sequence gaps are deliberately not
/// part of this taxonomy: they are common under normal noisy operation and are
/// tracked as counters so that otherwise-valid data is not lost.
#[derive(Debug, Clone, Error)]
pub enum AcquisitionError {
    #[error("RX link lost synchronization on channel {0}")]
    RxSync(usize),
    #[error("Hard link error counter reached {count} on channel {channel}")]
    Hard { channel: usize, count: u32 },
    #[error("Soft link error counter reached {count} on channel {channel}")]
    Soft { channel: usize, count: u32 },
    #[error("FIFO discarded {count} words on channel {channel}; data was lost")]
    FifoDiscard { channel: usize, count: u32 },
    #[error("No data received from the FIFO for more than {0:?}")]
    NoDataTimeout(Duration),
    #[error("Reader thread did not stop within {0:?}")]
    StopTimeout(Duration),
}

impl AcquisitionError {
    /// True for errors meaning the hardware already lost data.
    ///
    /// The default error policy aborts the readout only for these.
    pub fn is_fifo_error(&self) -> bool {
        matches!(self, AcquisitionError::FifoDiscard { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

/// Errors of the outer scan driver, composing configuration and acquisition
/// failures
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Scan failed due to acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),
    #[error("Scan failed due to configuration error: {0}")]
    Config(#[from] ConfigError),
}
