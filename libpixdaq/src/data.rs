//! The data records flowing through the acquisition pipeline.

use std::ops::Range;

/// A raw word as emitted by the readout hardware
pub type RawWord = u32;

/// One FIFO poll's worth of raw data.
///
/// Chunks are immutable once produced by the reader thread and are queued at
/// most once per consumer channel. The timestamps bracket the poll that
/// produced the chunk, in seconds since the readout started.
#[derive(Debug, Clone, Default)]
pub struct ReadoutChunk {
    pub words: Vec<RawWord>,
    pub t_start: f64,
    pub t_stop: f64,
    pub error: u32,
}

/// One decoded pixel hit.
///
/// Trigger words also surface here as pseudo-hits with
/// `column == TRIGGER_COLUMN`, carrying the hardware trigger number and
/// timestamp instead of pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hit {
    pub column: u16,
    pub row: u16,
    /// Leading edge time, converted from the 7-bit Gray-coded source field
    pub leading_edge: u8,
    /// Trailing edge time, converted from the 7-bit Gray-coded source field
    pub trailing_edge: u8,
    pub frame_id: i64,
    pub noise: bool,
    pub timestamp: u64,
    pub trigger_number: u16,
    pub scan_param_id: u32,
}

impl Hit {
    /// Time over threshold in clock ticks, modulo the 7-bit counter range
    pub fn charge(&self) -> u8 {
        self.trailing_edge.wrapping_sub(self.leading_edge) & crate::constants::EDGE_MASK
    }
}

/// One trigger-scoped event emitted by the event builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub event_number: u64,
    pub trigger_number: u64,
    pub column: u16,
    pub row: u16,
    pub charge: u8,
    pub timestamp: u64,
}

/// The per-append metadata row of the raw-data sink contract.
///
/// `index_start..index_stop` is the half-open range of the appended words
/// within the stored raw-word timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadoutMeta {
    pub scan_param_id: u32,
    pub index_start: u64,
    pub index_stop: u64,
}

/// One sub-range of the stored raw-word timeline belonging to a single scan
/// parameter, as produced by the chunk splitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanParameterChunk {
    pub scan_param_id: u32,
    pub word_range: Range<u64>,
}
