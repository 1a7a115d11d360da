//! Interfaces to the readout hardware and to the raw-data storage layer.
//!
//! The acquisition core never talks to a device directly; it is handed
//! implementations of these traits. Register semantics, chip power-up and the
//! storage file format all live behind them.

use super::data::{ReadoutChunk, ReadoutMeta};

/// The hardware FIFO holding raw words on the readout board.
///
/// `read_data` is assumed non-blocking and returns whatever is currently
/// buffered. The handle is owned exclusively by the reader thread while a
/// readout is running.
pub trait HardwareFifo: Send {
    /// Read all currently available words in a single call
    fn read_data(&mut self) -> Vec<u32>;
    /// Number of words currently buffered
    fn fifo_size(&self) -> usize;
    /// Clear the FIFO and any pending hardware state
    fn reset(&mut self);
}

/// Hardware error counters sampled by the watchdog.
///
/// These live on a register interface separate from the data path, so the
/// watchdog can read them while the reader thread owns the FIFO.
pub trait RxCounters: Send + Sync {
    /// Per-channel count of words the hardware discarded (buffer overflow)
    fn discard_counts(&self) -> Vec<u32>;
    /// Per-channel soft link error counters (disabled by default)
    fn soft_error_counts(&self) -> Vec<u32> {
        Vec::new()
    }
    /// Per-channel hard link error counters (disabled by default)
    fn hard_error_counts(&self) -> Vec<u32> {
        Vec::new()
    }
    /// Per-channel RX synchronization status (disabled by default)
    fn rx_sync_lost(&self) -> Vec<bool> {
        Vec::new()
    }
}

/// The command/register interface of the chip.
///
/// Accepts batches of pre-encoded byte sequences. The mask writer hands it
/// register-write batches; no error conditions are expected from the write
/// path itself.
pub trait CommandSink {
    fn send(&mut self, block: &[u8]);
}

/// A CommandSink that drops everything, for dry runs
#[derive(Debug, Default)]
pub struct NullCommandSink;

impl CommandSink for NullCommandSink {
    fn send(&mut self, _block: &[u8]) {}
}

/// A CommandSink keeping every sent block, for inspection and caching
#[derive(Debug, Default)]
pub struct VecCommandSink {
    pub blocks: Vec<Vec<u8>>,
}

impl CommandSink for VecCommandSink {
    fn send(&mut self, block: &[u8]) {
        self.blocks.push(block.to_vec());
    }
}

/// Append-only raw-data storage contract.
///
/// Every append stores the chunk's words plus one parallel metadata row
/// recording the word index range and the scan parameter the words belong to.
/// The stored timeline is consumed later by the chunk splitter.
pub trait RawDataSink: Send {
    fn append(&mut self, chunk: &ReadoutChunk, scan_param_id: u32);
}

/// In-memory implementation of [`RawDataSink`], backing tests and dry runs
#[derive(Debug, Default)]
pub struct TableSink {
    words: Vec<u32>,
    meta: Vec<ReadoutMeta>,
}

impl TableSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn meta(&self) -> &[ReadoutMeta] {
        &self.meta
    }
}

impl RawDataSink for TableSink {
    fn append(&mut self, chunk: &ReadoutChunk, scan_param_id: u32) {
        let index_start = self.words.len() as u64;
        self.words.extend_from_slice(&chunk.words);
        self.meta.push(ReadoutMeta {
            scan_param_id,
            index_start,
            index_stop: self.words.len() as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_sink_meta_rows() {
        let mut sink = TableSink::new();
        let chunk = ReadoutChunk {
            words: vec![1, 2, 3],
            ..Default::default()
        };
        sink.append(&chunk, 7);
        sink.append(&chunk, 8);
        assert_eq!(sink.words().len(), 6);
        assert_eq!(
            sink.meta()[1],
            ReadoutMeta {
                scan_param_id: 8,
                index_start: 3,
                index_stop: 6
            }
        );
    }
}
