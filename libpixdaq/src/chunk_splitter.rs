//! Splitting a stored raw-word timeline into per-scan-parameter chunks.
//!
//! Offline analysis replays the words written by the raw-data sink. The
//! metadata rows recorded with every append tell which scan parameter a span
//! of words belongs to; the splitter merges contiguous runs of the same
//! parameter and cuts them into bounded chunks for the interpreter, taking
//! care never to cut through a protocol frame.

use std::collections::VecDeque;

use fxhash::FxHashSet;

use super::data::{ReadoutMeta, ScanParameterChunk};

/// One merged run of equal scan parameter over the word timeline
#[derive(Debug, Clone, Copy)]
struct Run {
    scan_param_id: u32,
    start: u64,
    stop: u64,
}

/// Iterator over bounded sub-ranges of the stored timeline.
///
/// After consuming each chunk the caller reports how many words the decoder
/// actually used via [`report_consumed`]; the next chunk then starts at the
/// unconsumed remainder, so a hit group or frame straddling the cut is
/// re-presented whole. The carried offset is bounded to one chunk size.
///
/// [`report_consumed`]: ChunkSplitter::report_consumed
#[derive(Debug)]
pub struct ChunkSplitter {
    runs: VecDeque<Run>,
    current: Option<Run>,
    cursor: u64,
    chunk_size: u64,
    last_chunk: Option<(u64, u64)>,
}

impl ChunkSplitter {
    /// Build the splitter from the sink's metadata rows, sorted by occurrence.
    ///
    /// Contiguous rows with the same `scan_param_id` are merged. Scan
    /// parameters missing from the table (zero words recorded) are reported
    /// as a warning, not an error.
    pub fn new(meta: &[ReadoutMeta], chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        let mut runs: VecDeque<Run> = VecDeque::new();
        for row in meta {
            if row.index_stop <= row.index_start {
                continue;
            }
            match runs.back_mut() {
                Some(run)
                    if run.scan_param_id == row.scan_param_id && run.stop == row.index_start =>
                {
                    run.stop = row.index_stop;
                }
                _ => runs.push_back(Run {
                    scan_param_id: row.scan_param_id,
                    start: row.index_start,
                    stop: row.index_stop,
                }),
            }
        }

        Self::warn_missing_params(&runs);

        Self {
            runs,
            current: None,
            cursor: 0,
            chunk_size,
            last_chunk: None,
        }
    }

    fn warn_missing_params(runs: &VecDeque<Run>) {
        let ids: FxHashSet<u32> = runs.iter().map(|r| r.scan_param_id).collect();
        let (Some(&min), Some(&max)) = (ids.iter().min(), ids.iter().max()) else {
            return;
        };
        for id in min..=max {
            if !ids.contains(&id) {
                spdlog::warn!("No data recorded for scan parameter {}", id);
            }
        }
    }

    /// Yield the next sub-range, or None when the timeline is exhausted.
    ///
    /// If the previous chunk was not fully consumed and the caller reported
    /// it, this chunk starts at the unconsumed tail; the final partial tail of
    /// a run is yielded exactly once.
    pub fn next_chunk(&mut self) -> Option<ScanParameterChunk> {
        // An unreported chunk counts as fully consumed
        self.last_chunk = None;
        loop {
            match self.current {
                Some(run) if self.cursor < run.stop => {
                    let start = self.cursor;
                    let stop = run.stop.min(start + self.chunk_size);
                    self.cursor = stop;
                    self.last_chunk = Some((start, stop));
                    return Some(ScanParameterChunk {
                        scan_param_id: run.scan_param_id,
                        word_range: start..stop,
                    });
                }
                _ => {
                    let run = self.runs.pop_front()?;
                    self.cursor = run.start;
                    self.current = Some(run);
                }
            }
        }
    }

    /// Report how many words of the last yielded chunk were actually decoded.
    ///
    /// The unconsumed tail is re-yielded at the front of the next chunk. A
    /// report of zero would make no forward progress and is treated as full
    /// consumption with a warning.
    pub fn report_consumed(&mut self, words: u64) {
        let Some((start, stop)) = self.last_chunk.take() else {
            return;
        };
        let length = stop - start;
        if words >= length {
            return;
        }
        if words == 0 {
            spdlog::warn!(
                "Decoder consumed no words of a {} word chunk; skipping it",
                length
            );
            return;
        }
        // Bounded carried offset: never step back more than one chunk
        let consumed = words.max(length.saturating_sub(self.chunk_size));
        self.cursor = start + consumed;
    }
}
