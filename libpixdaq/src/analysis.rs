//! Offline replay of stored raw data.
//!
//! Walks the raw-word timeline recorded by the data sink chunk by chunk,
//! feeding decoder and event builder exactly as the online path would, and
//! tallies per-scan-parameter statistics. Decoder and builder state is
//! carried across chunk boundaries; a hit group cut by a chunk boundary is
//! re-presented whole through the splitter's consumption feedback.

use fxhash::FxHashMap;
use human_bytes::human_bytes;

use super::chunk_splitter::ChunkSplitter;
use super::config::Config;
use super::constants::{TRIGGER_COLUMN, WORD_SIZE_BYTES};
use super::data::{Event, Hit, RawWord, ReadoutMeta};
use super::event_builder::EventBuilder;
use super::interpreter::RawDataInterpreter;

/// Tallies for one scan parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterSummary {
    pub scan_param_id: u32,
    pub words: u64,
    pub triggers: u64,
    pub pixel_hits: u64,
    pub events: u64,
}

/// Result of one offline pass over a stored timeline
#[derive(Debug, Default)]
pub struct AnalysisReport {
    /// Per-parameter tallies, ordered by scan parameter
    pub parameters: Vec<ParameterSummary>,
    pub decode_errors: u64,
    pub trigger_gaps: u64,
    pub events: Vec<Event>,
}

impl AnalysisReport {
    pub fn total_words(&self) -> u64 {
        self.parameters.iter().map(|p| p.words).sum()
    }

    /// Write the report to the log, one line per scan parameter
    pub fn log(&self) {
        for summary in &self.parameters {
            spdlog::info!(
                "Scan parameter {}: {} triggers, {} hits, {} events",
                summary.scan_param_id,
                summary.triggers,
                summary.pixel_hits,
                summary.events
            );
        }
        spdlog::info!(
            "Processed {} words ({}), {} decode errors, {} trigger gaps",
            self.total_words(),
            human_bytes((self.total_words() * WORD_SIZE_BYTES) as f64),
            self.decode_errors,
            self.trigger_gaps
        );
    }
}

/// Replay a stored timeline and build its events.
///
/// `words` and `meta` are the parallel tables written by the raw-data sink;
/// `config` supplies the chunk size and the acceptance window.
pub fn analyze(words: &[RawWord], meta: &[ReadoutMeta], config: &Config) -> AnalysisReport {
    let mut splitter = ChunkSplitter::new(meta, config.chunk_size);
    let mut interpreter = RawDataInterpreter::new();
    let mut builder = EventBuilder::new(config.event_window);
    let mut tallies: FxHashMap<u32, ParameterSummary> = FxHashMap::default();
    let mut events = Vec::new();
    let mut hits: Vec<Hit> = Vec::new();

    while let Some(chunk) = splitter.next_chunk() {
        let range = chunk.word_range.start as usize..chunk.word_range.end as usize;
        hits.clear();
        interpreter.interpret(&words[range], &mut hits, chunk.scan_param_id);
        splitter.report_consumed(interpreter.words_consumed() as u64);

        let written = builder.build_events(&hits, &mut events);
        let triggers = hits.iter().filter(|h| h.column == TRIGGER_COLUMN).count();
        let summary = tallies.entry(chunk.scan_param_id).or_insert(ParameterSummary {
            scan_param_id: chunk.scan_param_id,
            ..Default::default()
        });
        summary.words += interpreter.words_consumed() as u64;
        summary.triggers += triggers as u64;
        summary.pixel_hits += (hits.len() - triggers) as u64;
        summary.events += written as u64;
    }

    let mut parameters: Vec<ParameterSummary> = tallies.into_values().collect();
    parameters.sort_by_key(|summary| summary.scan_param_id);

    AnalysisReport {
        parameters,
        decode_errors: interpreter.error_count(),
        trigger_gaps: builder.gap_count(),
        events,
    }
}
