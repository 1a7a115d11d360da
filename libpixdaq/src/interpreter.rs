//! Raw-word protocol decoder.
//!
//! The readout board packs three 9-bit symbols into every hit-bearing 32-bit
//! word. The symbol stream carries frames bracketed by start-of-frame and
//! end-of-frame control symbols; inside a frame, every four consecutive
//! non-control symbols form one pixel hit. Trigger words bypass the symbol
//! layer entirely and surface as pseudo-hits with the reserved trigger column.

use std::collections::VecDeque;

use super::constants::*;
use super::data::{Hit, RawWord};

/// Convert a 7-bit Gray-coded value to plain binary.
///
/// Each bit is XORed with the next-more-significant decoded bit, MSB first,
/// which is the prefix-XOR of the Gray value.
pub fn gray_to_binary(gray: u8) -> u8 {
    let mut value = gray & EDGE_MASK;
    value ^= value >> 1;
    value ^= value >> 2;
    value ^= value >> 4;
    value & EDGE_MASK
}

/// True if the word carries protocol symbols
pub fn is_hit_word(word: RawWord) -> bool {
    word & TRIGGER_WORD_FLAG == 0 && word >> 28 == HIT_WORD_TAG
}

/// True if the word is a trigger word
pub fn is_trigger_word(word: RawWord) -> bool {
    word & TRIGGER_WORD_FLAG != 0
}

/// True if the word echoes a register access
pub fn is_register_word(word: RawWord) -> bool {
    word & TRIGGER_WORD_FLAG == 0 && word >> 28 == REGISTER_WORD_TAG
}

/// Snapshot of the decoder state at a word boundary with no partial hit group
#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    in_frame: bool,
    frame_id: i64,
    error_count: u64,
    register_count: u64,
    hits_len: usize,
    words: usize,
}

/// Decoder state machine turning raw words into hit records.
///
/// The interpreter carries its frame state (`in_frame`, `frame_id`) and error
/// counter across calls, so one instance must be used for all chunks of a
/// scan. Frame desync is counted, never raised: the hardware occasionally
/// emits hit symbols slightly out of frame and aborting would lose
/// otherwise-valid data. The caller may inspect [`error_count`] after a scan
/// and decide whether to discard it.
///
/// [`error_count`]: RawDataInterpreter::error_count
#[derive(Debug, Default)]
pub struct RawDataInterpreter {
    in_frame: bool,
    frame_id: i64,
    error_count: u64,
    register_count: u64,
    words_consumed: usize,
}

impl RawDataInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a slice of raw words, appending hits to `hits`.
    ///
    /// Returns the number of hits written. A truncated hit group at the end of
    /// the slice is dropped silently; the decoder rolls back to the last word
    /// boundary with no partial group, and [`words_consumed`] reports how many
    /// leading words were decoded. Re-feeding the slice from that index
    /// continues exactly where this call left off, which is what the offline
    /// chunk splitter does with its carried offset.
    ///
    /// [`words_consumed`]: RawDataInterpreter::words_consumed
    pub fn interpret(&mut self, words: &[RawWord], hits: &mut Vec<Hit>, scan_param_id: u32) -> usize {
        let written_before = hits.len();
        // Symbols not yet assembled into a full group
        let mut pending: VecDeque<u16> = VecDeque::with_capacity(8);
        let mut checkpoint = self.checkpoint(hits.len(), 0);

        for (index, &word) in words.iter().enumerate() {
            if is_trigger_word(word) {
                let field = ((word >> 16) & 0x7FFF) as u64;
                hits.push(Hit {
                    column: TRIGGER_COLUMN,
                    row: 0,
                    leading_edge: 0,
                    trailing_edge: 0,
                    frame_id: self.frame_id,
                    noise: false,
                    timestamp: self.extend_trigger_timestamp(field),
                    trigger_number: (word & 0xFFFF) as u16,
                    scan_param_id,
                });
            } else if is_register_word(word) {
                self.register_count += 1;
            } else if is_hit_word(word) {
                for slot in (0..SYMBOLS_PER_WORD).rev() {
                    let symbol = (word >> (slot as u32 * SYMBOL_BITS)) & SYMBOL_MASK;
                    pending.push_back(symbol as u16);
                }
                self.drain_symbols(&mut pending, hits, scan_param_id);
            } else {
                // Unknown word class, counted like any other desync
                self.error_count += 1;
            }

            if pending.is_empty() {
                checkpoint = self.checkpoint(hits.len(), index + 1);
            }
        }

        if pending.is_empty() {
            self.words_consumed = words.len();
        } else {
            // Truncated final group: drop it and roll back to the last clean
            // word boundary so a re-feed never double-counts frame symbols
            self.restore(&checkpoint);
            hits.truncate(checkpoint.hits_len);
            self.words_consumed = checkpoint.words;
        }

        hits.len() - written_before
    }

    fn checkpoint(&self, hits_len: usize, words: usize) -> Checkpoint {
        Checkpoint {
            in_frame: self.in_frame,
            frame_id: self.frame_id,
            error_count: self.error_count,
            register_count: self.register_count,
            hits_len,
            words,
        }
    }

    fn restore(&mut self, checkpoint: &Checkpoint) {
        self.in_frame = checkpoint.in_frame;
        self.frame_id = checkpoint.frame_id;
        self.error_count = checkpoint.error_count;
        self.register_count = checkpoint.register_count;
    }

    /// Consume as many symbols as possible from the front of the queue
    fn drain_symbols(
        &mut self,
        pending: &mut VecDeque<u16>,
        hits: &mut Vec<Hit>,
        scan_param_id: u32,
    ) {
        while let Some(&symbol) = pending.front() {
            match symbol {
                SOF_SYMBOL => {
                    if self.in_frame {
                        // Frame start before the previous frame ended
                        self.error_count += 1;
                    }
                    self.in_frame = true;
                    pending.pop_front();
                }
                EOF_SYMBOL => {
                    if !self.in_frame {
                        self.error_count += 1;
                    }
                    self.in_frame = false;
                    self.frame_id += 1;
                    pending.pop_front();
                }
                IDLE_SYMBOL => {
                    pending.pop_front();
                }
                _ => {
                    if pending.len() < SYMBOLS_PER_HIT {
                        return;
                    }
                    if !self.in_frame {
                        // Best effort: count the desync but decode anyway
                        self.error_count += 1;
                    }
                    let mut group: u64 = 0;
                    for _ in 0..SYMBOLS_PER_HIT {
                        let sym = pending.pop_front().unwrap();
                        group = (group << SYMBOL_BITS) | sym as u64;
                    }
                    hits.push(self.decode_group(group, scan_param_id));
                }
            }
        }
    }

    /// Extend the low bits of the trigger time counter to the frame clock
    /// domain.
    ///
    /// Pixel hits are timestamped from the frame counter, which never wraps;
    /// the trigger word only carries the low 15 bits of the same counter. The
    /// full value is the candidate congruent to the field that lies closest
    /// to the current frame time, so trigger and hit timestamps stay
    /// comparable on timelines longer than one field period.
    fn extend_trigger_timestamp(&self, field: u64) -> u64 {
        let base = self.frame_id as u64 * FRAME_LENGTH_TICKS;
        let aligned = base - base % TRIGGER_TIMESTAMP_FIELD_PERIOD + field;
        let mut best = aligned;
        if let Some(lower) = aligned.checked_sub(TRIGGER_TIMESTAMP_FIELD_PERIOD) {
            if lower.abs_diff(base) < best.abs_diff(base) {
                best = lower;
            }
        }
        let upper = aligned + TRIGGER_TIMESTAMP_FIELD_PERIOD;
        if upper.abs_diff(base) < best.abs_diff(base) {
            best = upper;
        }
        best
    }

    /// Decode one 36-bit hit group into a Hit
    fn decode_group(&self, group: u64, scan_param_id: u32) -> Hit {
        let column = ((group >> 26) & 0x3FF) as u16;
        let row = ((group >> 17) & 0x1FF) as u16;
        let leading_gray = ((group >> 10) & EDGE_MASK as u64) as u8;
        let trailing_gray = ((group >> 3) & EDGE_MASK as u64) as u8;
        let noise = (group >> 2) & 1 == 1;
        Hit {
            column,
            row,
            leading_edge: gray_to_binary(leading_gray),
            trailing_edge: gray_to_binary(trailing_gray),
            frame_id: self.frame_id,
            noise,
            timestamp: self.frame_id as u64 * FRAME_LENGTH_TICKS,
            trigger_number: 0,
            scan_param_id,
        }
    }

    /// Count of frame desync conditions seen so far
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Count of register-echo words seen so far
    pub fn register_count(&self) -> u64 {
        self.register_count
    }

    /// Frame counter, incremented once per completed end-of-frame
    pub fn frame_id(&self) -> i64 {
        self.frame_id
    }

    /// Whole words decoded by the last `interpret` call
    pub fn words_consumed(&self) -> usize {
        self.words_consumed
    }

    /// Clear counters and frame state between scans
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{
        binary_to_gray, hit_group_symbols, pack_symbol_words, register_word, trigger_word,
    };

    fn framed_stream(groups: &[[u16; 4]]) -> Vec<u32> {
        let mut symbols = Vec::new();
        for group in groups {
            symbols.push(SOF_SYMBOL);
            symbols.extend_from_slice(group);
            symbols.push(EOF_SYMBOL);
        }
        pack_symbol_words(&symbols)
    }

    #[test]
    fn test_gray_round_trip() {
        for value in 0u8..=127 {
            assert_eq!(gray_to_binary(binary_to_gray(value)), value);
        }
    }

    #[test]
    fn test_frame_counting() {
        let words = framed_stream(&[
            hit_group_symbols(10, 20, 3, 9, false),
            hit_group_symbols(11, 21, 4, 10, false),
        ]);
        let mut interp = RawDataInterpreter::new();
        let mut hits = Vec::new();
        let written = interp.interpret(&words, &mut hits, 0);
        assert_eq!(written, 2);
        assert_eq!(interp.error_count(), 0);
        assert_eq!(hits[0].frame_id, 0);
        assert_eq!(hits[1].frame_id, 1);
        assert_eq!(interp.frame_id(), 2);
    }

    #[test]
    fn test_hit_fields() {
        let words = framed_stream(&[hit_group_symbols(101, 202, 17, 33, true)]);
        let mut interp = RawDataInterpreter::new();
        let mut hits = Vec::new();
        interp.interpret(&words, &mut hits, 5);
        assert_eq!(hits.len(), 1);
        let hit = hits[0];
        assert_eq!(hit.column, 101);
        assert_eq!(hit.row, 202);
        assert_eq!(hit.leading_edge, 17);
        assert_eq!(hit.trailing_edge, 33);
        assert!(hit.noise);
        assert_eq!(hit.scan_param_id, 5);
        assert_eq!(hit.charge(), 16);
    }

    #[test]
    fn test_desync_counted_once_per_group() {
        // Hit symbols with no prior start-of-frame: one error, hit still decoded
        let words = pack_symbol_words(&hit_group_symbols(1, 2, 3, 4, false));
        let mut interp = RawDataInterpreter::new();
        let mut hits = Vec::new();
        let written = interp.interpret(&words, &mut hits, 0);
        assert_eq!(written, 1);
        assert_eq!(interp.error_count(), 1);
    }

    #[test]
    fn test_frame_start_before_end() {
        let mut symbols = vec![SOF_SYMBOL, SOF_SYMBOL];
        symbols.extend_from_slice(&hit_group_symbols(1, 2, 3, 4, false));
        symbols.push(EOF_SYMBOL);
        let words = pack_symbol_words(&symbols);
        let mut interp = RawDataInterpreter::new();
        let mut hits = Vec::new();
        interp.interpret(&words, &mut hits, 0);
        assert_eq!(interp.error_count(), 1);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_end_without_start() {
        let words = pack_symbol_words(&[EOF_SYMBOL]);
        let mut interp = RawDataInterpreter::new();
        let mut hits = Vec::new();
        interp.interpret(&words, &mut hits, 0);
        assert_eq!(interp.error_count(), 1);
        assert_eq!(interp.frame_id(), 1);
    }

    #[test]
    fn test_truncated_group_dropped() {
        // Start of frame plus only two symbols of a group
        let group = hit_group_symbols(9, 9, 1, 2, false);
        let words = pack_symbol_words(&[SOF_SYMBOL, group[0], group[1]]);
        let mut interp = RawDataInterpreter::new();
        let mut hits = Vec::new();
        let written = interp.interpret(&words, &mut hits, 0);
        assert_eq!(written, 0);
        assert_eq!(interp.words_consumed(), 0);
        // The rollback leaves the frame state untouched
        assert_eq!(interp.error_count(), 0);
        assert_eq!(interp.frame_id(), 0);
    }

    #[test]
    fn test_refeed_from_consumed_offset() {
        // A full frame split mid-group across two interpret calls
        let mut symbols = vec![SOF_SYMBOL];
        symbols.extend_from_slice(&hit_group_symbols(3, 4, 5, 6, false));
        symbols.push(EOF_SYMBOL);
        let words = pack_symbol_words(&symbols);
        assert_eq!(words.len(), 2);

        let mut interp = RawDataInterpreter::new();
        let mut hits = Vec::new();
        let written = interp.interpret(&words[..1], &mut hits, 0);
        assert_eq!(written, 0);
        let consumed = interp.words_consumed();
        interp.interpret(&words[consumed..], &mut hits, 0);
        assert_eq!(hits.len(), 1);
        assert_eq!(interp.frame_id(), 1);
        assert_eq!(interp.error_count(), 0);
    }

    #[test]
    fn test_trigger_word_pseudo_hit() {
        let words = vec![trigger_word(1234, 42)];
        let mut interp = RawDataInterpreter::new();
        let mut hits = Vec::new();
        interp.interpret(&words, &mut hits, 0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].column, TRIGGER_COLUMN);
        assert_eq!(hits[0].timestamp, 1234);
        assert_eq!(hits[0].trigger_number, 42);
    }

    #[test]
    fn test_trigger_timestamp_extended_to_frame_clock() {
        // 200 empty frames put the frame clock at 38400 ticks, past one
        // period of the 15-bit trigger timestamp field
        let mut symbols = Vec::new();
        for _ in 0..200 {
            symbols.push(SOF_SYMBOL);
            symbols.push(EOF_SYMBOL);
        }
        let mut words = pack_symbol_words(&symbols);
        // Counter value 38250 truncated to its low 15 bits on the wire
        words.push(trigger_word((38250 % 0x8000) as u32, 7));
        let mut interp = RawDataInterpreter::new();
        let mut hits = Vec::new();
        interp.interpret(&words, &mut hits, 0);
        assert_eq!(interp.frame_id(), 200);
        assert_eq!(hits[0].timestamp, 38250);
    }

    #[test]
    fn test_register_words_counted_not_decoded() {
        let mut symbols = vec![SOF_SYMBOL];
        symbols.extend_from_slice(&hit_group_symbols(1, 2, 3, 4, false));
        symbols.push(EOF_SYMBOL);
        let mut words = pack_symbol_words(&symbols);
        // One echo in the middle of the frame, one after it
        words.insert(1, register_word(0xABCD));
        words.push(register_word(0x1234));
        let mut interp = RawDataInterpreter::new();
        let mut hits = Vec::new();
        interp.interpret(&words, &mut hits, 0);
        assert_eq!(interp.register_count(), 2);
        assert_eq!(hits.len(), 1);
        assert_eq!(interp.error_count(), 0);
        assert_eq!(interp.frame_id(), 1);
        assert_eq!(interp.words_consumed(), words.len());
    }

    #[test]
    fn test_idle_symbols_skipped() {
        let mut symbols = vec![SOF_SYMBOL, IDLE_SYMBOL];
        symbols.extend_from_slice(&hit_group_symbols(1, 1, 0, 1, false));
        symbols.extend_from_slice(&[IDLE_SYMBOL, EOF_SYMBOL]);
        let words = pack_symbol_words(&symbols);
        let mut interp = RawDataInterpreter::new();
        let mut hits = Vec::new();
        interp.interpret(&words, &mut hits, 0);
        assert_eq!(hits.len(), 1);
        assert_eq!(interp.error_count(), 0);
    }
}
