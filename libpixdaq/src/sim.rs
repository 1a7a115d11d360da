//! Simulated readout hardware.
//!
//! Encodes pixel hits into the same raw-word protocol the decoder consumes
//! and exposes a [`HardwareFifo`] that synthesizes a steady stream of framed
//! data. Used by the dry-run mode of the CLI and throughout the test suite;
//! nothing here talks to real hardware.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use super::constants::*;
use super::data::RawWord;
use super::hardware::{HardwareFifo, RxCounters};

/// Convert a 7-bit binary value to its Gray code, the inverse of the
/// decoder's prefix-XOR
pub fn binary_to_gray(value: u8) -> u8 {
    let value = value & EDGE_MASK;
    (value ^ (value >> 1)) & EDGE_MASK
}

/// Encode one pixel hit as its four 9-bit protocol symbols, MSB first
pub fn hit_group_symbols(column: u16, row: u16, le: u8, te: u8, noise: bool) -> [u16; 4] {
    let group: u64 = ((column as u64 & 0x3FF) << 26)
        | ((row as u64 & 0x1FF) << 17)
        | ((binary_to_gray(le) as u64) << 10)
        | ((binary_to_gray(te) as u64) << 3)
        | ((noise as u64) << 2);
    let mut symbols = [0u16; SYMBOLS_PER_HIT];
    for (index, symbol) in symbols.iter_mut().enumerate() {
        let shift = SYMBOL_BITS * (SYMBOLS_PER_HIT - 1 - index) as u32;
        *symbol = ((group >> shift) & SYMBOL_MASK as u64) as u16;
    }
    symbols
}

/// Pack a symbol sequence into hit-bearing raw words, three symbols per word,
/// padding the tail with idle symbols
pub fn pack_symbol_words(symbols: &[u16]) -> Vec<RawWord> {
    let mut words = Vec::with_capacity(symbols.len().div_ceil(SYMBOLS_PER_WORD));
    for chunk in symbols.chunks(SYMBOLS_PER_WORD) {
        let mut word = HIT_WORD_TAG << (SYMBOLS_PER_WORD as u32 * SYMBOL_BITS + 1);
        for slot in 0..SYMBOLS_PER_WORD {
            let symbol = chunk.get(slot).copied().unwrap_or(IDLE_SYMBOL);
            let shift = SYMBOL_BITS * (SYMBOLS_PER_WORD - 1 - slot) as u32;
            word |= (symbol as u32 & SYMBOL_MASK) << shift;
        }
        words.push(word);
    }
    words
}

/// Encode a trigger word from a 15-bit timestamp and a trigger number
pub fn trigger_word(timestamp: u32, trigger_number: u16) -> RawWord {
    TRIGGER_WORD_FLAG | ((timestamp & 0x7FFF) << 16) | trigger_number as u32
}

/// Encode a register-echo word with an arbitrary payload
pub fn register_word(payload: u32) -> RawWord {
    (REGISTER_WORD_TAG << 28) | (payload & 0x0FFF_FFFF)
}

/// Lag of the synthetic trigger behind its frame, in clock ticks.
/// Sits inside the default acceptance window.
const TRIGGER_LAG_TICKS: u64 = 150;

/// A [`HardwareFifo`] that generates framed hit data at a configurable rate.
///
/// Frames accumulate with wall-clock time between reads, so a polling loop
/// sees a steady stream while back-to-back reads drain to empty. Each frame
/// is preceded by one trigger word timed to land the frame's hits inside the
/// default acceptance window; pixel positions cycle deterministically over
/// the matrix.
#[derive(Debug)]
pub struct SimulatedFifo {
    frames_per_ms: u64,
    hits_per_frame: usize,
    frame_count: u64,
    trigger_number: u16,
    last_read: Option<Instant>,
}

impl SimulatedFifo {
    pub fn new(frames_per_ms: u64, hits_per_frame: usize) -> Self {
        Self {
            frames_per_ms,
            hits_per_frame,
            frame_count: 0,
            trigger_number: 0,
            last_read: None,
        }
    }

    /// A FIFO that never produces data, for timeout tests
    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    /// Frames emitted since construction or the last reset
    pub fn frames_emitted(&self) -> u64 {
        self.frame_count
    }

    /// Append one trigger word plus one complete frame.
    /// Public so tests and dry runs can build deterministic streams.
    pub fn emit_frame(&mut self, words: &mut Vec<RawWord>) {
        let frame_start = self.frame_count * FRAME_LENGTH_TICKS;
        let trigger_time = frame_start.saturating_sub(TRIGGER_LAG_TICKS) & 0x7FFF;
        self.trigger_number = self.trigger_number.wrapping_add(1);
        words.push(trigger_word(trigger_time as u32, self.trigger_number));

        let mut symbols = Vec::with_capacity(2 + self.hits_per_frame * SYMBOLS_PER_HIT);
        symbols.push(SOF_SYMBOL);
        for hit in 0..self.hits_per_frame {
            let column = ((self.frame_count as usize * 7 + hit * 13) % N_COLUMNS) as u16;
            let row = ((self.frame_count as usize * 3 + hit * 29) % N_ROWS) as u16;
            let le = (hit % 32) as u8;
            let te = le.wrapping_add(25) & EDGE_MASK;
            symbols.extend_from_slice(&hit_group_symbols(column, row, le, te, false));
        }
        symbols.push(EOF_SYMBOL);
        words.extend_from_slice(&pack_symbol_words(&symbols));
        self.frame_count += 1;
    }
}

impl HardwareFifo for SimulatedFifo {
    fn read_data(&mut self) -> Vec<u32> {
        let now = Instant::now();
        let last = self.last_read.replace(now).unwrap_or(now);
        let elapsed_ms = now.duration_since(last).as_millis() as u64;
        // Bounded so a long pause cannot produce a giant chunk
        let frames = (elapsed_ms * self.frames_per_ms).min(1000);
        let mut words = Vec::new();
        for _ in 0..frames {
            self.emit_frame(&mut words);
        }
        words
    }

    fn fifo_size(&self) -> usize {
        0
    }

    fn reset(&mut self) {
        self.frame_count = 0;
        self.trigger_number = 0;
        self.last_read = None;
    }
}

/// Shared error counters with test-controlled injection
#[derive(Debug)]
pub struct SimulatedCounters {
    discards: Vec<AtomicU32>,
    soft_errors: Vec<AtomicU32>,
}

impl SimulatedCounters {
    pub fn new(channels: usize) -> Self {
        Self {
            discards: (0..channels).map(|_| AtomicU32::new(0)).collect(),
            soft_errors: (0..channels).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn inject_discard(&self, channel: usize, count: u32) {
        self.discards[channel].fetch_add(count, Ordering::Relaxed);
    }

    pub fn inject_soft_error(&self, channel: usize, count: u32) {
        self.soft_errors[channel].fetch_add(count, Ordering::Relaxed);
    }
}

impl RxCounters for SimulatedCounters {
    fn discard_counts(&self) -> Vec<u32> {
        self.discards.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    fn soft_error_counts(&self) -> Vec<u32> {
        self.soft_errors.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }
}
