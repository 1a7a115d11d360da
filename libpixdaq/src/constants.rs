//! Constants describing the readout protocol and the pixel matrix geometry.

/// Number of columns in the pixel matrix
pub const N_COLUMNS: usize = 512;
/// Number of rows in the pixel matrix
pub const N_ROWS: usize = 512;

/// Number of analog front-end segments on the chip
pub const N_FRONT_ENDS: usize = 4;
/// Number of columns belonging to one front-end segment
pub const FRONT_END_COLUMNS: usize = N_COLUMNS / N_FRONT_ENDS;

/// Width of one protocol symbol in bits
pub const SYMBOL_BITS: u32 = 9;
/// Mask selecting one protocol symbol
pub const SYMBOL_MASK: u32 = 0x1FF;
/// Number of symbols packed into one 32-bit raw word
pub const SYMBOLS_PER_WORD: usize = 3;
/// Number of consecutive symbols making up one hit record
pub const SYMBOLS_PER_HIT: usize = 4;

/// Start-of-frame control symbol
pub const SOF_SYMBOL: u16 = 0x1bc;
/// End-of-frame control symbol
pub const EOF_SYMBOL: u16 = 0x17c;
/// Idle filler symbol, skipped during decoding
pub const IDLE_SYMBOL: u16 = 0x13c;

/// Class tag (top nibble) of a hit-bearing raw word
pub const HIT_WORD_TAG: u32 = 0x1;
/// Class tag (top nibble) of a register-echo raw word
pub const REGISTER_WORD_TAG: u32 = 0x4;
/// A raw word with this bit set is a trigger word
pub const TRIGGER_WORD_FLAG: u32 = 0x8000_0000;

/// Reserved column value marking a trigger record in the hit stream
pub const TRIGGER_COLUMN: u16 = 1023;
/// Trigger timestamps wrap at this value (31-bit hardware counter)
pub const TRIGGER_TIMESTAMP_WRAP: u64 = 0x7FFF_FFFF;
/// Period of the 15-bit timestamp field inside a trigger word. The word only
/// carries the low bits of the hardware time counter; the decoder extends
/// them back to the full counter domain.
pub const TRIGGER_TIMESTAMP_FIELD_PERIOD: u64 = 0x8000;
/// Trigger numbers are a 16-bit hardware counter
pub const TRIGGER_NUMBER_MASK: u64 = 0xFFFF;

/// Mask for the 7-bit Gray-coded edge timing fields
pub const EDGE_MASK: u8 = 0x7F;
/// Length of one readout frame in hardware clock ticks
pub const FRAME_LENGTH_TICKS: u64 = 192;

/// Enable and TDAC registers are written per group of two columns (double column)
pub const COLUMN_GROUP_SIZE: usize = 2;
/// Injection registers are written per 16x16 pixel group
pub const INJECTION_GROUP_SIZE: usize = 16;
/// Pending register-write commands are flushed past this size
pub const COMMAND_FLUSH_BYTES: usize = 4096;

/// Bytes per raw word, for data volume reporting
pub const WORD_SIZE_BYTES: u64 = 4;
