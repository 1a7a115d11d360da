//! Pixel mask planes and the incremental register-update algorithm.
//!
//! Three named planes cover the matrix: `enable` and `injection` are on/off
//! masks, `tdac` holds the per-pixel threshold trim. Each plane keeps a
//! snapshot of the contents last applied to the chip; updating compares
//! against the snapshot and writes only the register targets that actually
//! changed, which keeps the per-step hardware traffic of a shifted mask scan
//! small.

use fxhash::FxHashSet;
use ndarray::Array2;

use super::constants::{
    COLUMN_GROUP_SIZE, COMMAND_FLUSH_BYTES, INJECTION_GROUP_SIZE, N_COLUMNS, N_ROWS,
};
use super::hardware::CommandSink;

/// The named mask planes of the pixel matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneKind {
    Enable,
    Injection,
    Tdac,
}

impl PlaneKind {
    pub const ALL: [PlaneKind; 3] = [PlaneKind::Enable, PlaneKind::Injection, PlaneKind::Tdac];

    fn index(self) -> usize {
        match self {
            PlaneKind::Enable => 0,
            PlaneKind::Injection => 1,
            PlaneKind::Tdac => 2,
        }
    }

    /// Register-write opcode of the plane's command encoding
    fn opcode(self) -> u8 {
        match self {
            PlaneKind::Enable => 0x21,
            PlaneKind::Injection => 0x22,
            PlaneKind::Tdac => 0x23,
        }
    }
}

/// One 512x512 grid of mask cells plus its last-applied snapshot
#[derive(Debug, Clone)]
pub struct MaskPlane {
    kind: PlaneKind,
    cells: Array2<u8>,
    previous: Array2<u8>,
    default_value: u8,
}

impl MaskPlane {
    fn new(kind: PlaneKind, default_value: u8) -> Self {
        Self {
            kind,
            cells: Array2::from_elem((N_COLUMNS, N_ROWS), default_value),
            previous: Array2::from_elem((N_COLUMNS, N_ROWS), default_value),
            default_value,
        }
    }

    pub fn kind(&self) -> PlaneKind {
        self.kind
    }

    pub fn default_value(&self) -> u8 {
        self.default_value
    }

    pub fn get(&self, column: usize, row: usize) -> u8 {
        assert!(
            column < N_COLUMNS && row < N_ROWS,
            "pixel index ({column}, {row}) out of range"
        );
        self.cells[[column, row]]
    }

    pub fn set(&mut self, column: usize, row: usize, value: u8) {
        assert!(
            column < N_COLUMNS && row < N_ROWS,
            "pixel index ({column}, {row}) out of range"
        );
        self.cells[[column, row]] = value;
    }

    pub fn fill(&mut self, value: u8) {
        self.cells.fill(value);
    }

    pub fn cells(&self) -> &Array2<u8> {
        &self.cells
    }

    /// Overwrite the whole plane contents
    pub fn assign(&mut self, cells: &Array2<u8>) {
        assert_eq!(
            cells.dim(),
            (N_COLUMNS, N_ROWS),
            "mask plane has wrong shape"
        );
        self.cells.assign(cells);
    }

    /// True if no cell in the column range is set
    pub fn is_empty_in(&self, columns: std::ops::Range<usize>) -> bool {
        (columns.start..columns.end).all(|c| (0..N_ROWS).all(|r| self.cells[[c, r]] == 0))
    }
}

/// Counts of register writes produced by one update pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub enable_writes: usize,
    pub injection_writes: usize,
    pub tdac_writes: usize,
    pub cells_changed: usize,
}

impl UpdateStats {
    pub fn total_writes(&self) -> usize {
        self.enable_writes + self.injection_writes + self.tdac_writes
    }
}

/// The typed table of all mask planes.
///
/// `previous` snapshots are mutated only here; callers change cell contents
/// through the plane accessors and then call [`update`] to push the
/// difference to the chip.
///
/// [`update`]: MaskSet::update
#[derive(Debug, Clone)]
pub struct MaskSet {
    planes: [MaskPlane; 3],
}

impl Default for MaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MaskSet {
    /// Fresh mask set: everything enabled, no injection, mid-range trim
    pub fn new() -> Self {
        Self {
            planes: [
                MaskPlane::new(PlaneKind::Enable, 1),
                MaskPlane::new(PlaneKind::Injection, 0),
                MaskPlane::new(PlaneKind::Tdac, 7),
            ],
        }
    }

    pub fn plane(&self, kind: PlaneKind) -> &MaskPlane {
        &self.planes[kind.index()]
    }

    pub fn plane_mut(&mut self, kind: PlaneKind) -> &mut MaskPlane {
        &mut self.planes[kind.index()]
    }

    /// Push the difference against the last-applied state to the chip.
    ///
    /// Enable and TDAC cells are written per distinct (double column, row)
    /// register target actually in the changed set; injection cells per 16x16
    /// group with OR-reduced membership bit-fields. Repeated targets are
    /// deduplicated. Encoded commands are batched and flushed whenever the
    /// pending buffer exceeds the fixed threshold. `force` treats every cell
    /// as changed, which is used once at the start of a scan.
    pub fn update<S: CommandSink + ?Sized>(&mut self, sink: &mut S, force: bool) -> UpdateStats {
        let mut stats = UpdateStats::default();
        let mut batch: Vec<u8> = Vec::with_capacity(COMMAND_FLUSH_BYTES);

        for plane in &mut self.planes {
            let changed = changed_cells(plane, force);
            stats.cells_changed += changed.len();
            if changed.is_empty() {
                continue;
            }
            match plane.kind {
                PlaneKind::Enable | PlaneKind::Tdac => {
                    let mut targets: Vec<(usize, usize)> = changed
                        .iter()
                        .map(|&(c, r)| (c / COLUMN_GROUP_SIZE, r))
                        .collect::<FxHashSet<_>>()
                        .into_iter()
                        .collect();
                    targets.sort_unstable();
                    for (group, row) in targets {
                        encode_column_group_write(&mut batch, plane, group, row);
                        match plane.kind {
                            PlaneKind::Enable => stats.enable_writes += 1,
                            _ => stats.tdac_writes += 1,
                        }
                        flush_if_full(&mut batch, sink);
                    }
                }
                PlaneKind::Injection => {
                    let mut groups: Vec<(usize, usize)> = changed
                        .iter()
                        .map(|&(c, r)| (c / INJECTION_GROUP_SIZE, r / INJECTION_GROUP_SIZE))
                        .collect::<FxHashSet<_>>()
                        .into_iter()
                        .collect();
                    groups.sort_unstable();
                    for (col_group, row_group) in groups {
                        encode_injection_group_write(&mut batch, plane, col_group, row_group);
                        stats.injection_writes += 1;
                        flush_if_full(&mut batch, sink);
                    }
                }
            }
            plane.previous.assign(&plane.cells);
        }

        if !batch.is_empty() {
            sink.send(&batch);
        }
        stats
    }
}

fn changed_cells(plane: &MaskPlane, force: bool) -> Vec<(usize, usize)> {
    let mut changed = Vec::new();
    for column in 0..N_COLUMNS {
        for row in 0..N_ROWS {
            if force || plane.cells[[column, row]] != plane.previous[[column, row]] {
                changed.push((column, row));
            }
        }
    }
    changed
}

/// Encode one (double column, row) register write: opcode, group, row, then
/// the cell values of the group's columns at that row
fn encode_column_group_write(batch: &mut Vec<u8>, plane: &MaskPlane, group: usize, row: usize) {
    batch.push(plane.kind.opcode());
    batch.extend_from_slice(&(group as u16).to_be_bytes());
    batch.extend_from_slice(&(row as u16).to_be_bytes());
    for column in group * COLUMN_GROUP_SIZE..(group + 1) * COLUMN_GROUP_SIZE {
        batch.push(plane.cells[[column, row]]);
    }
}

/// Encode one 16x16 injection group write with OR-reduced membership fields:
/// bit i of the column field is set when any cell of member column i is set,
/// likewise for the row field
fn encode_injection_group_write(
    batch: &mut Vec<u8>,
    plane: &MaskPlane,
    col_group: usize,
    row_group: usize,
) {
    let col_base = col_group * INJECTION_GROUP_SIZE;
    let row_base = row_group * INJECTION_GROUP_SIZE;
    let mut col_bits: u16 = 0;
    let mut row_bits: u16 = 0;
    for i in 0..INJECTION_GROUP_SIZE {
        for j in 0..INJECTION_GROUP_SIZE {
            if plane.cells[[col_base + i, row_base + j]] != 0 {
                col_bits |= 1 << i;
                row_bits |= 1 << j;
            }
        }
    }
    batch.push(plane.kind.opcode());
    batch.push(col_group as u8);
    batch.push(row_group as u8);
    batch.extend_from_slice(&col_bits.to_be_bytes());
    batch.extend_from_slice(&row_bits.to_be_bytes());
}

fn flush_if_full<S: CommandSink + ?Sized>(batch: &mut Vec<u8>, sink: &mut S) {
    if batch.len() >= COMMAND_FLUSH_BYTES {
        sink.send(batch);
        batch.clear();
    }
}
