use std::fmt;

/// Slots per scope. Slots `0..8` are the shared global scope, `8..16` the
/// per-session local scope.
pub const SCOPE_SLOTS: usize = 8;
pub const SLOT_COUNT: usize = 2 * SCOPE_SLOTS;
/// Widest value a variable cell can hold.
pub const CELL_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarError {
    Width(u32),
    CellOverflow(u32),
}

impl fmt::Display for VarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Width(size) => write!(f, "unsupported integer width: {size}"),
            Self::CellOverflow(size) => {
                write!(f, "variable size {size} exceeds the {CELL_LEN} byte cell")
            }
        }
    }
}

impl std::error::Error for VarError {}

/// Reference to one slot of the variable declaration table.
///
/// The scope split lives here and nowhere else: any question of the form
/// "is this a global?" goes through [`SlotRef::is_global`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef(u8);

impl SlotRef {
    pub const fn new(index: usize) -> Option<Self> {
        if index < SLOT_COUNT {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_global(self) -> bool {
        (self.0 as usize) < SCOPE_SLOTS
    }

    /// Cell index within the slot's scope.
    pub const fn cell(self) -> usize {
        self.0 as usize % SCOPE_SLOTS
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            write!(f, "global slot {}", self.cell())
        } else {
            write!(f, "local slot {}", self.cell())
        }
    }
}

/// Where, and how wide, each declared variable is inside any packet that
/// references it. Built once at configuration time, immutable afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarDecls {
    sizes: [u32; SLOT_COUNT],
    offs: [u32; SLOT_COUNT],
}

impl VarDecls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, slot: SlotRef, size: u32, off: u32) -> Result<(), VarError> {
        if size as usize > CELL_LEN {
            return Err(VarError::CellOverflow(size));
        }
        self.sizes[slot.index()] = size;
        self.offs[slot.index()] = off;
        Ok(())
    }

    pub fn size(&self, slot: SlotRef) -> usize {
        self.sizes[slot.index()] as usize
    }

    pub fn off(&self, slot: SlotRef) -> usize {
        self.offs[slot.index()] as usize
    }
}

/// Fixed-size value store for one scope: 8 cells of up to 32 bytes.
///
/// The global instance is written during configuration and read-only from
/// then on; each session owns a local instance that packet actions mutate.
#[derive(Debug, Clone, Copy)]
pub struct VarStore {
    cells: [[u8; CELL_LEN]; SCOPE_SLOTS],
}

impl Default for VarStore {
    fn default() -> Self {
        Self {
            cells: [[0; CELL_LEN]; SCOPE_SLOTS],
        }
    }
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cell(&self, index: usize) -> &[u8; CELL_LEN] {
        &self.cells[index]
    }

    /// Stores `value` little-endian in the first `size` bytes of a cell.
    pub fn set_uint(&mut self, index: usize, size: u32, value: u64) -> Result<(), VarError> {
        let cell = &mut self.cells[index];
        match size {
            1 => cell[0] = value as u8,
            2 => cell[..2].copy_from_slice(&(value as u16).to_le_bytes()),
            4 => cell[..4].copy_from_slice(&(value as u32).to_le_bytes()),
            8 => cell[..8].copy_from_slice(&value.to_le_bytes()),
            _ => return Err(VarError::Width(size)),
        }
        Ok(())
    }

    /// Stores raw bytes, truncated to the declared size. Shorter values keep
    /// the cell's zero padding.
    pub fn set_bytes(&mut self, index: usize, size: u32, bytes: &[u8]) -> Result<(), VarError> {
        let size = size as usize;
        if size > CELL_LEN {
            return Err(VarError::CellOverflow(size as u32));
        }
        let n = bytes.len().min(size);
        self.cells[index][..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    /// Wrapping little-endian `+1` over the first `size` bytes of a cell.
    /// No byte outside the declared width changes.
    pub fn increment(&mut self, index: usize, size: usize) -> Result<(), VarError> {
        let cell = &mut self.cells[index];
        match size {
            1 => cell[0] = cell[0].wrapping_add(1),
            2 => {
                let v = u16::from_le_bytes(cell[..2].try_into().unwrap()).wrapping_add(1);
                cell[..2].copy_from_slice(&v.to_le_bytes());
            }
            4 => {
                let v = u32::from_le_bytes(cell[..4].try_into().unwrap()).wrapping_add(1);
                cell[..4].copy_from_slice(&v.to_le_bytes());
            }
            8 => {
                let v = u64::from_le_bytes(cell[..8].try_into().unwrap()).wrapping_add(1);
                cell[..8].copy_from_slice(&v.to_le_bytes());
            }
            _ => return Err(VarError::Width(size as u32)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_scope_split() {
        let g = SlotRef::new(3).unwrap();
        assert!(g.is_global());
        assert_eq!(g.cell(), 3);

        let l = SlotRef::new(11).unwrap();
        assert!(!l.is_global());
        assert_eq!(l.cell(), 3);

        assert!(SlotRef::new(16).is_none());
    }

    #[test]
    fn set_uint_is_little_endian() {
        let mut store = VarStore::new();
        store.set_uint(0, 4, 0x0403_0201).unwrap();
        assert_eq!(&store.cell(0)[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&store.cell(0)[4..], &[0u8; CELL_LEN - 4]);
    }

    #[test]
    fn set_bytes_truncates_to_declared_size() {
        let mut store = VarStore::new();
        store.set_bytes(2, 4, b"ABCDEFGH").unwrap();
        assert_eq!(&store.cell(2)[..5], b"ABCD\0");

        // shorter strings keep the zero padding
        store.set_bytes(3, 4, b"xy").unwrap();
        assert_eq!(&store.cell(3)[..4], b"xy\0\0");
    }

    #[test]
    fn increment_touches_only_declared_bytes() {
        let mut store = VarStore::new();
        store.set_bytes(1, 8, &[0xff, 0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x99]).unwrap();

        store.increment(1, 2).unwrap();
        assert_eq!(&store.cell(1)[..8], &[0x00, 0x01, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x99]);
    }

    #[test]
    fn increment_wraps_at_every_width() {
        for (size, max) in [(1usize, 0xffu64), (2, 0xffff), (4, 0xffff_ffff), (8, u64::MAX)] {
            let mut store = VarStore::new();
            store.set_uint(0, size as u32, max).unwrap();
            store.increment(0, size).unwrap();
            assert_eq!(&store.cell(0)[..size], &vec![0u8; size][..], "width {size}");
        }
    }

    #[test]
    fn increment_rejects_odd_widths() {
        let mut store = VarStore::new();
        assert_eq!(store.increment(0, 3), Err(VarError::Width(3)));
    }
}
