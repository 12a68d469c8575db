use std::sync::atomic::Ordering;

use crate::core::types::{DocIndex, Rank, RowIndex};
use crate::index::term_table::TermTable;
use crate::memory::block_pool::SliceBuffer;

/// Bit operations over one rank's row table embedded in a slice
/// buffer. The descriptor knows where its region starts and its
/// dimensions; every slice of a shard shares one descriptor instance.
///
/// Columns are addressed in the rank-0 column space: at rank r one
/// stored bit covers 2^r consecutive rank-0 columns, so the column is
/// shifted right by r before locating the stored bit. Bits are packed
/// little-endian into 64-bit words.
///
/// Bit mutation goes through atomic or/and: ingestion threads own
/// disjoint columns but share words, and `set_bit`/`clear_bit` publish
/// with release ordering so a reader that observes a column's cleared
/// soft-deleted bit also observes every posting bit written before it.
#[derive(Debug, Clone)]
pub struct RowTableDescriptor {
    capacity: DocIndex,
    row_count: RowIndex,
    rank: Rank,
    buffer_offset: usize,
    bytes_per_row: usize,
}

impl RowTableDescriptor {
    pub fn new(capacity: DocIndex, row_count: RowIndex, rank: Rank, buffer_offset: usize) -> Self {
        // Capacity is quantized by the shard so each row is a whole
        // number of aligned words.
        debug_assert_eq!((capacity >> rank) % 64, 0);
        debug_assert_eq!(buffer_offset % 8, 0);
        RowTableDescriptor {
            capacity,
            row_count,
            rank,
            buffer_offset,
            bytes_per_row: capacity >> (3 + rank),
        }
    }

    /// Byte size of the region needed for `row_count` rows of
    /// `capacity` columns at `rank`.
    pub fn buffer_size(capacity: DocIndex, row_count: RowIndex, rank: Rank) -> usize {
        (capacity >> (3 + rank)) * row_count
    }

    pub fn region_bytes(&self) -> usize {
        self.bytes_per_row * self.row_count
    }

    pub fn capacity(&self) -> DocIndex {
        self.capacity
    }

    pub fn row_count(&self) -> RowIndex {
        self.row_count
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Zeroes the region and, at rank 0, fills the match-all and
    /// soft-deleted rows with ones: every column matches the match-all
    /// row, and every column stays invisible until ingestion activates
    /// it. Not safe against concurrent bit operations on the same
    /// buffer.
    pub fn initialize(&self, buffer: &SliceBuffer, term_table: &TermTable) {
        unsafe {
            std::ptr::write_bytes(
                buffer.as_ptr().add(self.buffer_offset),
                0,
                self.region_bytes(),
            );
        }
        if self.rank == 0 {
            for row in [term_table.match_all_row(), term_table.soft_deleted_row()] {
                debug_assert_eq!(row.rank(), 0);
                if row.index() < self.row_count {
                    unsafe {
                        std::ptr::write_bytes(
                            buffer.as_ptr().add(self.row_offset(row.index())),
                            0xFF,
                            self.bytes_per_row,
                        );
                    }
                }
            }
        }
    }

    pub fn get_bit(&self, buffer: &SliceBuffer, row: RowIndex, column: DocIndex) -> bool {
        let (word, mask) = self.locate(row, column);
        buffer.atomic_u64(word).load(Ordering::Acquire) & mask != 0
    }

    pub fn set_bit(&self, buffer: &SliceBuffer, row: RowIndex, column: DocIndex) {
        let (word, mask) = self.locate(row, column);
        buffer.atomic_u64(word).fetch_or(mask, Ordering::AcqRel);
    }

    pub fn clear_bit(&self, buffer: &SliceBuffer, row: RowIndex, column: DocIndex) {
        let (word, mask) = self.locate(row, column);
        buffer.atomic_u64(word).fetch_and(!mask, Ordering::AcqRel);
    }

    /// Offset of a row's first byte from the start of the slice buffer.
    pub fn row_offset(&self, row: RowIndex) -> usize {
        debug_assert!(row < self.row_count);
        self.buffer_offset + row * self.bytes_per_row
    }

    pub fn is_compatible_with(&self, other: &RowTableDescriptor) -> bool {
        self.capacity == other.capacity
            && self.row_count == other.row_count
            && self.rank == other.rank
            && self.buffer_offset == other.buffer_offset
    }

    fn locate(&self, row: RowIndex, column: DocIndex) -> (usize, u64) {
        debug_assert!(row < self.row_count, "row {row} out of range");
        debug_assert!(column < self.capacity, "column {column} out of range");
        let stored = column >> self.rank;
        let word = self.row_offset(row) + (stored / 64) * 8;
        (word, 1u64 << (stored % 64))
    }
}
