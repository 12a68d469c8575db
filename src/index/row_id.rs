use serde::{Serialize, Deserialize};

use crate::core::types::{Rank, RowIndex, LOG2_MAX_RANK, LOG2_MAX_ROW_INDEX, MAX_RANK, MAX_ROW_INDEX};

const INDEX_SHIFT: u32 = 0;
const RANK_SHIFT: u32 = LOG2_MAX_ROW_INDEX as u32;
const ADHOC_SHIFT: u32 = RANK_SHIFT + LOG2_MAX_RANK as u32;
const VALID_SHIFT: u32 = ADHOC_SHIFT + 1;

const INDEX_MASK: u32 = (1 << LOG2_MAX_ROW_INDEX) - 1;
const RANK_MASK: u32 = (1 << LOG2_MAX_RANK) - 1;

/// Identifies one row of the index: rank, row ordinal within that
/// rank's row table, an adhoc marker, and a validity flag, packed into
/// 32 bits so row ids are cheap to store in lookup tables and are
/// trivially binary-serializable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(u32);

impl RowId {
    pub fn new(rank: Rank, index: RowIndex) -> Self {
        Self::pack(rank, index, false, true)
    }

    pub fn new_adhoc(rank: Rank, index: RowIndex) -> Self {
        Self::pack(rank, index, true, true)
    }

    /// An id for which `is_valid()` returns false.
    pub fn invalid() -> Self {
        RowId(0)
    }

    fn pack(rank: Rank, index: RowIndex, adhoc: bool, valid: bool) -> Self {
        assert!(rank <= MAX_RANK, "rank {rank} out of range");
        assert!(index <= MAX_ROW_INDEX, "row index {index} out of range");
        let mut packed = (index as u32 & INDEX_MASK) << INDEX_SHIFT;
        packed |= (rank as u32 & RANK_MASK) << RANK_SHIFT;
        if adhoc {
            packed |= 1 << ADHOC_SHIFT;
        }
        if valid {
            packed |= 1 << VALID_SHIFT;
        }
        RowId(packed)
    }

    pub fn from_packed(packed: u32) -> Self {
        RowId(packed)
    }

    pub fn packed(&self) -> u32 {
        self.0
    }

    pub fn rank(&self) -> Rank {
        ((self.0 >> RANK_SHIFT) & RANK_MASK) as Rank
    }

    pub fn index(&self) -> RowIndex {
        ((self.0 >> INDEX_SHIFT) & INDEX_MASK) as RowIndex
    }

    pub fn is_adhoc(&self) -> bool {
        (self.0 >> ADHOC_SHIFT) & 1 != 0
    }

    pub fn is_valid(&self) -> bool {
        (self.0 >> VALID_SHIFT) & 1 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_round_trip() {
        for rank in 0..=MAX_RANK {
            for index in [0, 1, 63, 4095, MAX_ROW_INDEX] {
                for adhoc in [false, true] {
                    let id = if adhoc {
                        RowId::new_adhoc(rank, index)
                    } else {
                        RowId::new(rank, index)
                    };
                    let restored = RowId::from_packed(id.packed());
                    assert_eq!(restored.rank(), rank);
                    assert_eq!(restored.index(), index);
                    assert_eq!(restored.is_adhoc(), adhoc);
                    assert!(restored.is_valid());
                }
            }
        }
    }

    #[test]
    fn test_invalid_row_id() {
        assert!(!RowId::invalid().is_valid());
        assert!(RowId::new(0, 0).is_valid());
    }

    #[test]
    fn test_binary_serialization() {
        let id = RowId::new_adhoc(5, 123_456);
        let bytes = bincode::serialize(&id).unwrap();
        assert_eq!(bytes.len(), 4);
        let restored: RowId = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, id);
    }

    #[test]
    #[should_panic]
    fn test_rank_out_of_range_panics() {
        let _ = RowId::new(MAX_RANK + 1, 0);
    }

    #[test]
    #[should_panic]
    fn test_index_out_of_range_panics() {
        let _ = RowId::new(0, MAX_ROW_INDEX + 1);
    }
}
