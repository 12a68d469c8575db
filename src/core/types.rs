use serde::{Serialize, Deserialize};

/// Host-assigned document identifier. Values may have arbitrary gaps;
/// the index makes no density assumptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(pub u64);

impl DocId {
    pub fn new(id: u64) -> Self {
        DocId(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for DocId {
    fn from(id: u64) -> Self {
        DocId(id)
    }
}

/// Zero-based column position of a document within a slice.
/// Valid range is [0, slice capacity).
pub type DocIndex = usize;

/// One stored bit of a rank-r row covers 2^r rank-0 columns.
/// Rank fits in a 3-bit field so that RowId packs into 32 bits.
pub type Rank = usize;
pub const LOG2_MAX_RANK: usize = 3;
pub const MAX_RANK: Rank = (1 << LOG2_MAX_RANK) - 1;

/// Identifier of an index partition grouping documents of similar size.
/// Fits in a 4-bit field.
pub type ShardId = usize;
pub const LOG2_MAX_SHARD_ID: usize = 4;
pub const MAX_SHARD_ID: ShardId = (1 << LOG2_MAX_SHARD_ID) - 1;

/// Ordinal position of a row within a rank's row table. Limited to a
/// 25-bit field by the packed RowId representation.
pub type RowIndex = usize;
pub const LOG2_MAX_ROW_INDEX: usize = 25;
pub const MAX_ROW_INDEX: RowIndex = (1 << LOG2_MAX_ROW_INDEX) - 1;

/// Identifier for a contiguous range of ingested documents.
pub type GroupId = u64;

/// Reserved rank-0 rows present in every term table: soft-deleted,
/// match-all, and match-none, with raw term hashes 0, 1, and 2.
pub const SYSTEM_ROW_COUNT: usize = 3;
