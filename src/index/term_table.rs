use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::types::{Rank, RowIndex, ShardId, MAX_RANK, SYSTEM_ROW_COUNT};
use crate::index::row_id::RowId;
use crate::index::term::{xxhash64, Term, TermHash};

/// How a term's rows are resolved by a sealed term table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    /// Rows were enumerated at build time; (start, count) index the
    /// table's row-id buffer.
    Explicit,
    /// Rows are drawn pseudo-randomly from the adhoc pool, keyed by the
    /// term's raw hash.
    Adhoc,
    /// A private row backing a host-defined boolean predicate.
    Fact,
    /// The term was removed from the index; it has no rows.
    Disposed,
}

/// Compact handle to the row-id sequence of one term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedTermInfo {
    pub kind: TermKind,
    pub start: u32,
    pub count: u8,
}

impl PackedTermInfo {
    fn empty() -> Self {
        PackedTermInfo { kind: TermKind::Disposed, start: 0, count: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Handle to a private fact row. Handles 0..3 are the system facts
/// (soft-deleted, match-all, match-none); host facts follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactHandle(pub u32);

pub const SOFT_DELETED_FACT: FactHandle = FactHandle(0);
pub const MATCH_ALL_FACT: FactHandle = FactHandle(1);
pub const MATCH_NONE_FACT: FactHandle = FactHandle(2);

#[derive(Debug, Clone, Copy, Default)]
struct RankRows {
    explicit: RowIndex,
    adhoc: RowIndex,
    facts: RowIndex,
    finalized: bool,
}

/// Maps term hashes to row-id sequences. Built once through the
/// open/close builder calls, then sealed; a sealed table is immutable
/// and the row ids it returns for a term are stable for its lifetime,
/// so callers may cache row offsets derived from them.
///
/// The constructor reserves the three system rows as rank-0 rows 0..3;
/// explicit row counts at rank 0 include them.
pub struct TermTable {
    row_ids: Vec<RowId>,
    entries: HashMap<TermHash, (u32, u8)>,
    disposed: HashSet<TermHash>,
    fact_rows: Vec<RowId>,
    /// One entry per adhoc draw slot; the value is the rank whose adhoc
    /// pool that slot draws from.
    adhoc_slots: Vec<Rank>,
    rows: [RankRows; MAX_RANK + 1],
    open_term_start: Option<usize>,
    open_adhoc_rank: Option<Rank>,
    sealed: bool,
}

impl Default for TermTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TermTable {
    pub fn new() -> Self {
        TermTable {
            row_ids: Vec::new(),
            entries: HashMap::new(),
            disposed: HashSet::new(),
            // System rows sit at the front of the rank-0 row table.
            fact_rows: (0..SYSTEM_ROW_COUNT).map(|i| RowId::new(0, i)).collect(),
            adhoc_slots: Vec::new(),
            rows: [RankRows::default(); MAX_RANK + 1],
            open_term_start: None,
            open_adhoc_rank: None,
            sealed: false,
        }
    }

    //
    // Builder phase. All of these panic on a sealed table.
    //

    pub fn open_term(&mut self) {
        self.assert_unsealed();
        assert!(self.open_term_start.is_none(), "a term is already open");
        assert!(self.open_adhoc_rank.is_none(), "an adhoc term is already open");
        self.open_term_start = Some(self.row_ids.len());
    }

    pub fn add_row_id(&mut self, row: RowId) {
        self.assert_unsealed();
        if let Some(rank) = self.open_adhoc_rank {
            assert_eq!(row.rank(), rank, "adhoc prototype rank mismatch");
            self.adhoc_slots.push(rank);
        } else {
            assert!(self.open_term_start.is_some(), "no open term");
            self.row_ids.push(row);
        }
    }

    /// Associates the accumulated row ids with `hash` as an explicit
    /// entry. Duplicate hashes and the reserved system hashes are fatal.
    pub fn close_term(&mut self, hash: TermHash) {
        self.assert_unsealed();
        let start = self.open_term_start.take().expect("no open term");
        assert!(
            hash >= SYSTEM_ROW_COUNT as TermHash,
            "term hash {hash} collides with a system row"
        );
        let count = self.row_ids.len() - start;
        assert!(count <= u8::MAX as usize, "too many rows for one term");
        let previous = self.entries.insert(hash, (start as u32, count as u8));
        assert!(previous.is_none(), "term hash {hash} closed twice");
    }

    /// Begins an adhoc reservation at `rank`. Each `add_row_id` before
    /// `close_adhoc_term` adds one draw slot: one row an adhoc term
    /// selects from the rank's adhoc pool at query time.
    pub fn open_adhoc_term(&mut self, rank: Rank) {
        self.assert_unsealed();
        assert!(rank <= MAX_RANK);
        assert!(self.open_term_start.is_none(), "a term is already open");
        assert!(self.open_adhoc_rank.is_none(), "an adhoc term is already open");
        self.open_adhoc_rank = Some(rank);
    }

    pub fn close_adhoc_term(&mut self) {
        self.assert_unsealed();
        assert!(self.open_adhoc_rank.take().is_some(), "no open adhoc term");
    }

    /// Reserves one private row at `rank` for a host-defined boolean
    /// fact. Must be called after `set_row_counts` for that rank so the
    /// fact row lands past the explicit and adhoc regions.
    pub fn add_fact_row(&mut self, rank: Rank) -> FactHandle {
        self.assert_unsealed();
        let counts = &mut self.rows[rank];
        assert!(counts.finalized, "set_row_counts({rank}, ..) must precede add_fact_row");
        let index = counts.explicit + counts.adhoc + counts.facts;
        counts.facts += 1;
        let handle = FactHandle(self.fact_rows.len() as u32);
        self.fact_rows.push(RowId::new(rank, index));
        handle
    }

    /// Marks a term as removed from the index; a sealed table resolves
    /// it to an empty row sequence.
    pub fn dispose_term(&mut self, hash: TermHash) {
        self.assert_unsealed();
        self.disposed.insert(hash);
    }

    /// Finalizes the row-table dimensions of one rank. Explicit counts
    /// at rank 0 include the three system rows.
    pub fn set_row_counts(&mut self, rank: Rank, explicit: RowIndex, adhoc: RowIndex) {
        self.assert_unsealed();
        if rank == 0 {
            assert!(
                explicit >= SYSTEM_ROW_COUNT,
                "rank 0 explicit count must include the system rows"
            );
        }
        let counts = &mut self.rows[rank];
        assert!(counts.facts == 0, "row counts set after fact rows were added");
        counts.explicit = explicit;
        counts.adhoc = adhoc;
        counts.finalized = true;
    }

    /// Freezes the table. Every query-side accessor requires a sealed
    /// table.
    pub fn seal(&mut self) {
        self.assert_unsealed();
        assert!(self.open_term_start.is_none(), "seal with an open term");
        assert!(self.open_adhoc_rank.is_none(), "seal with an open adhoc term");
        assert!(
            self.rows[0].explicit >= SYSTEM_ROW_COUNT,
            "rank 0 row counts must be set and include the system rows"
        );
        for row in &self.row_ids {
            let counts = &self.rows[row.rank()];
            assert!(
                row.index() < counts.explicit,
                "row {:?} outside the explicit region of rank {}",
                row,
                row.rank()
            );
        }
        for &rank in &self.adhoc_slots {
            assert!(self.rows[rank].adhoc > 0, "adhoc slot at rank {rank} with an empty pool");
        }
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    //
    // Sealed phase.
    //

    /// Resolves a term to the description of its row-id sequence.
    pub fn get_term_info(&self, term: &Term) -> PackedTermInfo {
        assert!(self.sealed, "get_term_info on an unsealed term table");
        let hash = term.raw_hash();
        if hash < SYSTEM_ROW_COUNT as TermHash {
            return PackedTermInfo { kind: TermKind::Fact, start: hash as u32, count: 1 };
        }
        if self.disposed.contains(&hash) {
            return PackedTermInfo::empty();
        }
        if let Some(&(start, count)) = self.entries.get(&hash) {
            return PackedTermInfo { kind: TermKind::Explicit, start, count };
        }
        if !self.adhoc_slots.is_empty() {
            return PackedTermInfo {
                kind: TermKind::Adhoc,
                start: 0,
                count: self.adhoc_slots.len() as u8,
            };
        }
        PackedTermInfo::empty()
    }

    pub fn row_id(&self, slot: usize) -> RowId {
        self.row_ids[slot]
    }

    /// Selects the adhoc row for draw slot `slot` of a term with the
    /// given raw hash. The mix is a seeded xxhash of the raw hash with
    /// the variant as seed, reduced into the rank's adhoc pool; the same
    /// (hash, slot) always yields the same row, at build time and at
    /// query time alike.
    pub fn row_id_adhoc(&self, hash: TermHash, slot: usize, variant: usize) -> RowId {
        let rank = self.adhoc_slots[slot];
        let counts = &self.rows[rank];
        debug_assert!(counts.adhoc > 0);
        let draw = xxhash64(variant as u64, &hash.to_le_bytes()) % counts.adhoc as u64;
        RowId::new_adhoc(rank, counts.explicit + draw as usize)
    }

    pub fn fact_row_id(&self, fact: FactHandle) -> RowId {
        self.fact_rows[fact.0 as usize]
    }

    pub fn soft_deleted_row(&self) -> RowId {
        self.fact_rows[SOFT_DELETED_FACT.0 as usize]
    }

    pub fn match_all_row(&self) -> RowId {
        self.fact_rows[MATCH_ALL_FACT.0 as usize]
    }

    pub fn match_none_row(&self) -> RowId {
        self.fact_rows[MATCH_NONE_FACT.0 as usize]
    }

    /// Iterates the row ids of a term.
    pub fn term_row_ids<'a>(&'a self, term: &Term) -> TermRowIds<'a> {
        let info = self.get_term_info(term);
        TermRowIds { table: self, info, hash: term.raw_hash(), next: 0 }
    }

    /// Number of rows laid out in slice buffers at `rank`: explicit
    /// plus adhoc plus fact rows.
    pub fn total_row_count(&self, rank: Rank) -> RowIndex {
        let counts = &self.rows[rank];
        counts.explicit + counts.adhoc + counts.facts
    }

    /// Largest rank with at least one row, used as the cross-rank
    /// padding quantum for row geometry.
    pub fn max_rank_used(&self) -> Rank {
        (0..=MAX_RANK).rev().find(|&rank| self.total_row_count(rank) > 0).unwrap_or(0)
    }

    fn assert_unsealed(&self) {
        assert!(!self.sealed, "builder call on a sealed term table");
    }
}

/// Iterator over the row ids of one term against one sealed table.
pub struct TermRowIds<'a> {
    table: &'a TermTable,
    info: PackedTermInfo,
    hash: TermHash,
    next: usize,
}

impl<'a> Iterator for TermRowIds<'a> {
    type Item = RowId;

    fn next(&mut self) -> Option<RowId> {
        if self.next >= self.info.count as usize {
            return None;
        }
        let slot = self.info.start as usize + self.next;
        let row = match self.info.kind {
            TermKind::Explicit => self.table.row_id(slot),
            TermKind::Adhoc => self.table.row_id_adhoc(self.hash, slot, self.next),
            TermKind::Fact => self.table.fact_row_id(FactHandle(slot as u32)),
            TermKind::Disposed => return None,
        };
        self.next += 1;
        Some(row)
    }
}

/// Sealed term tables of all shards, indexed by ShardId.
pub struct TermTableCollection {
    tables: Vec<Arc<TermTable>>,
}

impl TermTableCollection {
    pub fn new(tables: Vec<Arc<TermTable>>) -> Self {
        for table in &tables {
            assert!(table.is_sealed(), "term table collection requires sealed tables");
        }
        TermTableCollection { tables }
    }

    pub fn get(&self, shard: ShardId) -> &Arc<TermTable> {
        &self.tables[shard]
    }

    pub fn shard_count(&self) -> usize {
        self.tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_table() -> TermTable {
        let mut table = TermTable::new();
        table.open_term();
        table.add_row_id(RowId::new(0, 3));
        table.add_row_id(RowId::new(0, 4));
        table.close_term(100);
        table.open_term();
        table.add_row_id(RowId::new(3, 0));
        table.close_term(101);
        table.open_adhoc_term(0);
        table.add_row_id(RowId::new(0, 0));
        table.add_row_id(RowId::new(0, 0));
        table.close_adhoc_term();
        table.set_row_counts(0, 5, 4);
        table.set_row_counts(3, 1, 0);
        table.seal();
        table
    }

    #[test]
    fn test_explicit_lookup() {
        let table = sealed_table();
        let term = Term::from_parts(100, 0, 1);
        let info = table.get_term_info(&term);
        assert_eq!(info.kind, TermKind::Explicit);
        let rows: Vec<RowId> = table.term_row_ids(&term).collect();
        assert_eq!(rows, vec![RowId::new(0, 3), RowId::new(0, 4)]);
    }

    #[test]
    fn test_row_ids_are_stable_across_calls() {
        let table = sealed_table();
        for hash in [100u64, 101, 987_654_321] {
            let term = Term::from_parts(hash, 0, 1);
            let first: Vec<RowId> = table.term_row_ids(&term).collect();
            for _ in 0..10 {
                let again: Vec<RowId> = table.term_row_ids(&term).collect();
                assert_eq!(again, first);
            }
        }
    }

    #[test]
    fn test_adhoc_selection_stays_in_pool() {
        let table = sealed_table();
        for hash in 1000u64..1100 {
            let term = Term::from_parts(hash, 0, 1);
            let info = table.get_term_info(&term);
            assert_eq!(info.kind, TermKind::Adhoc);
            for row in table.term_row_ids(&term) {
                assert_eq!(row.rank(), 0);
                assert!(row.is_adhoc());
                // Pool occupies indexes [explicit, explicit + adhoc).
                assert!(row.index() >= 5 && row.index() < 9);
            }
        }
    }

    #[test]
    fn test_system_terms_resolve_to_system_rows() {
        let table = sealed_table();
        let soft_deleted = Term::from_parts(0, 0, 1);
        let rows: Vec<RowId> = table.term_row_ids(&soft_deleted).collect();
        assert_eq!(rows, vec![RowId::new(0, 0)]);
        assert_eq!(table.soft_deleted_row(), RowId::new(0, 0));
        assert_eq!(table.match_all_row(), RowId::new(0, 1));
        assert_eq!(table.match_none_row(), RowId::new(0, 2));
    }

    #[test]
    fn test_disposed_term_has_no_rows() {
        let mut table = TermTable::new();
        table.dispose_term(55);
        table.set_row_counts(0, 3, 0);
        table.seal();
        let info = table.get_term_info(&Term::from_parts(55, 0, 1));
        assert_eq!(info.kind, TermKind::Disposed);
        assert!(info.is_empty());
    }

    #[test]
    fn test_fact_rows_follow_explicit_and_adhoc() {
        let mut table = TermTable::new();
        table.set_row_counts(0, 4, 2);
        let first = table.add_fact_row(0);
        let second = table.add_fact_row(0);
        table.seal();
        assert_eq!(table.fact_row_id(first), RowId::new(0, 6));
        assert_eq!(table.fact_row_id(second), RowId::new(0, 7));
        assert_eq!(table.total_row_count(0), 8);
    }

    #[test]
    fn test_total_row_count_and_max_rank() {
        let table = sealed_table();
        assert_eq!(table.total_row_count(0), 9);
        assert_eq!(table.total_row_count(3), 1);
        assert_eq!(table.total_row_count(6), 0);
        assert_eq!(table.max_rank_used(), 3);
    }

    #[test]
    #[should_panic(expected = "closed twice")]
    fn test_duplicate_close_term_panics() {
        let mut table = TermTable::new();
        table.open_term();
        table.add_row_id(RowId::new(0, 3));
        table.close_term(7);
        table.open_term();
        table.add_row_id(RowId::new(0, 4));
        table.close_term(7);
    }

    #[test]
    #[should_panic(expected = "unsealed")]
    fn test_get_term_info_on_unsealed_table_panics() {
        let table = TermTable::new();
        let _ = table.get_term_info(&Term::from_parts(9, 0, 1));
    }

    #[test]
    #[should_panic(expected = "sealed term table")]
    fn test_set_row_counts_after_seal_panics() {
        let mut table = TermTable::new();
        table.set_row_counts(0, 3, 0);
        table.seal();
        table.set_row_counts(0, 4, 0);
    }
}
