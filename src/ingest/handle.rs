use std::sync::Arc;

use crate::core::error::Result;
use crate::core::types::{DocId, DocIndex};
use crate::index::row_id::RowId;
use crate::index::term::Term;
use crate::index::term_table::FactHandle;
use crate::storage::schema::{FixedBlobId, VariableBlobId};
use crate::storage::slice::Slice;

/// Handle to one document's column while it is being ingested and for
/// as long as it stays in the index. Implementors of a document source
/// use it to set postings, assert facts, and reach the column's blobs.
/// Cheap to clone; the doc-id map stores one per live document.
///
/// Mutating operations are reserved to the single ingestion thread
/// that owns the column until the document is activated.
#[derive(Clone)]
pub struct DocumentHandle {
    slice: Arc<Slice>,
    index: DocIndex,
}

impl DocumentHandle {
    pub(crate) fn new(slice: Arc<Slice>, index: DocIndex) -> Self {
        DocumentHandle { slice, index }
    }

    /// Records that `term` occurs in this document: sets the bit at
    /// (row, column) for every row id the term table resolves the term
    /// to.
    pub fn add_posting(&self, term: &Term) {
        let buffer = self.slice.buffer();
        for row in self.slice.term_table().term_row_ids(term) {
            self.slice.row_table(row.rank()).set_bit(buffer, row.index(), self.index);
        }
    }

    /// Sets or clears a fact bit for this document.
    pub fn assert_fact(&self, fact: FactHandle, value: bool) {
        let row = self.slice.term_table().fact_row_id(fact);
        let table = self.slice.row_table(row.rank());
        if value {
            table.set_bit(self.slice.buffer(), row.index(), self.index);
        } else {
            table.clear_bit(self.slice.buffer(), row.index(), self.index);
        }
    }

    pub fn allocate_variable_blob(&self, blob: VariableBlobId, byte_count: usize) -> Result<&mut [u8]> {
        self.slice.doc_table().allocate_variable_blob(self.slice.buffer(), self.index, blob, byte_count)
    }

    pub fn variable_blob(&self, blob: VariableBlobId) -> Option<&mut [u8]> {
        self.slice.doc_table().variable_blob(self.slice.buffer(), self.index, blob)
    }

    pub fn fixed_blob(&self, blob: FixedBlobId) -> &mut [u8] {
        self.slice.doc_table().fixed_blob(self.slice.buffer(), self.index, blob)
    }

    pub fn doc_id(&self) -> DocId {
        self.slice.doc_table().doc_id(self.slice.buffer(), self.index)
    }

    /// Makes the column visible to queries by clearing its soft-deleted
    /// bit. Called once the document's content is fully ingested, so a
    /// query that sees the column visible sees every posting bit.
    pub fn activate(&self) {
        let row = self.slice.term_table().soft_deleted_row();
        self.slice.row_table(row.rank()).clear_bit(self.slice.buffer(), row.index(), self.index);
    }

    /// Hides the column from queries immediately and records its
    /// expiry. When this was the last live column of its slice, the
    /// slice is handed to the shard for recycling. May only be called
    /// once per column, after the column was committed.
    pub fn expire(&self) {
        let row = self.slice.term_table().soft_deleted_row();
        self.slice.row_table(row.rank()).set_bit(self.slice.buffer(), row.index(), self.index);
        if self.slice.expire_document() {
            if let Some(shard) = self.slice.shard() {
                shard.recycle_slice(&self.slice);
            }
        }
    }

    /// Reads one bit of this document's column. Diagnostics surface.
    pub fn get_bit(&self, row: RowId) -> bool {
        self.slice.row_table(row.rank()).get_bit(self.slice.buffer(), row.index(), self.index)
    }

    pub fn slice(&self) -> &Arc<Slice> {
        &self.slice
    }

    pub fn index(&self) -> DocIndex {
        self.index
    }
}
