use std::io::Read;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::core::error::{Error, Result};
use crate::core::types::{DocId, DocIndex, Rank, ShardId};
use crate::index::row_id::RowId;
use crate::index::term_table::TermTable;
use crate::ingest::handle::DocumentHandle;
use crate::memory::block_pool::SliceBufferAllocator;
use crate::mvcc::recycler::{DeferredSliceListDelete, Recycler};
use crate::mvcc::token::{Token, TokenManager};
use crate::storage::doc_table::DocTableDescriptor;
use crate::storage::row::{align_up, documents_in_rank0_row};
use crate::storage::row_table::RowTableDescriptor;
use crate::storage::schema::DocDataSchema;
use crate::storage::slice::{Slice, SliceBufferRef};

struct SliceList {
    slices: Vec<Arc<Slice>>,
    /// The only slice accepting allocations. None until the first
    /// allocation and after the active slice is recycled.
    active: Option<Arc<Slice>>,
}

/// A partition of the index holding documents of similar posting
/// counts. The shard owns an ordered list of slices, routes column
/// allocation to the active slice, and maintains the published vector
/// of slice buffers that query threads iterate under a token.
///
/// The buffer vector is immutable once published: every change builds
/// a fresh vector and installs it with a single atomic pointer store,
/// then retires the old vector (and, on removal, the slice) through
/// the recycler behind a token-tracker snapshot. Readers therefore see
/// either the old vector or the new one, never a torn state, and
/// `slice_buffers[i]` always pairs with `slices[i]`.
pub struct Shard {
    /// Self-reference handed to slices so a handle can climb from a
    /// slice back to its shard.
    weak: Weak<Shard>,
    id: ShardId,
    term_table: Arc<TermTable>,
    schema: DocDataSchema,
    allocator: Arc<SliceBufferAllocator>,
    recycler: Arc<Recycler>,
    tokens: TokenManager,
    capacity: DocIndex,
    buffer_size: usize,
    trailer_offset: usize,
    doc_table: DocTableDescriptor,
    row_tables: Vec<RowTableDescriptor>,
    list: Mutex<SliceList>,
    buffers: AtomicPtr<Vec<SliceBufferRef>>,
}

impl Shard {
    /// Builds a shard whose slice capacity is derived from the
    /// allocator's block size: the largest quantized column count whose
    /// doc-table and row-table regions, plus the trailing back-pointer,
    /// fit in one block.
    pub fn new(
        id: ShardId,
        term_table: Arc<TermTable>,
        schema: DocDataSchema,
        allocator: Arc<SliceBufferAllocator>,
        recycler: Arc<Recycler>,
        tokens: TokenManager,
    ) -> Result<Arc<Shard>> {
        assert!(term_table.is_sealed(), "shard requires a sealed term table");
        let buffer_size = allocator.block_size();
        let capacity = Self::capacity_for_byte_size(buffer_size, &schema, &term_table)?;
        let (doc_table, row_tables) = Self::build_descriptors(capacity, &schema, &term_table);
        info!(shard = id, capacity, buffer_size, "created shard");
        Ok(Arc::new_cyclic(|weak| Shard {
            weak: weak.clone(),
            id,
            term_table,
            schema,
            allocator,
            recycler,
            tokens,
            capacity,
            buffer_size,
            trailer_offset: buffer_size - size_of::<usize>(),
            doc_table,
            row_tables,
            list: Mutex::new(SliceList { slices: Vec::new(), active: None }),
            buffers: AtomicPtr::new(Box::into_raw(Box::new(Vec::new()))),
        }))
    }

    /// Bytes needed by a slice of `capacity` columns: doc table, then
    /// one row table per rank up to the largest rank in use, then the
    /// back-pointer word.
    fn used_bytes(capacity: DocIndex, schema: &DocDataSchema, term_table: &TermTable) -> usize {
        let mut bytes = align_up(DocTableDescriptor::buffer_size(capacity, schema));
        for rank in 0..=term_table.max_rank_used() {
            bytes += RowTableDescriptor::buffer_size(capacity, term_table.total_row_count(rank), rank);
        }
        bytes + size_of::<usize>()
    }

    /// Inverse of the layout computation: the largest quantized
    /// capacity that fits `buffer_bytes`.
    pub fn capacity_for_byte_size(
        buffer_bytes: usize,
        schema: &DocDataSchema,
        term_table: &TermTable,
    ) -> Result<DocIndex> {
        let quantum = documents_in_rank0_row(1, term_table.max_rank_used());
        if Self::used_bytes(quantum, schema, term_table) > buffer_bytes {
            return Err(Error::InvalidConfig(format!(
                "slice buffer of {buffer_bytes} bytes cannot hold the minimum capacity of {quantum} columns"
            )));
        }
        let mut capacity = quantum;
        while Self::used_bytes(capacity + quantum, schema, term_table) <= buffer_bytes {
            capacity += quantum;
        }
        Ok(capacity)
    }

    fn build_descriptors(
        capacity: DocIndex,
        schema: &DocDataSchema,
        term_table: &TermTable,
    ) -> (DocTableDescriptor, Vec<RowTableDescriptor>) {
        let doc_table = DocTableDescriptor::new(capacity, schema, 0);
        let mut offset = align_up(DocTableDescriptor::buffer_size(capacity, schema));
        let mut row_tables = Vec::with_capacity(term_table.max_rank_used() + 1);
        for rank in 0..=term_table.max_rank_used() {
            let table =
                RowTableDescriptor::new(capacity, term_table.total_row_count(rank), rank, offset);
            offset += table.region_bytes();
            row_tables.push(table);
        }
        (doc_table, row_tables)
    }

    /// Allocates a column for a new document, creating a new active
    /// slice when the current one is out of columns. Fails only when
    /// the buffer pool is exhausted.
    pub fn allocate_document(&self, id: DocId) -> Result<DocumentHandle> {
        let mut list = self.list.lock();
        loop {
            if let Some(active) = list.active.clone() {
                if let Some(index) = active.try_allocate_document() {
                    drop(list);
                    active.doc_table().set_doc_id(active.buffer(), index, id);
                    return Ok(DocumentHandle::new(active, index));
                }
            }
            self.create_active_slice(&mut list)?;
        }
    }

    fn create_active_slice(&self, list: &mut SliceList) -> Result<()> {
        let slice = Slice::new(self)?;
        list.slices.push(slice.clone());
        list.active = Some(slice);
        self.publish_buffers(list, None);
        Ok(())
    }

    /// Removes a fully expired slice from the shard and schedules the
    /// slice and the retired buffer vector for recycling.
    pub fn recycle_slice(&self, slice: &Arc<Slice>) {
        assert!(slice.is_expired(), "recycling a slice that is not fully expired");
        let mut list = self.list.lock();
        let position = list
            .slices
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, slice))
            .expect("slice is not part of this shard");
        let removed = list.slices.remove(position);
        if list.active.as_ref().is_some_and(|active| Arc::ptr_eq(active, slice)) {
            list.active = None;
        }
        debug!(shard = self.id, "retiring slice");
        self.publish_buffers(&list, Some(removed));
    }

    /// Restores a slice from a snapshot stream and adds it to the
    /// shard. The snapshot must have been written by a shard with the
    /// same layout.
    pub fn load_slice(&self, input: &mut impl Read) -> Result<()> {
        let slice = Slice::read(self, input)?;
        let mut list = self.list.lock();
        list.slices.push(slice);
        self.publish_buffers(&list, None);
        Ok(())
    }

    /// Installs a freshly built buffer vector with one atomic store and
    /// hands the previous vector (plus the removed slice, if any) to
    /// the recycler, tagged with a snapshot of the outstanding tokens.
    fn publish_buffers(&self, list: &SliceList, removed: Option<Arc<Slice>>) {
        let fresh: Box<Vec<SliceBufferRef>> =
            Box::new(list.slices.iter().map(|slice| slice.buffer_ref()).collect());
        let old = self.buffers.swap(Box::into_raw(fresh), Ordering::AcqRel);
        let retired = unsafe { Box::from_raw(old) };
        self.recycler.schedule(Box::new(DeferredSliceListDelete::new(
            removed,
            Some(retired),
            self.tokens.start_tracker(),
        )));
    }

    /// The published vector of slice buffers. The token borrow pins the
    /// returned view: the recycler cannot free a vector retired after
    /// the token was issued until the token is returned.
    pub fn slice_buffers<'a>(&'a self, _token: &'a Token) -> &'a [SliceBufferRef] {
        unsafe { (*self.buffers.load(Ordering::Acquire)).as_slice() }
    }

    /// Offset of a row inside any of this shard's slice buffers.
    pub fn row_offset(&self, row: RowId) -> usize {
        self.row_tables[row.rank()].row_offset(row.index())
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn slice_capacity(&self) -> DocIndex {
        self.capacity
    }

    pub fn slice_buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn trailer_offset(&self) -> usize {
        self.trailer_offset
    }

    pub fn slice_count(&self) -> usize {
        self.list.lock().slices.len()
    }

    /// Bytes of buffer memory currently owned by this shard's slices.
    pub fn used_capacity_in_bytes(&self) -> usize {
        self.slice_count() * self.buffer_size
    }

    pub fn term_table(&self) -> &Arc<TermTable> {
        &self.term_table
    }

    pub fn schema(&self) -> &DocDataSchema {
        &self.schema
    }

    pub fn allocator(&self) -> &Arc<SliceBufferAllocator> {
        &self.allocator
    }

    pub fn token_manager(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn doc_table(&self) -> &DocTableDescriptor {
        &self.doc_table
    }

    pub fn row_tables(&self) -> &[RowTableDescriptor] {
        &self.row_tables
    }

    pub fn row_table(&self, rank: Rank) -> &RowTableDescriptor {
        &self.row_tables[rank]
    }

    pub(crate) fn weak_self(&self) -> Weak<Shard> {
        self.weak.clone()
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        // The current vector is still owned by the shard; retired ones
        // belong to the recycler.
        drop(unsafe { Box::from_raw(self.buffers.load(Ordering::Acquire)) });
    }
}
