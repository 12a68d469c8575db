use std::io::{Read, Write};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::core::error::{Error, Result};
use crate::core::types::{DocIndex, Rank};
use crate::index::term_table::TermTable;
use crate::memory::block_pool::{SliceBuffer, SliceBufferAllocator};
use crate::storage::doc_table::DocTableDescriptor;
use crate::storage::row_table::RowTableDescriptor;
use crate::storage::schema::DocDataSchema;
use crate::storage::shard::Shard;

/// Column-state counters of a slice. At any moment
/// unallocated + commit_pending + committed + expired-overlap resolves
/// to the capacity: committed = capacity - unallocated - commit_pending,
/// and expired never exceeds committed.
#[derive(Debug)]
struct ColumnCounters {
    unallocated: DocIndex,
    commit_pending: DocIndex,
    expired: DocIndex,
}

#[derive(Serialize, Deserialize)]
struct SliceSnapshotHeader {
    capacity: u64,
    schema: DocDataSchema,
    row_counts: Vec<u64>,
}

/// One contiguous column block of a shard. The slice owns its buffer
/// for the duration of its life and is the unit of allocation,
/// snapshotting, and recycling. All slices of a shard share the same
/// capacity and buffer layout; the layout's offsets live in the
/// descriptors cloned from the shard.
///
/// The last pointer-sized word of the buffer holds a back-pointer to
/// the owning slice, so code that reaches a bare buffer through the
/// shard's published buffer vector can recover the slice.
///
/// Shared ownership: the shard holds one `Arc` reference; long-lived
/// holders (a snapshot writer, the recycler) clone it. Dropping the
/// last reference releases every variable blob and returns the buffer
/// to the allocator. The recycler only drops its reference after the
/// token-tracker snapshot taken at retirement has drained.
pub struct Slice {
    shard: Weak<Shard>,
    term_table: Arc<TermTable>,
    allocator: Arc<SliceBufferAllocator>,
    schema: DocDataSchema,
    capacity: DocIndex,
    trailer_offset: usize,
    doc_table: DocTableDescriptor,
    row_tables: Vec<RowTableDescriptor>,
    buffer: SliceBuffer,
    counters: Mutex<ColumnCounters>,
}

impl Slice {
    /// Creates an empty slice for `shard`, drawing a buffer from the
    /// shard's allocator and initializing the doc table and row tables.
    pub fn new(shard: &Shard) -> Result<Arc<Slice>> {
        let buffer = shard.allocator().allocate(shard.slice_buffer_size())?;
        let capacity = shard.slice_capacity();
        let slice = Arc::new(Slice {
            shard: shard.weak_self(),
            term_table: shard.term_table().clone(),
            allocator: shard.allocator().clone(),
            schema: shard.schema().clone(),
            capacity,
            trailer_offset: shard.trailer_offset(),
            doc_table: shard.doc_table().clone(),
            row_tables: shard.row_tables().to_vec(),
            buffer,
            counters: Mutex::new(ColumnCounters {
                unallocated: capacity,
                commit_pending: 0,
                expired: 0,
            }),
        });
        slice.initialize_buffer();
        debug!(shard = shard.id(), capacity, "created slice");
        Ok(slice)
    }

    /// Restores a full slice from a snapshot stream, verifying that the
    /// stored descriptors and checksum match this shard's layout.
    pub fn read(shard: &Shard, input: &mut impl Read) -> Result<Arc<Slice>> {
        let header: SliceSnapshotHeader = bincode::deserialize_from(&mut *input)?;
        if header.capacity != shard.slice_capacity() as u64 {
            return Err(Error::IncompatibleSlice(format!(
                "capacity {} does not match shard capacity {}",
                header.capacity,
                shard.slice_capacity()
            )));
        }
        if header.schema != *shard.schema() {
            return Err(Error::IncompatibleSlice("document data schema mismatch".to_string()));
        }
        let row_counts: Vec<u64> =
            shard.row_tables().iter().map(|table| table.row_count() as u64).collect();
        if header.row_counts != row_counts {
            return Err(Error::IncompatibleSlice("row table dimensions mismatch".to_string()));
        }

        let buffer = shard.allocator().allocate(shard.slice_buffer_size())?;
        let trailer_offset = shard.trailer_offset();
        let data = unsafe { std::slice::from_raw_parts_mut(buffer.as_ptr(), trailer_offset) };
        if let Err(error) = input.read_exact(data) {
            shard.allocator().release(buffer);
            return Err(error.into());
        }

        let stored_crc: u32 = match bincode::deserialize_from(&mut *input) {
            Ok(crc) => crc,
            Err(error) => {
                shard.allocator().release(buffer);
                return Err(error.into());
            }
        };
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        if hasher.finalize() != stored_crc {
            shard.allocator().release(buffer);
            return Err(Error::IncompatibleSlice("buffer checksum mismatch".to_string()));
        }

        let doc_table = shard.doc_table().clone();
        if let Err(error) = doc_table.load_variable_blobs(&buffer, input) {
            shard.allocator().release(buffer);
            return Err(error);
        }

        let capacity = shard.slice_capacity();
        let slice = Arc::new(Slice {
            shard: shard.weak_self(),
            term_table: shard.term_table().clone(),
            allocator: shard.allocator().clone(),
            schema: shard.schema().clone(),
            capacity,
            trailer_offset,
            doc_table,
            row_tables: shard.row_tables().to_vec(),
            buffer,
            // A snapshot is only taken of a full slice: every column
            // allocated and committed, none expired.
            counters: Mutex::new(ColumnCounters {
                unallocated: 0,
                commit_pending: 0,
                expired: 0,
            }),
        });
        slice.install_back_pointer();
        debug!(shard = shard.id(), capacity, "loaded slice from snapshot");
        Ok(slice)
    }

    /// Serializes this slice. Only a full slice (every column allocated
    /// and committed) may be written.
    pub fn write(&self, output: &mut impl Write) -> Result<()> {
        assert!(self.is_full(), "only a full slice may be written");
        let header = SliceSnapshotHeader {
            capacity: self.capacity as u64,
            schema: self.schema.clone(),
            row_counts: self.row_tables.iter().map(|table| table.row_count() as u64).collect(),
        };
        bincode::serialize_into(&mut *output, &header)?;

        let data = unsafe { std::slice::from_raw_parts(self.buffer.as_ptr(), self.trailer_offset) };
        output.write_all(data)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        bincode::serialize_into(&mut *output, &hasher.finalize())?;

        self.doc_table.write_variable_blobs(&self.buffer, output)
    }

    fn initialize_buffer(&self) {
        self.doc_table.initialize(&self.buffer);
        for table in &self.row_tables {
            table.initialize(&self.buffer, &self.term_table);
        }
        self.install_back_pointer();
    }

    fn install_back_pointer(&self) {
        self.buffer
            .atomic_usize(self.trailer_offset)
            .store(self as *const Slice as usize, Ordering::Release);
    }

    //
    // Column lifecycle. Free -> Pending -> Committed -> Expired.
    //

    /// Claims one free column. Returns None once every column has been
    /// handed out.
    pub fn try_allocate_document(&self) -> Option<DocIndex> {
        let mut counters = self.counters.lock();
        if counters.unallocated == 0 {
            return None;
        }
        let index = self.capacity - counters.unallocated;
        counters.unallocated -= 1;
        counters.commit_pending += 1;
        Some(index)
    }

    /// Moves one pending column to committed. Returns true iff the
    /// slice is now full, in which case the caller seals it.
    pub fn commit_document(&self) -> bool {
        let mut counters = self.counters.lock();
        assert!(counters.commit_pending > 0, "commit without a pending allocation");
        counters.commit_pending -= 1;
        counters.unallocated == 0 && counters.commit_pending == 0
    }

    /// Expires one committed column. Returns true iff every column of
    /// the slice is now expired, in which case the caller schedules the
    /// slice for recycling.
    pub fn expire_document(&self) -> bool {
        let mut counters = self.counters.lock();
        let committed = self.capacity - counters.unallocated - counters.commit_pending;
        assert!(counters.expired < committed, "expiring a column that was never committed");
        counters.expired += 1;
        counters.expired == self.capacity
    }

    /// Full means every column is allocated and committed.
    pub fn is_full(&self) -> bool {
        let counters = self.counters.lock();
        counters.unallocated == 0 && counters.commit_pending == 0
    }

    /// Fully expired slices are eligible for recycling.
    pub fn is_expired(&self) -> bool {
        self.counters.lock().expired == self.capacity
    }

    //
    // Accessors.
    //

    pub fn capacity(&self) -> DocIndex {
        self.capacity
    }

    pub fn buffer(&self) -> &SliceBuffer {
        &self.buffer
    }

    pub fn doc_table(&self) -> &DocTableDescriptor {
        &self.doc_table
    }

    pub fn row_table(&self, rank: Rank) -> &RowTableDescriptor {
        &self.row_tables[rank]
    }

    pub fn term_table(&self) -> &Arc<TermTable> {
        &self.term_table
    }

    /// The owning shard, if it is still alive.
    pub fn shard(&self) -> Option<Arc<Shard>> {
        self.shard.upgrade()
    }

    pub(crate) fn buffer_ref(&self) -> SliceBufferRef {
        SliceBufferRef { buffer: self.buffer, trailer_offset: self.trailer_offset }
    }
}

impl Drop for Slice {
    fn drop(&mut self) {
        debug!(capacity = self.capacity, "destroying slice");
        self.doc_table.cleanup(&self.buffer);
        self.allocator.release(self.buffer);
    }
}

/// Recovers the slice that owns `buffer` from the back-pointer stored
/// in the buffer's trailing word.
///
/// # Safety
///
/// The buffer must belong to a live slice, which the caller guarantees
/// by holding a token covering the buffer vector the reference came
/// from, or by otherwise keeping the slice alive.
pub unsafe fn slice_from_buffer<'a>(buffer: &'a SliceBuffer, trailer_offset: usize) -> &'a Slice {
    let address = buffer.atomic_usize(trailer_offset).load(Ordering::Acquire);
    debug_assert!(address != 0, "buffer has no installed back-pointer");
    unsafe { &*(address as *const Slice) }
}

/// One entry of a shard's published buffer vector: the raw buffer plus
/// the trailer position needed to climb back to the owning slice.
#[derive(Clone, Copy)]
pub struct SliceBufferRef {
    buffer: SliceBuffer,
    trailer_offset: usize,
}

impl SliceBufferRef {
    pub fn buffer(&self) -> &SliceBuffer {
        &self.buffer
    }

    /// The slice owning this buffer.
    ///
    /// # Safety
    ///
    /// Callers must hold a token issued before this reference's buffer
    /// vector was retired (the matcher contract), or otherwise keep the
    /// slice alive.
    pub unsafe fn slice(&self) -> &Slice {
        unsafe { slice_from_buffer(&self.buffer, self.trailer_offset) }
    }
}
