use std::io::{Read, Write};
use std::sync::atomic::Ordering;

use crate::core::error::{Error, Result};
use crate::core::types::{DocId, DocIndex};
use crate::memory::block_pool::SliceBuffer;
use crate::storage::row::align_up;
use crate::storage::schema::{DocDataSchema, FixedBlobId, VariableBlobId};

const DOC_ID_BYTES: usize = 8;
const BLOB_DESCRIPTOR_BYTES: usize = 12;

/// Descriptor of one variable-size blob as stored inside a doc-table
/// record: the heap pointer and the byte length. The length is carried
/// so the blob can be serialized. Packed to 12 bytes; records read and
/// write it unaligned.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct BlobDescriptor {
    data: *mut u8,
    len: u32,
}

/// Per-column document data over a slice buffer: an 8-byte DocId, then
/// the variable-blob descriptors, then the fixed-blob bytes, with the
/// record size rounded up to 8. One descriptor instance serves every
/// slice of a shard.
///
/// Mutating operations on a column are reserved to the single
/// ingestion thread that owns the column; the doc id itself is stored
/// through an atomic word because query threads read it concurrently.
#[derive(Debug, Clone)]
pub struct DocTableDescriptor {
    buffer_offset: usize,
    capacity: DocIndex,
    variable_blob_count: usize,
    fixed_blob_offsets: Vec<usize>,
    fixed_blob_sizes: Vec<usize>,
    bytes_per_item: usize,
}

impl DocTableDescriptor {
    pub fn new(capacity: DocIndex, schema: &DocDataSchema, buffer_offset: usize) -> Self {
        debug_assert_eq!(buffer_offset % 8, 0);
        let fixed_base = DOC_ID_BYTES + schema.variable_blob_count() * BLOB_DESCRIPTOR_BYTES;
        let mut fixed_blob_offsets = Vec::with_capacity(schema.fixed_blob_sizes().len());
        let mut next = fixed_base;
        for &size in schema.fixed_blob_sizes() {
            fixed_blob_offsets.push(next);
            next += size;
        }
        DocTableDescriptor {
            buffer_offset,
            capacity,
            variable_blob_count: schema.variable_blob_count(),
            fixed_blob_offsets,
            fixed_blob_sizes: schema.fixed_blob_sizes().to_vec(),
            bytes_per_item: align_up(next),
        }
    }

    /// Byte size of the doc-table region for `capacity` columns.
    pub fn buffer_size(capacity: DocIndex, schema: &DocDataSchema) -> usize {
        let bytes = DOC_ID_BYTES
            + schema.variable_blob_count() * BLOB_DESCRIPTOR_BYTES
            + schema.fixed_blob_sizes().iter().sum::<usize>();
        capacity * align_up(bytes)
    }

    pub fn region_bytes(&self) -> usize {
        self.capacity * self.bytes_per_item
    }

    pub fn capacity(&self) -> DocIndex {
        self.capacity
    }

    pub fn bytes_per_item(&self) -> usize {
        self.bytes_per_item
    }

    /// Zeroes the region: null blob descriptors, zero doc ids, zero
    /// fixed blobs. Not safe against concurrent column operations.
    pub fn initialize(&self, buffer: &SliceBuffer) {
        unsafe {
            std::ptr::write_bytes(
                buffer.as_ptr().add(self.buffer_offset),
                0,
                self.region_bytes(),
            );
        }
    }

    pub fn doc_id(&self, buffer: &SliceBuffer, column: DocIndex) -> DocId {
        DocId(buffer.atomic_u64(self.item_offset(column)).load(Ordering::Acquire))
    }

    pub fn set_doc_id(&self, buffer: &SliceBuffer, column: DocIndex, id: DocId) {
        buffer.atomic_u64(self.item_offset(column)).store(id.0, Ordering::Release);
    }

    /// Heap-allocates a zeroed blob for (column, blob) and records it in
    /// the descriptor. The memory is owned by the slice and released by
    /// `cleanup`. Fails if the blob was already allocated.
    #[allow(clippy::mut_from_ref)]
    pub fn allocate_variable_blob(
        &self,
        buffer: &SliceBuffer,
        column: DocIndex,
        blob: VariableBlobId,
        byte_count: usize,
    ) -> Result<&mut [u8]> {
        let descriptor_ptr = self.descriptor_ptr(buffer, column, blob);
        let existing = unsafe { descriptor_ptr.read_unaligned() };
        if !existing.data.is_null() {
            return Err(Error::BlobAlreadyAllocated { column, blob: blob.0 });
        }
        let data = Box::into_raw(vec![0u8; byte_count].into_boxed_slice()) as *mut u8;
        unsafe {
            descriptor_ptr.write_unaligned(BlobDescriptor { data, len: byte_count as u32 });
            Ok(std::slice::from_raw_parts_mut(data, byte_count))
        }
    }

    /// The blob previously allocated for (column, blob), or None.
    #[allow(clippy::mut_from_ref)]
    pub fn variable_blob(
        &self,
        buffer: &SliceBuffer,
        column: DocIndex,
        blob: VariableBlobId,
    ) -> Option<&mut [u8]> {
        let descriptor = unsafe { self.descriptor_ptr(buffer, column, blob).read_unaligned() };
        if descriptor.data.is_null() {
            None
        } else {
            Some(unsafe { std::slice::from_raw_parts_mut(descriptor.data, descriptor.len as usize) })
        }
    }

    /// The fixed blob of (column, blob); zero-initialized, always
    /// present once the column is allocated.
    #[allow(clippy::mut_from_ref)]
    pub fn fixed_blob(
        &self,
        buffer: &SliceBuffer,
        column: DocIndex,
        blob: FixedBlobId,
    ) -> &mut [u8] {
        let offset = self.item_offset(column) + self.fixed_blob_offsets[blob.0];
        unsafe {
            std::slice::from_raw_parts_mut(
                buffer.as_ptr().add(offset),
                self.fixed_blob_sizes[blob.0],
            )
        }
    }

    /// Releases every variable blob of every column. Called from the
    /// slice destructor; must not race column operations.
    pub fn cleanup(&self, buffer: &SliceBuffer) {
        for column in 0..self.capacity {
            for blob in 0..self.variable_blob_count {
                let descriptor_ptr = self.descriptor_ptr(buffer, column, VariableBlobId(blob));
                let descriptor = unsafe { descriptor_ptr.read_unaligned() };
                if !descriptor.data.is_null() {
                    unsafe {
                        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                            descriptor.data,
                            descriptor.len as usize,
                        )));
                        descriptor_ptr
                            .write_unaligned(BlobDescriptor { data: std::ptr::null_mut(), len: 0 });
                    }
                }
            }
        }
    }

    /// Streams out every variable blob. Fixed blobs live inside the
    /// slice buffer and travel with it.
    pub fn write_variable_blobs(&self, buffer: &SliceBuffer, output: &mut impl Write) -> Result<()> {
        for column in 0..self.capacity {
            for blob in 0..self.variable_blob_count {
                let data: Option<Vec<u8>> = self
                    .variable_blob(buffer, column, VariableBlobId(blob))
                    .map(|bytes| bytes.to_vec());
                bincode::serialize_into(&mut *output, &data)?;
            }
        }
        Ok(())
    }

    /// Restores variable blobs from a stream, overwriting whatever
    /// descriptor bytes were loaded with the raw buffer.
    pub fn load_variable_blobs(&self, buffer: &SliceBuffer, input: &mut impl Read) -> Result<()> {
        for column in 0..self.capacity {
            for blob in 0..self.variable_blob_count {
                let data: Option<Vec<u8>> = bincode::deserialize_from(&mut *input)?;
                let descriptor = match data {
                    Some(bytes) => {
                        let len = bytes.len() as u32;
                        let data = Box::into_raw(bytes.into_boxed_slice()) as *mut u8;
                        BlobDescriptor { data, len }
                    }
                    None => BlobDescriptor { data: std::ptr::null_mut(), len: 0 },
                };
                unsafe {
                    self.descriptor_ptr(buffer, column, VariableBlobId(blob))
                        .write_unaligned(descriptor);
                }
            }
        }
        Ok(())
    }

    pub fn is_compatible_with(&self, other: &DocTableDescriptor) -> bool {
        self.buffer_offset == other.buffer_offset
            && self.capacity == other.capacity
            && self.variable_blob_count == other.variable_blob_count
            && self.fixed_blob_sizes == other.fixed_blob_sizes
            && self.bytes_per_item == other.bytes_per_item
    }

    fn item_offset(&self, column: DocIndex) -> usize {
        debug_assert!(column < self.capacity, "column {column} out of range");
        self.buffer_offset + column * self.bytes_per_item
    }

    fn descriptor_ptr(
        &self,
        buffer: &SliceBuffer,
        column: DocIndex,
        blob: VariableBlobId,
    ) -> *mut BlobDescriptor {
        debug_assert!(blob.0 < self.variable_blob_count, "blob id out of range");
        let offset = self.item_offset(column) + DOC_ID_BYTES + blob.0 * BLOB_DESCRIPTOR_BYTES;
        unsafe { buffer.as_ptr().add(offset) as *mut BlobDescriptor }
    }
}
