use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::core::error::{Error, Result};

/// Handle to one fixed-size block loaned out by the allocator. The
/// allocator owns the memory for its whole lifetime; a handle is a
/// (pointer, length) pair that a slice holds until it releases the
/// block back to the pool.
#[derive(Clone, Copy)]
pub struct SliceBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for SliceBuffer {}
unsafe impl Sync for SliceBuffer {}

impl SliceBuffer {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Views the 8 bytes at `offset` as an atomic word. Offsets must be
    /// word-aligned and in bounds.
    pub(crate) fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= self.len);
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU64) }
    }

    pub(crate) fn atomic_usize(&self, offset: usize) -> &AtomicUsize {
        debug_assert!(offset % size_of::<usize>() == 0 && offset + size_of::<usize>() <= self.len);
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicUsize) }
    }
}

/// Fixed-size block pool backing slice buffers. All blocks are
/// allocated up front, zeroed; `allocate` only serves requests for
/// exactly the configured block size, and `release` zeroes a block
/// before returning it to the pool so a fresh slice always starts from
/// known-zero memory.
pub struct SliceBufferAllocator {
    block_size: usize,
    blocks: Vec<NonNull<u8>>,
    free: Mutex<Vec<NonNull<u8>>>,
    in_use: AtomicUsize,
}

unsafe impl Send for SliceBufferAllocator {}
unsafe impl Sync for SliceBufferAllocator {}

impl SliceBufferAllocator {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        assert!(block_size >= 64 && block_size % 8 == 0, "block size must be a multiple of 8");
        assert!(block_count > 0, "pool needs at least one block");
        let layout = Self::layout(block_size);
        let blocks: Vec<NonNull<u8>> = (0..block_count)
            .map(|_| {
                let ptr = unsafe { alloc_zeroed(layout) };
                NonNull::new(ptr).expect("slice buffer allocation failed")
            })
            .collect();
        let free = blocks.clone();
        SliceBufferAllocator {
            block_size,
            blocks,
            free: Mutex::new(free),
            in_use: AtomicUsize::new(0),
        }
    }

    fn layout(block_size: usize) -> Layout {
        Layout::from_size_align(block_size, 8).expect("bad block layout")
    }

    /// Hands out one zeroed block. Fails unless `byte_size` is exactly
    /// the configured block size, or when every block is loaned out.
    pub fn allocate(&self, byte_size: usize) -> Result<SliceBuffer> {
        if byte_size != self.block_size {
            return Err(Error::WrongBlockSize { expected: self.block_size, requested: byte_size });
        }
        let ptr = self.free.lock().pop().ok_or(Error::PoolExhausted)?;
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(SliceBuffer { ptr, len: self.block_size })
    }

    /// Returns a block to the pool, zeroing it first.
    pub fn release(&self, buffer: SliceBuffer) {
        debug_assert_eq!(buffer.len, self.block_size);
        unsafe { std::ptr::write_bytes(buffer.ptr.as_ptr(), 0, self.block_size) };
        self.free.lock().push(buffer.ptr);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

impl Drop for SliceBufferAllocator {
    fn drop(&mut self) {
        let layout = Self::layout(self.block_size);
        for block in &self.blocks {
            unsafe { dealloc(block.as_ptr(), layout) };
        }
    }
}
