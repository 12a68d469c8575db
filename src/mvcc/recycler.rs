use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::mvcc::token::TokenTracker;
use crate::storage::slice::{Slice, SliceBufferRef};

const RECYCLER_QUEUE_CAPACITY: usize = 100;

/// A resource whose destruction has been deferred until its readers
/// have drained.
pub trait Recyclable: Send {
    fn recycle(self: Box<Self>);
}

/// Retirement record for a slice-list change: the retired buffer
/// vector, plus the removed slice when the change was a removal. The
/// paired tracker snapshots the tokens that could still be walking the
/// old vector; both pieces are dropped only after it drains.
pub struct DeferredSliceListDelete {
    slice: Option<Arc<Slice>>,
    buffers: Option<Box<Vec<SliceBufferRef>>>,
    tracker: TokenTracker,
}

impl DeferredSliceListDelete {
    pub fn new(
        slice: Option<Arc<Slice>>,
        buffers: Option<Box<Vec<SliceBufferRef>>>,
        tracker: TokenTracker,
    ) -> Self {
        DeferredSliceListDelete { slice, buffers, tracker }
    }
}

impl Recyclable for DeferredSliceListDelete {
    fn recycle(self: Box<Self>) {
        self.tracker.wait_for_completion();
        if let Some(slice) = self.slice {
            debug!("recycling retired slice");
            // Dropping the shard's reference; the buffer returns to the
            // allocator once any long-lived holders drop theirs.
            drop(slice);
        }
        drop(self.buffers);
    }
}

/// Bounded blocking queue with one consumer thread that waits out each
/// item's token tracker and then destroys it. Destruction of a slice
/// releases its blobs and returns its buffer to the allocator.
pub struct Recycler {
    sender: Mutex<Option<Sender<Box<dyn Recyclable>>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Recycler {
    fn default() -> Self {
        Self::new()
    }
}

impl Recycler {
    /// Starts the consumer thread.
    pub fn new() -> Self {
        let (sender, receiver) = bounded::<Box<dyn Recyclable>>(RECYCLER_QUEUE_CAPACITY);
        let consumer = std::thread::Builder::new()
            .name("recycler".to_string())
            .spawn(move || {
                // recv fails once the queue is closed and drained.
                while let Ok(item) = receiver.recv() {
                    item.recycle();
                }
                debug!("recycler drained");
            })
            .expect("failed to spawn recycler thread");
        Recycler {
            sender: Mutex::new(Some(sender)),
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Hands a resource to the consumer. Scheduling after shutdown is a
    /// programming error and panics.
    pub fn schedule(&self, item: Box<dyn Recyclable>) {
        let sender = self.sender.lock();
        sender
            .as_ref()
            .expect("schedule on a shut-down recycler")
            .send(item)
            .expect("recycler queue disconnected");
    }

    /// Closes the queue and joins the consumer after it drains the
    /// remaining items. Idempotent. Outstanding tokens must be able to
    /// drain (shut the token manager down first), or pending trackers
    /// will never complete.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        if let Some(consumer) = self.consumer.lock().take() {
            consumer.join().expect("recycler thread panicked");
        }
    }
}

impl Drop for Recycler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
