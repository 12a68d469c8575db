use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::warn;

use crate::core::error::{Error, Result};
use crate::core::types::DocId;
use crate::ingest::document::DocumentSource;
use crate::ingest::ingestor::Ingestor;

/// Multi-threaded ingestion front-end: a bounded queue of documents
/// drained by a pool of worker threads that call `Ingestor::add`.
/// Failed adds are counted and logged rather than aborting the batch.
pub struct ParallelIngester {
    sender: Option<Sender<(DocId, Box<dyn DocumentSource>)>>,
    workers: Vec<JoinHandle<()>>,
    failed: Arc<AtomicU64>,
}

impl ParallelIngester {
    const QUEUE_CAPACITY: usize = 1000;

    /// Spawns `worker_count` workers (0 = one per CPU).
    pub fn new(ingestor: Arc<Ingestor>, worker_count: usize) -> Self {
        let worker_count = if worker_count == 0 { num_cpus::get() } else { worker_count };
        let (sender, receiver) = bounded(Self::QUEUE_CAPACITY);
        let failed = Arc::new(AtomicU64::new(0));
        let workers = (0..worker_count)
            .map(|worker| {
                let receiver: Receiver<(DocId, Box<dyn DocumentSource>)> = receiver.clone();
                let ingestor = ingestor.clone();
                let failed = failed.clone();
                std::thread::Builder::new()
                    .name(format!("ingest-{worker}"))
                    .spawn(move || {
                        while let Ok((id, document)) = receiver.recv() {
                            if let Err(error) = ingestor.add(id, document.as_ref()) {
                                warn!(id = id.0, %error, "parallel add failed");
                                failed.fetch_add(1, Ordering::AcqRel);
                            }
                        }
                    })
                    .expect("failed to spawn ingestion worker")
            })
            .collect();
        ParallelIngester { sender: Some(sender), workers, failed }
    }

    /// Queues one document, blocking while the queue is full.
    pub fn queue(&self, id: DocId, document: Box<dyn DocumentSource>) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or(Error::ShutDown)?
            .send((id, document))
            .map_err(|_| Error::ShutDown)
    }

    /// Closes the queue, waits for the workers to drain it, and
    /// returns the number of failed adds.
    pub fn finish(mut self) -> u64 {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            worker.join().expect("ingestion worker panicked");
        }
        self.failed.load(Ordering::Acquire)
    }
}

impl Drop for ParallelIngester {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            worker.join().expect("ingestion worker panicked");
        }
    }
}
