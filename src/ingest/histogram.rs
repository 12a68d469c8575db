use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Distribution of per-document posting counts, fed on every add. Used
/// for shard-boundary tuning and capacity planning.
#[derive(Default)]
pub struct PostingHistogram {
    buckets: Mutex<BTreeMap<usize, u64>>,
    total_postings: AtomicU64,
    document_count: AtomicU64,
}

impl PostingHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, posting_count: usize) {
        *self.buckets.lock().entry(posting_count).or_insert(0) += 1;
        self.total_postings.fetch_add(posting_count as u64, Ordering::AcqRel);
        self.document_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn document_count(&self) -> u64 {
        self.document_count.load(Ordering::Acquire)
    }

    pub fn posting_count(&self) -> u64 {
        self.total_postings.load(Ordering::Acquire)
    }

    /// (posting count, documents with that count), ascending.
    pub fn snapshot(&self) -> Vec<(usize, u64)> {
        self.buckets.lock().iter().map(|(&count, &documents)| (count, documents)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_distribution() {
        let histogram = PostingHistogram::new();
        histogram.record(5);
        histogram.record(5);
        histogram.record(9);

        assert_eq!(histogram.document_count(), 3);
        assert_eq!(histogram.posting_count(), 19);
        assert_eq!(histogram.snapshot(), vec![(5, 2), (9, 1)]);
    }
}
