use std::collections::{HashSet, VecDeque};

use crate::core::error::Result;
use crate::index::term::{StreamId, Term, MAX_GRAM_SIZE};
use crate::ingest::handle::DocumentHandle;

/// A source of postings for one document. The ingestor routes by
/// `posting_count` and then calls `ingest` with the column handle.
pub trait DocumentSource: Send + Sync {
    /// Number of unique postings this document contributes. Determines
    /// which shard holds the document.
    fn posting_count(&self) -> usize;

    /// Writes the document's content through the handle: postings,
    /// facts, and blobs.
    fn ingest(&self, handle: &DocumentHandle) -> Result<()>;
}

/// Accumulates the unique postings of one document from term streams.
///
/// Terms arrive through open_stream / add_term / close_stream. A ring
/// of the last max-gram-size terms generates phrase postings: whenever
/// the ring is full, every n-gram anchored at the ring's front is
/// emitted (unigram through max-gram) and the front is popped; closing
/// the stream drains the ring the same way. Postings are deduplicated
/// on (raw hash, stream, gram size).
pub struct Document {
    max_gram_size: usize,
    ring: VecDeque<Term>,
    stream: Option<StreamId>,
    postings: HashSet<Term>,
}

impl Document {
    pub fn new(max_gram_size: usize) -> Self {
        assert!(
            max_gram_size >= 1 && max_gram_size <= MAX_GRAM_SIZE as usize,
            "max gram size must be in 1..={MAX_GRAM_SIZE}"
        );
        Document {
            max_gram_size,
            ring: VecDeque::with_capacity(max_gram_size),
            stream: None,
            postings: HashSet::new(),
        }
    }

    /// Opens a stream for term additions. Only one stream may be open
    /// at a time.
    pub fn open_stream(&mut self, id: StreamId) {
        assert!(self.stream.is_none(), "a stream is already open");
        self.stream = Some(id);
        self.ring.clear();
    }

    /// Adds the next term of the open stream.
    pub fn add_term(&mut self, text: &str) {
        let stream = self.stream.expect("add_term with no open stream");
        self.ring.push_back(Term::new(text, stream));
        if self.ring.len() == self.max_gram_size {
            self.emit_front_ngrams();
            self.ring.pop_front();
        }
    }

    /// Closes the open stream, draining the remaining n-grams.
    pub fn close_stream(&mut self) {
        assert!(self.stream.is_some(), "close_stream with no open stream");
        self.stream = None;
        while !self.ring.is_empty() {
            self.emit_front_ngrams();
            self.ring.pop_front();
        }
    }

    /// Emits every n-gram anchored at the ring's front: the front
    /// unigram, then each extension by the following terms.
    fn emit_front_ngrams(&mut self) {
        let mut term = self.ring[0];
        self.postings.insert(term);
        for i in 1..self.ring.len() {
            term.combine(&self.ring[i]);
            self.postings.insert(term);
        }
    }

    /// The deduplicated postings accumulated so far.
    pub fn postings(&self) -> &HashSet<Term> {
        &self.postings
    }
}

impl DocumentSource for Document {
    fn posting_count(&self) -> usize {
        self.postings.len()
    }

    fn ingest(&self, handle: &DocumentHandle) -> Result<()> {
        for term in &self.postings {
            handle.add_posting(term);
        }
        Ok(())
    }
}
