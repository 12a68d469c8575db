use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::types::DocId;
use crate::ingest::document::DocumentSource;

struct CacheNode {
    id: DocId,
    document: Arc<dyn DocumentSource>,
    next: *mut CacheNode,
}

/// Keeps ingested documents reachable by walking a prepend-only list.
/// Writers prepend under a mutex; readers snapshot the atomic head and
/// walk without locks. Nodes are never unlinked while the cache lives,
/// so an iterator stays valid in the presence of concurrent writers.
pub struct DocumentCache {
    head: AtomicPtr<CacheNode>,
    write_lock: Mutex<()>,
}

unsafe impl Send for DocumentCache {}
unsafe impl Sync for DocumentCache {}

impl Default for DocumentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentCache {
    pub fn new() -> Self {
        DocumentCache {
            head: AtomicPtr::new(std::ptr::null_mut()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn add(&self, id: DocId, document: Arc<dyn DocumentSource>) {
        let _guard = self.write_lock.lock();
        let node = Box::into_raw(Box::new(CacheNode {
            id,
            document,
            next: self.head.load(Ordering::Relaxed),
        }));
        self.head.store(node, Ordering::Release);
    }

    /// Walks the cache from most recently added to oldest.
    pub fn iter(&self) -> CacheIter<'_> {
        CacheIter { next: self.head.load(Ordering::Acquire), _cache: self }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Drop for DocumentCache {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}

pub struct CacheIter<'a> {
    next: *mut CacheNode,
    _cache: &'a DocumentCache,
}

impl<'a> Iterator for CacheIter<'a> {
    type Item = (DocId, Arc<dyn DocumentSource>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        let node = unsafe { &*self.next };
        self.next = node.next;
        Some((node.id, node.document.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::document::Document;

    fn cached_document(text: &str) -> Arc<dyn DocumentSource> {
        let mut document = Document::new(1);
        document.open_stream(0);
        document.add_term(text);
        document.close_stream();
        Arc::new(document)
    }

    #[test]
    fn test_newest_first_iteration() {
        let cache = DocumentCache::new();
        assert!(cache.is_empty());
        cache.add(DocId(1), cached_document("one"));
        cache.add(DocId(2), cached_document("two"));
        cache.add(DocId(3), cached_document("three"));

        let ids: Vec<DocId> = cache.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![DocId(3), DocId(2), DocId(1)]);
    }

    #[test]
    fn test_iterator_survives_concurrent_prepends() {
        let cache = DocumentCache::new();
        cache.add(DocId(1), cached_document("one"));

        let mut iter = cache.iter();
        // A writer prepends while the reader holds its snapshot.
        cache.add(DocId(2), cached_document("two"));

        // The snapshot walks the list as of iterator creation.
        assert_eq!(iter.next().unwrap().0, DocId(1));
        assert!(iter.next().is_none());
        assert_eq!(cache.len(), 2);
    }
}
