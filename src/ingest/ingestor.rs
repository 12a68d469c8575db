use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use roaring::RoaringTreemap;
use tracing::{info, warn};

use crate::core::config::ShardDefinition;
use crate::core::error::{Error, Result};
use crate::core::stats::IndexStats;
use crate::core::types::{DocId, GroupId, ShardId};
use crate::index::term_table::{FactHandle, TermTableCollection};
use crate::ingest::cache::DocumentCache;
use crate::ingest::doc_map::DocumentMap;
use crate::ingest::document::DocumentSource;
use crate::ingest::handle::DocumentHandle;
use crate::ingest::histogram::PostingHistogram;
use crate::memory::block_pool::SliceBufferAllocator;
use crate::mvcc::recycler::Recycler;
use crate::mvcc::token::TokenManager;
use crate::storage::schema::DocDataSchema;
use crate::storage::shard::Shard;

#[derive(Default)]
struct GroupState {
    current: Option<GroupId>,
    members: HashMap<GroupId, RoaringTreemap>,
}

/// Top-level ingestion entry point: owns the shards, the doc-id map,
/// the optional document cache, the recycler, and the token manager.
/// All public methods are thread safe.
pub struct Ingestor {
    shards: Vec<Arc<Shard>>,
    shard_definition: ShardDefinition,
    doc_map: DocumentMap,
    cache: Option<DocumentCache>,
    histogram: PostingHistogram,
    recycler: Arc<Recycler>,
    tokens: TokenManager,
    allocator: Arc<SliceBufferAllocator>,
    /// Serializes deletes: two deletes of the same id would otherwise
    /// race on the slice's expired counter.
    delete_lock: Mutex<()>,
    groups: Mutex<GroupState>,
    shut_down: AtomicBool,
}

impl Ingestor {
    pub fn new(
        schema: DocDataSchema,
        term_tables: TermTableCollection,
        shard_definition: ShardDefinition,
        allocator: Arc<SliceBufferAllocator>,
        cache_documents: bool,
    ) -> Result<Arc<Ingestor>> {
        assert_eq!(
            term_tables.shard_count(),
            shard_definition.shard_count(),
            "one sealed term table per shard"
        );
        let recycler = Arc::new(Recycler::new());
        let tokens = TokenManager::new();
        let mut shards = Vec::with_capacity(shard_definition.shard_count());
        for shard_id in 0..shard_definition.shard_count() {
            shards.push(Shard::new(
                shard_id,
                term_tables.get(shard_id).clone(),
                schema.clone(),
                allocator.clone(),
                recycler.clone(),
                tokens.clone(),
            )?);
        }
        info!(shards = shards.len(), "created ingestor");
        Ok(Arc::new(Ingestor {
            shards,
            shard_definition,
            doc_map: DocumentMap::new(),
            cache: cache_documents.then(DocumentCache::new),
            histogram: PostingHistogram::new(),
            recycler,
            tokens,
            allocator,
            delete_lock: Mutex::new(()),
            groups: Mutex::new(GroupState::default()),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Ingests one document: routes it by posting count, allocates a
    /// column, writes its postings, makes the column visible, commits
    /// it, and registers the id. A duplicate id rolls the column back
    /// and surfaces `DuplicateDocId`.
    pub fn add(&self, id: DocId, document: &dyn DocumentSource) -> Result<()> {
        let posting_count = document.posting_count();
        self.histogram.record(posting_count);
        let shard = &self.shards[self.shard_definition.route(posting_count)];
        let handle = shard.allocate_document(id)?;

        if let Err(error) = document.ingest(&handle) {
            warn!(id = id.0, %error, "document ingest failed, expiring column");
            handle.slice().commit_document();
            handle.expire();
            return Err(error);
        }

        // Bit writes above complete before the soft-deleted bit is
        // cleared, so a query that sees the column sees every posting.
        handle.activate();
        handle.slice().commit_document();

        if let Err(error) = self.doc_map.add(id, handle.clone()) {
            warn!(id = id.0, "duplicate document id, rolling column back");
            handle.expire();
            return Err(error);
        }

        let mut groups = self.groups.lock();
        if let Some(group) = groups.current {
            groups.members.entry(group).or_default().insert(id.0);
        }
        Ok(())
    }

    /// `add`, then retain the document in the cache (when enabled) so
    /// it stays queryable by id.
    pub fn add_cached(&self, id: DocId, document: Arc<dyn DocumentSource>) -> Result<()> {
        self.add(id, document.as_ref())?;
        if let Some(cache) = &self.cache {
            cache.add(id, document);
        }
        Ok(())
    }

    /// Removes a document from serving. The column becomes invisible
    /// to queries immediately, even though its storage is reclaimed
    /// later. Deleting an unknown id is not an error and returns false.
    pub fn delete(&self, id: DocId) -> Result<bool> {
        // The token pins the slice against recycling for the duration
        // of the expiry.
        let _token = self.tokens.request_token()?;
        let _guard = self.delete_lock.lock();
        match self.doc_map.find(id) {
            Some(handle) => {
                self.doc_map.delete(id);
                handle.expire();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Sets or clears a fact about a live document.
    pub fn assert_fact(&self, id: DocId, fact: FactHandle, value: bool) -> Result<()> {
        self.get_handle(id)?.assert_fact(fact, value);
        Ok(())
    }

    /// True iff `id` is currently visible to queries.
    pub fn contains(&self, id: DocId) -> bool {
        self.doc_map.find(id).is_some()
    }

    pub fn get_handle(&self, id: DocId) -> Result<DocumentHandle> {
        self.doc_map.find(id).ok_or(Error::DocIdNotFound(id))
    }

    //
    // Group management. A group is the set of documents ingested
    // between open_group and the next open_group/close_group; expiring
    // it expires every column it contains.
    //

    pub fn open_group(&self, group: GroupId) {
        let mut groups = self.groups.lock();
        groups.current = Some(group);
        groups.members.entry(group).or_default();
    }

    pub fn close_group(&self) {
        self.groups.lock().current = None;
    }

    pub fn expire_group(&self, group: GroupId) -> Result<()> {
        let members = {
            let mut groups = self.groups.lock();
            if groups.current == Some(group) {
                groups.current = None;
            }
            groups.members.remove(&group)
        };
        if let Some(members) = members {
            for id in members.iter() {
                self.delete(DocId(id))?;
            }
        }
        Ok(())
    }

    /// Drains the token manager, then the recycler. In-flight adds
    /// complete; new tokens are refused. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down ingestor");
        // Tokens first: pending recyclables cannot complete while
        // their tracked tokens are outstanding.
        self.tokens.shutdown();
        self.recycler.shutdown();
    }

    //
    // Accessors.
    //

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn get_shard(&self, shard: ShardId) -> &Arc<Shard> {
        &self.shards[shard]
    }

    pub fn document_count(&self) -> usize {
        self.doc_map.len()
    }

    pub fn document_cache(&self) -> Option<&DocumentCache> {
        self.cache.as_ref()
    }

    pub fn histogram(&self) -> &PostingHistogram {
        &self.histogram
    }

    pub fn token_manager(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn allocator(&self) -> &Arc<SliceBufferAllocator> {
        &self.allocator
    }

    pub fn used_capacity_in_bytes(&self) -> usize {
        self.shards.iter().map(|shard| shard.used_capacity_in_bytes()).sum()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            document_count: self.doc_map.len() as u64,
            posting_count: self.histogram.posting_count(),
            shard_count: self.shards.len(),
            slice_count: self.shards.iter().map(|shard| shard.slice_count()).sum(),
            buffers_in_use: self.allocator.in_use_count(),
        }
    }
}

impl Drop for Ingestor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SYSTEM_ROW_COUNT;
    use crate::index::row_id::RowId;
    use crate::index::term::Term;
    use crate::index::term_table::{FactHandle, TermTable};
    use crate::ingest::document::Document;
    use crate::storage::schema::VariableBlobId;
    use std::collections::HashSet;

    fn primes_below(limit: u64) -> Vec<u64> {
        let mut primes: Vec<u64> = Vec::new();
        for candidate in 2..limit {
            if primes.iter().all(|p| candidate % p != 0) {
                primes.push(candidate);
            }
        }
        primes
    }

    /// One explicit rank-0 row per prime, in sieve order after the
    /// system rows.
    fn prime_factors_term_table(max_doc: u64) -> Arc<TermTable> {
        let mut table = TermTable::new();
        let mut next_row = SYSTEM_ROW_COUNT;
        for prime in primes_below(max_doc + 1) {
            table.open_term();
            table.add_row_id(RowId::new(0, next_row));
            next_row += 1;
            table.close_term(Term::compute_raw_hash(&prime.to_string()));
        }
        table.set_row_counts(0, next_row, 0);
        table.seal();
        Arc::new(table)
    }

    fn prime_row(max_doc: u64, prime: u64) -> RowId {
        let position = primes_below(max_doc + 1).iter().position(|&p| p == prime).unwrap();
        RowId::new(0, SYSTEM_ROW_COUNT + position)
    }

    fn prime_factors_document(mut value: u64) -> Document {
        let mut document = Document::new(1);
        document.open_stream(0);
        for prime in primes_below(value + 1) {
            while value % prime == 0 {
                document.add_term(&prime.to_string());
                value /= prime;
            }
        }
        document.close_stream();
        document
    }

    fn single_shard_ingestor(
        term_table: Arc<TermTable>,
        schema: DocDataSchema,
        block_size: usize,
        block_count: usize,
    ) -> Arc<Ingestor> {
        Ingestor::new(
            schema,
            TermTableCollection::new(vec![term_table]),
            ShardDefinition::new(Vec::new()),
            Arc::new(SliceBufferAllocator::new(block_size, block_count)),
            false,
        )
        .unwrap()
    }

    /// Documents visible to a query for all of `rows`: the column bit
    /// is set in every required row and the soft-deleted bit is clear.
    fn matching_docs(ingestor: &Ingestor, ids: impl Iterator<Item = u64>, rows: &[RowId]) -> HashSet<u64> {
        let soft_deleted = ingestor.get_shard(0).term_table().soft_deleted_row();
        ids.filter(|&id| {
            let handle = match ingestor.get_handle(DocId(id)) {
                Ok(handle) => handle,
                Err(_) => return false,
            };
            !handle.get_bit(soft_deleted) && rows.iter().all(|&row| handle.get_bit(row))
        })
        .collect()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_prime_factors_corpus() {
        const MAX_DOC: u64 = 64;
        let ingestor =
            single_shard_ingestor(prime_factors_term_table(MAX_DOC), DocDataSchema::new(), 4096, 2);

        for id in 2..=MAX_DOC {
            let document = prime_factors_document(id);
            ingestor.add(DocId(id), &document).unwrap();
        }

        // Column bits equal divisibility.
        for prime in primes_below(MAX_DOC + 1) {
            let row = prime_row(MAX_DOC, prime);
            for id in 2..=MAX_DOC {
                let handle = ingestor.get_handle(DocId(id)).unwrap();
                assert_eq!(handle.get_bit(row), id % prime == 0, "doc {id}, prime {prime}");
            }
        }

        // Single-term query: {2} matches the even documents.
        let evens = matching_docs(&ingestor, 2..=MAX_DOC, &[prime_row(MAX_DOC, 2)]);
        assert_eq!(evens, (2..=MAX_DOC).filter(|id| id % 2 == 0).collect());

        // Conjunctive query: {2, 3} matches multiples of six.
        let sixes = matching_docs(
            &ingestor,
            2..=MAX_DOC,
            &[prime_row(MAX_DOC, 2), prime_row(MAX_DOC, 3)],
        );
        assert_eq!(sixes, HashSet::from([6, 12, 18, 24, 30, 36, 42, 48, 54, 60]));

        // Every live column matches the match-all row.
        let all = matching_docs(&ingestor, 2..=MAX_DOC, &[RowId::new(0, 1)]);
        assert_eq!(all.len(), 63);
    }

    #[test]
    fn test_soft_delete() {
        let ingestor =
            single_shard_ingestor(prime_factors_term_table(64), DocDataSchema::new(), 4096, 2);
        ingestor.add(DocId(42), &prime_factors_document(42)).unwrap();

        let soft_deleted = ingestor.get_shard(0).term_table().soft_deleted_row();
        let handle = ingestor.get_handle(DocId(42)).unwrap();
        assert!(ingestor.contains(DocId(42)));
        assert!(!handle.get_bit(soft_deleted));

        assert!(ingestor.delete(DocId(42)).unwrap());
        // Invisible immediately, before any recycling happens.
        assert!(!ingestor.contains(DocId(42)));
        assert!(handle.get_bit(soft_deleted));

        // Deleting an unknown id is silent.
        assert!(!ingestor.delete(DocId(42)).unwrap());
        assert!(!ingestor.delete(DocId(77)).unwrap());
    }

    #[test]
    fn test_duplicate_add_is_rolled_back() {
        let ingestor =
            single_shard_ingestor(prime_factors_term_table(64), DocDataSchema::new(), 4096, 2);
        ingestor.add(DocId(7), &prime_factors_document(7)).unwrap();
        let result = ingestor.add(DocId(7), &prime_factors_document(14));
        assert!(matches!(result, Err(Error::DuplicateDocId(DocId(7)))));

        // The original document is untouched and the index stays
        // consistent.
        assert!(ingestor.contains(DocId(7)));
        assert_eq!(ingestor.document_count(), 1);
        let handle = ingestor.get_handle(DocId(7)).unwrap();
        assert!(handle.get_bit(prime_row(64, 7)));
    }

    #[test]
    fn test_fill_and_recycle_four_blocks() {
        let mut table = TermTable::new();
        table.set_row_counts(0, SYSTEM_ROW_COUNT, 0);
        table.seal();
        let ingestor = single_shard_ingestor(Arc::new(table), DocDataSchema::new(), 1024, 4);
        let capacity = ingestor.get_shard(0).slice_capacity();

        let empty = Document::new(1);
        for id in 0..(4 * capacity as u64) {
            ingestor.add(DocId(id), &empty).unwrap();
        }
        assert_eq!(ingestor.allocator().in_use_count(), 4);
        // A fifth slice cannot be created.
        assert!(matches!(
            ingestor.add(DocId(1_000_000), &empty),
            Err(Error::PoolExhausted)
        ));

        for id in 0..(4 * capacity as u64) {
            assert!(ingestor.delete(DocId(id)).unwrap());
        }
        wait_until(|| ingestor.allocator().in_use_count() == 0);

        // The pool serves a fresh round of ingestion.
        for id in 0..capacity as u64 {
            ingestor.add(DocId(id), &empty).unwrap();
        }
        assert_eq!(ingestor.document_count(), capacity);
    }

    #[test]
    fn test_token_protects_reader_snapshot() {
        let ingestor = single_shard_ingestor(
            prime_factors_term_table(64),
            DocDataSchema::new(),
            4096,
            3,
        );
        let shard = ingestor.get_shard(0).clone();
        let capacity = shard.slice_capacity();

        for id in 0..capacity as u64 {
            ingestor.add(DocId(id + 2), &prime_factors_document(id + 2)).unwrap();
        }

        let token = ingestor.token_manager().request_token().unwrap();
        let snapshot = shard.slice_buffers(&token);
        assert_eq!(snapshot.len(), 1);
        let match_all = shard.term_table().match_all_row();

        std::thread::scope(|scope| {
            let writer_ingestor = &ingestor;
            scope
                .spawn(move || {
                    // Expire every column, retiring the slice and
                    // swapping the buffer vector.
                    for id in 0..capacity as u64 {
                        writer_ingestor.delete(DocId(id + 2)).unwrap();
                    }
                })
                .join()
                .unwrap();

            // The snapshot is still readable after the swap.
            let slice = unsafe { snapshot[0].slice() };
            for column in 0..capacity {
                assert!(slice.row_table(0).get_bit(slice.buffer(), match_all.index(), column));
            }
            assert_eq!(ingestor.allocator().in_use_count(), 1);
        });

        drop(token);
        wait_until(|| ingestor.allocator().in_use_count() == 0);
    }

    struct SyntheticDocument {
        postings: usize,
    }

    impl DocumentSource for SyntheticDocument {
        fn posting_count(&self) -> usize {
            self.postings
        }

        fn ingest(&self, _handle: &DocumentHandle) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_routing_across_shards() {
        let tables: Vec<Arc<TermTable>> = (0..3)
            .map(|_| {
                let mut table = TermTable::new();
                table.set_row_counts(0, SYSTEM_ROW_COUNT, 0);
                table.seal();
                Arc::new(table)
            })
            .collect();
        let ingestor = Ingestor::new(
            DocDataSchema::new(),
            TermTableCollection::new(tables),
            ShardDefinition::new(vec![1000, 2000]),
            Arc::new(SliceBufferAllocator::new(4096, 6)),
            false,
        )
        .unwrap();
        assert_eq!(ingestor.shard_count(), 3);

        ingestor.add(DocId(1), &SyntheticDocument { postings: 500 }).unwrap();
        ingestor.add(DocId(2), &SyntheticDocument { postings: 1500 }).unwrap();
        ingestor.add(DocId(3), &SyntheticDocument { postings: 5000 }).unwrap();

        assert_eq!(ingestor.get_shard(0).slice_count(), 1);
        assert_eq!(ingestor.get_shard(1).slice_count(), 1);
        assert_eq!(ingestor.get_shard(2).slice_count(), 1);
        assert_eq!(ingestor.histogram().document_count(), 3);
    }

    #[test]
    fn test_group_expiry() {
        let ingestor =
            single_shard_ingestor(prime_factors_term_table(64), DocDataSchema::new(), 4096, 2);

        ingestor.open_group(1);
        for id in [2u64, 3, 4] {
            ingestor.add(DocId(id), &prime_factors_document(id)).unwrap();
        }
        ingestor.open_group(2);
        for id in [5u64, 6] {
            ingestor.add(DocId(id), &prime_factors_document(id)).unwrap();
        }
        ingestor.close_group();

        ingestor.expire_group(1).unwrap();
        for id in [2u64, 3, 4] {
            assert!(!ingestor.contains(DocId(id)));
        }
        for id in [5u64, 6] {
            assert!(ingestor.contains(DocId(id)));
        }

        // Expiring an unknown group is silent.
        ingestor.expire_group(9).unwrap();
    }

    struct FactAndBlobDocument {
        fact: FactHandle,
        blob: VariableBlobId,
    }

    impl DocumentSource for FactAndBlobDocument {
        fn posting_count(&self) -> usize {
            1
        }

        fn ingest(&self, handle: &DocumentHandle) -> Result<()> {
            handle.assert_fact(self.fact, true);
            handle.allocate_variable_blob(self.blob, 4)?.copy_from_slice(&[9, 8, 7, 6]);
            Ok(())
        }
    }

    #[test]
    fn test_facts_and_blobs_through_ingestion() {
        let mut schema = DocDataSchema::new();
        let blob = schema.register_variable_blob();
        let mut table = TermTable::new();
        table.set_row_counts(0, SYSTEM_ROW_COUNT, 0);
        let fact = table.add_fact_row(0);
        table.seal();

        let ingestor = single_shard_ingestor(Arc::new(table), schema, 4096, 2);
        ingestor.add(DocId(11), &FactAndBlobDocument { fact, blob }).unwrap();

        let handle = ingestor.get_handle(DocId(11)).unwrap();
        let fact_row = handle.slice().term_table().fact_row_id(fact);
        assert!(handle.get_bit(fact_row));
        assert_eq!(handle.variable_blob(blob).unwrap(), &[9, 8, 7, 6]);
        assert_eq!(handle.doc_id(), DocId(11));

        // Clearing the fact works through the same surface.
        handle.assert_fact(fact, false);
        assert!(!handle.get_bit(fact_row));
    }

    #[test]
    fn test_document_cache_round_trip() {
        let table = prime_factors_term_table(64);
        let ingestor = Ingestor::new(
            DocDataSchema::new(),
            TermTableCollection::new(vec![table]),
            ShardDefinition::new(Vec::new()),
            Arc::new(SliceBufferAllocator::new(4096, 2)),
            true,
        )
        .unwrap();

        ingestor.add_cached(DocId(6), Arc::new(prime_factors_document(6))).unwrap();
        ingestor.add_cached(DocId(10), Arc::new(prime_factors_document(10))).unwrap();

        let cache = ingestor.document_cache().unwrap();
        let cached: Vec<DocId> = cache.iter().map(|(id, _)| id).collect();
        assert_eq!(cached, vec![DocId(10), DocId(6)]);
        let (_, document) = cache.iter().next().unwrap();
        assert_eq!(document.posting_count(), 2); // 10 = 2 * 5
    }

    #[test]
    fn test_shutdown_refuses_deletes_and_is_idempotent() {
        let ingestor =
            single_shard_ingestor(prime_factors_term_table(64), DocDataSchema::new(), 4096, 2);
        ingestor.add(DocId(2), &prime_factors_document(2)).unwrap();
        ingestor.shutdown();
        assert!(matches!(ingestor.delete(DocId(2)), Err(Error::ShutDown)));
        ingestor.shutdown();
    }

    #[test]
    fn test_concurrent_ingestion_threads() {
        let ingestor =
            single_shard_ingestor(prime_factors_term_table(64), DocDataSchema::new(), 8192, 8);

        std::thread::scope(|scope| {
            for worker in 0..4u64 {
                let ingestor = &ingestor;
                scope.spawn(move || {
                    for i in 0..200u64 {
                        let id = 1000 * worker + i;
                        let document = prime_factors_document(2 + (id % 63));
                        ingestor.add(DocId(id), &document).unwrap();
                    }
                });
            }
        });

        assert_eq!(ingestor.document_count(), 800);
        // Every ingested document is visible and carries its own id.
        for id in [0u64, 999, 1001, 3199] {
            if let Ok(handle) = ingestor.get_handle(DocId(id)) {
                assert_eq!(handle.doc_id(), DocId(id));
            }
        }
    }
}
