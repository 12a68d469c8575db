use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;
use rayon::prelude::*;
use std::sync::Arc;

use bitsig::core::config::ShardDefinition;
use bitsig::core::types::{DocId, SYSTEM_ROW_COUNT};
use bitsig::index::row_id::RowId;
use bitsig::index::term::Term;
use bitsig::index::term_table::{TermTable, TermTableCollection};
use bitsig::ingest::document::Document;
use bitsig::ingest::ingestor::Ingestor;
use bitsig::memory::block_pool::SliceBufferAllocator;
use bitsig::storage::schema::DocDataSchema;

const VOCABULARY: [&str; 16] = [
    "the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog", "pack", "my", "box", "with",
    "five", "dozen", "liquor", "jugs",
];

/// One explicit rank-0 row per vocabulary word; bigrams fall through to
/// a small adhoc pool.
fn vocabulary_term_table() -> Arc<TermTable> {
    let mut table = TermTable::new();
    let mut next_row = SYSTEM_ROW_COUNT;
    for word in VOCABULARY {
        table.open_term();
        table.add_row_id(RowId::new(0, next_row));
        next_row += 1;
        table.close_term(Term::compute_raw_hash(word));
    }
    table.open_adhoc_term(0);
    table.add_row_id(RowId::new(0, 0));
    table.add_row_id(RowId::new(0, 0));
    table.close_adhoc_term();
    table.set_row_counts(0, next_row, 32);
    table.seal();
    Arc::new(table)
}

fn random_document(word_count: usize) -> Document {
    let mut rng = rand::thread_rng();
    let mut document = Document::new(2);
    document.open_stream(0);
    for _ in 0..word_count {
        document.add_term(VOCABULARY[rng.gen_range(0..VOCABULARY.len())]);
    }
    document.close_stream();
    document
}

fn fresh_ingestor() -> Arc<Ingestor> {
    Ingestor::new(
        DocDataSchema::new(),
        TermTableCollection::new(vec![vocabulary_term_table()]),
        ShardDefinition::new(Vec::new()),
        Arc::new(SliceBufferAllocator::new(1 << 20, 64)),
        false,
    )
    .unwrap()
}

fn bench_single_add(c: &mut Criterion) {
    let mut ingestor = fresh_ingestor();
    let mut id = 0u64;
    c.bench_function("single_document_add", |b| {
        b.iter(|| {
            // Start over before the pool runs out.
            if id == 1_000_000 {
                ingestor = fresh_ingestor();
                id = 0;
            }
            let document = random_document(50);
            ingestor.add(DocId(id), black_box(&document)).unwrap();
            id += 1;
        });
    });
}

fn bench_batch_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_add");
    for batch_size in [100usize, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &batch_size| {
            b.iter_batched(
                || {
                    // Corpus generation stays off the measured path.
                    let documents: Vec<Document> =
                        (0..batch_size).into_par_iter().map(|_| random_document(50)).collect();
                    (fresh_ingestor(), documents)
                },
                |(ingestor, documents)| {
                    for (i, document) in documents.iter().enumerate() {
                        ingestor.add(DocId(i as u64), document).unwrap();
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_delete(c: &mut Criterion) {
    c.bench_function("delete_and_lookup", |b| {
        b.iter_batched(
            || {
                let ingestor = fresh_ingestor();
                for id in 0..1000u64 {
                    ingestor.add(DocId(id), &random_document(20)).unwrap();
                }
                ingestor
            },
            |ingestor| {
                for id in 0..1000u64 {
                    assert!(ingestor.contains(DocId(id)));
                    ingestor.delete(DocId(id)).unwrap();
                }
            },
            criterion::BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_single_add, bench_batch_add, bench_delete);
criterion_main!(benches);
