pub mod document;
pub mod handle;
pub mod doc_map;
pub mod cache;
pub mod histogram;
pub mod ingestor;
pub mod parallel;
