use serde::{Serialize, Deserialize};

use crate::core::error::{Error, Result};
use crate::core::types::{ShardId, MAX_SHARD_ID};
use crate::index::term::MAX_GRAM_SIZE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Largest phrase length emitted during ingestion.
    pub max_gram_size: usize,
    /// Posting-count upper bounds of all shards but the last; the last
    /// shard is unbounded.
    pub shard_posting_bounds: Vec<usize>,
    /// Byte size of every slice buffer.
    pub slice_buffer_bytes: usize,
    /// Number of slice buffers pre-allocated by the block pool.
    pub slice_buffer_count: usize,
    /// Keep ingested documents in the in-memory document cache.
    pub cache_documents: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            max_gram_size: 2,
            shard_posting_bounds: Vec::new(),      // single unbounded shard
            slice_buffer_bytes: 1 << 20,           // 1MB per slice
            slice_buffer_count: 64,
            cache_documents: false,
        }
    }
}

impl IndexConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: IndexConfig = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_gram_size == 0 || self.max_gram_size > MAX_GRAM_SIZE as usize {
            return Err(Error::InvalidConfig(format!(
                "max_gram_size must be in 1..={}", MAX_GRAM_SIZE)));
        }
        if self.slice_buffer_count == 0 {
            return Err(Error::InvalidConfig("slice_buffer_count must be nonzero".to_string()));
        }
        if !self.shard_posting_bounds.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::InvalidConfig(
                "shard_posting_bounds must be strictly increasing".to_string()));
        }
        if self.shard_posting_bounds.len() + 1 > MAX_SHARD_ID + 1 {
            return Err(Error::InvalidConfig(format!(
                "at most {} shards supported", MAX_SHARD_ID + 1)));
        }
        Ok(())
    }

    pub fn shard_definition(&self) -> ShardDefinition {
        ShardDefinition::new(self.shard_posting_bounds.clone())
    }
}

/// A sorted sequence of posting-count upper bounds. A document routes
/// to the first shard whose bound is at least its posting count; the
/// final shard is always unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDefinition {
    bounds: Vec<usize>,
}

impl ShardDefinition {
    pub fn new(mut bounds: Vec<usize>) -> Self {
        assert!(
            bounds.windows(2).all(|w| w[0] < w[1]),
            "shard bounds must be strictly increasing"
        );
        if bounds.last() != Some(&usize::MAX) {
            bounds.push(usize::MAX);
        }
        assert!(bounds.len() <= MAX_SHARD_ID + 1, "too many shards");
        ShardDefinition { bounds }
    }

    pub fn shard_count(&self) -> usize {
        self.bounds.len()
    }

    pub fn route(&self, posting_count: usize) -> ShardId {
        self.bounds
            .iter()
            .position(|&bound| posting_count <= bound)
            .expect("final shard bound is unbounded")
    }

    pub fn max_postings(&self, shard: ShardId) -> usize {
        self.bounds[shard]
    }
}
