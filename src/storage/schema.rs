use serde::{Serialize, Deserialize};

/// Identifier of a variable-size per-document blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableBlobId(pub usize);

/// Identifier of a fixed-size per-document blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedBlobId(pub usize);

/// Describes the per-document payload stored in every doc table:
/// how many variable-size blobs each column carries and the byte sizes
/// of its fixed blobs. Ids are handed out sequentially.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocDataSchema {
    variable_blob_count: usize,
    fixed_blob_sizes: Vec<usize>,
}

impl DocDataSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_variable_blob(&mut self) -> VariableBlobId {
        let id = VariableBlobId(self.variable_blob_count);
        self.variable_blob_count += 1;
        id
    }

    pub fn register_fixed_blob(&mut self, byte_count: usize) -> FixedBlobId {
        assert!(byte_count > 0, "fixed blob must have a nonzero size");
        let id = FixedBlobId(self.fixed_blob_sizes.len());
        self.fixed_blob_sizes.push(byte_count);
        id
    }

    pub fn variable_blob_count(&self) -> usize {
        self.variable_blob_count
    }

    pub fn fixed_blob_sizes(&self) -> &[usize] {
        &self.fixed_blob_sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let mut schema = DocDataSchema::new();
        assert_eq!(schema.register_variable_blob(), VariableBlobId(0));
        assert_eq!(schema.register_variable_blob(), VariableBlobId(1));
        assert_eq!(schema.register_fixed_blob(4), FixedBlobId(0));
        assert_eq!(schema.register_fixed_blob(16), FixedBlobId(1));
        assert_eq!(schema.variable_blob_count(), 2);
        assert_eq!(schema.fixed_blob_sizes(), &[4, 16]);
    }
}
