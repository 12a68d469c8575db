use std::collections::HashMap;

use parking_lot::Mutex;

use crate::core::error::{Error, Result};
use crate::core::types::DocId;
use crate::ingest::handle::DocumentHandle;

/// Maps live document ids to their column handles. Lookups clone the
/// handle out so no reference survives a concurrent delete.
#[derive(Default)]
pub struct DocumentMap {
    entries: Mutex<HashMap<DocId, DocumentHandle>>,
}

impl DocumentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle under `id`. Duplicate ids are rejected.
    pub fn add(&self, id: DocId, handle: DocumentHandle) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(Error::DuplicateDocId(id));
        }
        entries.insert(id, handle);
        Ok(())
    }

    pub fn find(&self, id: DocId) -> Option<DocumentHandle> {
        self.entries.lock().get(&id).cloned()
    }

    /// Removes the entry for `id`; returns false if there was none.
    pub fn delete(&self, id: DocId) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
