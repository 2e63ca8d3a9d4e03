use std::collections::HashMap;

use crate::error::{KuraError, Result};
use crate::storage::record_store::RecordStore;
use crate::types::Recid;

/// In-memory `RecordStore`.
///
/// Reference implementation for tests and throwaway trees; recids start at 1
/// and grow monotonically, so freed ids are never reused.
pub struct MemStore {
    records: HashMap<Recid, Vec<u8>>,
    next_recid: Recid,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            records: HashMap::new(),
            next_recid: 1,
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, recid: Recid) -> bool {
        self.records.contains_key(&recid)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemStore {
    fn insert(&mut self, data: &[u8]) -> Result<Recid> {
        let recid = self.next_recid;
        self.next_recid += 1;
        self.records.insert(recid, data.to_vec());
        Ok(recid)
    }

    fn fetch(&mut self, recid: Recid) -> Result<Vec<u8>> {
        self.records
            .get(&recid)
            .cloned()
            .ok_or(KuraError::RecordNotFound(recid))
    }

    fn update(&mut self, recid: Recid, data: &[u8]) -> Result<()> {
        match self.records.get_mut(&recid) {
            Some(slot) => {
                *slot = data.to_vec();
                Ok(())
            }
            None => Err(KuraError::RecordNotFound(recid)),
        }
    }

    fn delete(&mut self, recid: Recid) -> Result<()> {
        self.records
            .remove(&recid)
            .map(|_| ())
            .ok_or(KuraError::RecordNotFound(recid))
    }

    fn fetch_raw(&mut self, recid: Recid) -> Result<Vec<u8>> {
        self.fetch(recid)
    }

    fn force_insert(&mut self, recid: Recid, data: &[u8]) -> Result<()> {
        self.records.insert(recid, data.to_vec());
        self.next_recid = self.next_recid.max(recid + 1);
        Ok(())
    }
}
