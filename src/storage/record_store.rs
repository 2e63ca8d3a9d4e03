use crate::error::Result;
use crate::serializer::DefaultSerializer;
use crate::types::Recid;

/// Abstraction over record-oriented storage.
///
/// Records are opaque byte strings keyed by a store-assigned 64-bit recid
/// (zero is reserved for "no record"). Implemented by `MemStore` (in-memory)
/// and `FileStore` (single file). The tree engine never touches disk itself;
/// every persistent effect goes through this trait.
pub trait RecordStore {
    /// Persist a fresh record and return its id.
    fn insert(&mut self, data: &[u8]) -> Result<Recid>;

    /// Load a record.
    fn fetch(&mut self, recid: Recid) -> Result<Vec<u8>>;

    /// Overwrite an existing record.
    fn update(&mut self, recid: Recid, data: &[u8]) -> Result<()>;

    /// Free a record.
    fn delete(&mut self, recid: Recid) -> Result<()>;

    /// Load a record bypassing any cache. Defragmentation reads through this
    /// so it observes exactly the persisted bytes.
    fn fetch_raw(&mut self, recid: Recid) -> Result<Vec<u8>>;

    /// Insert a record under a caller-chosen id, used by defragmentation to
    /// preserve recids when copying between stores.
    fn force_insert(&mut self, recid: Recid, data: &[u8]) -> Result<()>;

    /// Fallback codec for trees without a custom key or value serializer.
    fn default_serializer(&self) -> DefaultSerializer {
        DefaultSerializer
    }
}
