/// Persistent B+Tree over a `RecordStore`.
///
/// `BTree` is the enclosing root object: it owns the tree-wide metadata
/// (height, root recid, entry count) persisted in a small header record,
/// plus the runtime context (capacity, comparator, serializers) the page
/// engine reads. The heavy lifting lives in the submodules: `page` (node
/// layout), `format` (binary page codec), `ops` (recursive algorithms) and
/// `cursor` (leaf-list iteration).
use std::cmp::Ordering;

use tracing::debug;

use crate::error::{KuraError, Result};
use crate::serializer::{DefaultSerializer, Serializer};
use crate::storage::RecordStore;
use crate::types::{Datum, Recid};
use crate::varint::{encode_varint, Reader};

pub mod cursor;
pub mod format;
pub mod ops;
pub mod page;

pub use cursor::Cursor;
pub use format::MAX_INTREE_RECORD_SIZE;
pub use page::{BPage, LeafValue};

/// Default page capacity (slots per page).
pub const DEFAULT_CAPACITY: usize = 32;

const HEADER_VERSION: u8 = 1;

/// Key comparator; when absent, `Datum`'s natural order applies.
pub type Comparator = fn(&Datum, &Datum) -> Ordering;

/// Runtime context the page engine reads on every operation.
pub struct TreeContext {
    capacity: usize,
    comparator: Option<Comparator>,
    key_serializer: Option<Box<dyn Serializer>>,
    value_serializer: Option<Box<dyn Serializer>>,
    load_values: bool,
}

impl TreeContext {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn half(&self) -> usize {
        self.capacity / 2
    }

    pub(crate) fn comparator(&self) -> Option<Comparator> {
        self.comparator
    }

    pub(crate) fn key_serializer(&self) -> Option<&dyn Serializer> {
        self.key_serializer.as_deref()
    }

    pub(crate) fn load_values(&self) -> bool {
        self.load_values
    }

    /// Compare two slot keys; an absent key is the +infinity sentinel and
    /// is greater than any real key.
    pub(crate) fn compare(&self, a: Option<&Datum>, b: Option<&Datum>) -> Ordering {
        match (a, b) {
            (None, _) => Ordering::Greater,
            (_, None) => Ordering::Less,
            (Some(a), Some(b)) => match self.comparator {
                Some(compare) => compare(a, b),
                None => a.cmp(b),
            },
        }
    }

    pub(crate) fn serialize_value(&self, out: &mut Vec<u8>, value: &Datum) -> Result<()> {
        match &self.value_serializer {
            Some(serializer) => serializer.serialize(out, value),
            None => DefaultSerializer.serialize(out, value),
        }
    }

    pub(crate) fn deserialize_value(&self, input: &mut Reader<'_>) -> Result<Datum> {
        match &self.value_serializer {
            Some(serializer) => serializer.deserialize(input),
            None => DefaultSerializer.deserialize(input),
        }
    }
}

/// Tree configuration. Capacity is persisted in the header record; the
/// comparator and serializers are runtime state and must be supplied again
/// on every `load`.
#[derive(Default)]
pub struct TreeOptions {
    capacity: Option<usize>,
    comparator: Option<Comparator>,
    key_serializer: Option<Box<dyn Serializer>>,
    value_serializer: Option<Box<dyn Serializer>>,
    load_values: Option<bool>,
}

impl TreeOptions {
    pub fn new() -> Self {
        TreeOptions::default()
    }

    /// Slots per page; a power of two in `[4, 128]`.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn key_serializer(mut self, serializer: Box<dyn Serializer>) -> Self {
        self.key_serializer = Some(serializer);
        self
    }

    pub fn value_serializer(mut self, serializer: Box<dyn Serializer>) -> Self {
        self.value_serializer = Some(serializer);
        self
    }

    /// When false, deserialized pages carry only their header and child
    /// recids; such a tree is only good for raw traversal (defrag).
    pub fn load_values(mut self, load_values: bool) -> Self {
        self.load_values = Some(load_values);
        self
    }

    pub(crate) fn into_context(self) -> Result<TreeContext> {
        let capacity = self.capacity.unwrap_or(DEFAULT_CAPACITY);
        if !(4..=128).contains(&capacity) || !capacity.is_power_of_two() {
            return Err(KuraError::Config(format!(
                "page capacity must be a power of two in [4, 128], got {}",
                capacity
            )));
        }
        Ok(TreeContext {
            capacity,
            comparator: self.comparator,
            key_serializer: self.key_serializer,
            value_serializer: self.value_serializer,
            load_values: self.load_values.unwrap_or(true),
        })
    }

    fn with_loaded_capacity(mut self, capacity: usize) -> Result<Self> {
        match self.capacity {
            Some(configured) if configured != capacity => Err(KuraError::Config(format!(
                "tree was created with capacity {}, options say {}",
                capacity, configured
            ))),
            _ => {
                self.capacity = Some(capacity);
                Ok(self)
            }
        }
    }
}

/// B+Tree handle. All operations take the record store explicitly; the
/// tree never holds it.
pub struct BTree {
    header_recid: Recid,
    root: Recid,
    height: u32,
    entries: u64,
    ctx: TreeContext,
}

impl BTree {
    /// Create an empty tree, persisting its header record.
    pub fn create(store: &mut impl RecordStore, options: TreeOptions) -> Result<Self> {
        let ctx = options.into_context()?;
        let mut tree = BTree {
            header_recid: 0,
            root: 0,
            height: 0,
            entries: 0,
            ctx,
        };
        tree.header_recid = store.insert(&tree.encode_header())?;
        Ok(tree)
    }

    /// Re-open a tree from its header record. The options must agree with
    /// the persisted capacity and re-supply comparator and serializers.
    pub fn load(
        store: &mut impl RecordStore,
        header_recid: Recid,
        options: TreeOptions,
    ) -> Result<Self> {
        let data = store.fetch(header_recid)?;
        let mut r = Reader::new(&data);
        let version = r.read_u8()?;
        if version != HEADER_VERSION {
            return Err(KuraError::InvalidFormat(format!(
                "unsupported tree header version {}",
                version
            )));
        }
        let capacity = r.read_varint()? as usize;
        let height = r.read_varint()? as u32;
        let root = r.read_varint()?;
        let entries = r.read_varint()?;

        let ctx = options.with_loaded_capacity(capacity)?.into_context()?;
        Ok(BTree {
            header_recid,
            root,
            height,
            entries,
            ctx,
        })
    }

    /// Recid of the persisted header record; hand it to `load` later.
    pub fn header_recid(&self) -> Recid {
        self.header_recid
    }

    pub fn root_recid(&self) -> Recid {
        self.root
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of entries in the tree.
    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub(crate) fn context(&self) -> &TreeContext {
        &self.ctx
    }

    /// Insert an entry. Returns the previous value when the key already
    /// exists; `replace` decides whether it is overwritten.
    pub fn insert(
        &mut self,
        store: &mut impl RecordStore,
        key: Datum,
        value: Datum,
        replace: bool,
    ) -> Result<Option<Datum>> {
        if self.root == 0 {
            // first insert: the tree becomes a single root leaf
            let mut page =
                BPage::new_root_leaf(self.ctx.capacity(), key, LeafValue::Inline(value));
            ops::persist_new(&self.ctx, store, &mut page)?;
            self.root = page.recid;
            self.height = 1;
            self.entries = 1;
            self.save(store)?;
            return Ok(None);
        }

        let mut root = ops::load_page(&self.ctx, store, self.root)?;
        let result = ops::insert(&self.ctx, store, &mut root, self.height, key, value, replace)?;

        if let Some(overflow) = result.overflow {
            // the root itself split: promote a new root over both halves
            let mut new_root = BPage::new_root_overflow(
                self.ctx.capacity(),
                overflow.largest_key().cloned(),
                overflow.recid,
                root.largest_key().cloned(),
                root.recid,
            );
            ops::persist_new(&self.ctx, store, &mut new_root)?;
            self.root = new_root.recid;
            self.height += 1;
            debug!(root = self.root, height = self.height, "promoted new root");
        }
        if result.existing.is_none() {
            // a fresh entry landed; root/height may have moved as well
            self.entries += 1;
            self.save(store)?;
        }
        Ok(result.existing)
    }

    /// Look up the value stored under `key`.
    pub fn find_value(
        &self,
        store: &mut impl RecordStore,
        key: &Datum,
    ) -> Result<Option<Datum>> {
        if self.root == 0 {
            return Ok(None);
        }
        let root = ops::load_page(&self.ctx, store, self.root)?;
        ops::find_value(&self.ctx, store, &root, self.height, key)
    }

    /// Cursor positioned just before the first key greater than or equal to
    /// `key`; `None` on an empty tree.
    pub fn find(&self, store: &mut impl RecordStore, key: &Datum) -> Result<Option<Cursor>> {
        if self.root == 0 {
            return Ok(None);
        }
        let root = ops::load_page(&self.ctx, store, self.root)?;
        ops::find(&self.ctx, store, root, self.height, key).map(Some)
    }

    /// Cursor positioned before the first entry; `None` on an empty tree.
    pub fn find_first(&self, store: &mut impl RecordStore) -> Result<Option<Cursor>> {
        if self.root == 0 {
            return Ok(None);
        }
        let root = ops::load_page(&self.ctx, store, self.root)?;
        ops::find_first(&self.ctx, store, root).map(Some)
    }

    /// Remove an entry, returning its value, or `None` if the key was not
    /// present. An empty root leaf is kept; a non-leaf root left with a
    /// single subtree is collapsed into it.
    pub fn remove(
        &mut self,
        store: &mut impl RecordStore,
        key: &Datum,
    ) -> Result<Option<Datum>> {
        if self.root == 0 {
            return Ok(None);
        }
        let mut root = ops::load_page(&self.ctx, store, self.root)?;
        let result = match ops::remove(&self.ctx, store, &mut root, self.height, key) {
            Ok(result) => result,
            Err(KuraError::KeyNotFound) => return Ok(None),
            Err(other) => return Err(other),
        };
        self.entries -= 1;

        let capacity = self.ctx.capacity();
        while !root.is_leaf && root.is_empty() {
            let child = root.children[capacity - 1];
            store.delete(root.recid)?;
            self.root = child;
            self.height -= 1;
            debug!(root = self.root, height = self.height, "collapsed root");
            root = ops::load_page(&self.ctx, store, child)?;
        }
        self.save(store)?;
        Ok(result.value)
    }

    /// Delete every page (and spilled value record) of the tree, leaving it
    /// empty. The header record survives.
    pub fn clear(&mut self, store: &mut impl RecordStore) -> Result<()> {
        if self.root != 0 {
            let root = ops::load_page(&self.ctx, store, self.root)?;
            ops::delete_subtree(&self.ctx, store, root)?;
        }
        self.root = 0;
        self.height = 0;
        self.entries = 0;
        self.save(store)
    }

    /// Copy the tree's records from `src` to `dst` preserving recids. Pages
    /// travel as raw bytes; they are decoded only to recover the recids they
    /// reference (child pages, and a leaf's spilled values).
    pub fn defrag(
        &self,
        src: &mut impl RecordStore,
        dst: &mut impl RecordStore,
    ) -> Result<()> {
        let header = src.fetch_raw(self.header_recid)?;
        dst.force_insert(self.header_recid, &header)?;
        if self.root == 0 {
            return Ok(());
        }
        let data = src.fetch_raw(self.root)?;
        dst.force_insert(self.root, &data)?;
        ops::defrag(&self.ctx, src, dst, self.root, &data)
    }

    /// Low-level page access for inspection and verification tools.
    pub fn fetch_page(&self, store: &mut impl RecordStore, recid: Recid) -> Result<BPage> {
        ops::load_page(&self.ctx, store, recid)
    }

    fn save(&self, store: &mut impl RecordStore) -> Result<()> {
        store.update(self.header_recid, &self.encode_header())
    }

    fn encode_header(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.push(HEADER_VERSION);
        encode_varint(&mut out, self.ctx.capacity() as u64);
        encode_varint(&mut out, self.height as u64);
        encode_varint(&mut out, self.root);
        encode_varint(&mut out, self.entries);
        out
    }
}
