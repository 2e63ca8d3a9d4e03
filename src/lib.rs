//! KuraDB: persistent B+Tree index engine over pluggable record storage
//!
//! A page-level B+Tree in the classic record-manager style:
//! - fixed-capacity pages filling from the right, with a "+infinity"
//!   sentinel on the rightmost page of every level
//! - recursive insert/remove with page splits, sibling borrowing and merges
//! - a doubly-linked leaf list driving bidirectional cursors
//! - a compact binary page format with delta-compressed integer keys,
//!   prefix-shared string keys, and large values spilled into their own
//!   records
//! - storage behind a byte-oriented `RecordStore` trait, with an in-memory
//!   store and a single-file store included

pub mod btree;
pub mod error;
pub mod serializer;
pub mod storage;
pub mod types;
pub mod varint;

pub use btree::{BPage, BTree, Cursor, LeafValue, TreeOptions, MAX_INTREE_RECORD_SIZE};
pub use error::{KuraError, Result};
pub use serializer::{DefaultSerializer, Serializer};
pub use storage::{FileStore, MemStore, RecordStore};
pub use types::{Datum, Recid};
