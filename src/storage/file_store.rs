use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use tracing::debug;

use crate::error::{KuraError, Result};
use crate::storage::record_store::RecordStore;
use crate::types::Recid;
use crate::varint::{encode_varint, Reader};

/// Single-file record store.
///
/// Layout:
///   0..8    Magic "KURADB01"
///   8..12   Format version (u32 LE) — currently 1
///   12..20  Next recid (u64 LE)
///   20..28  Index offset (u64 LE, 0 = never flushed)
///   28..32  Header CRC32 (u32 LE, over bytes 0..28)
///
/// Records are appended after the header. The live-record index
/// (count, then recid/offset/len varints per record, then CRC32) is written
/// at the append position by `flush()` and referenced from the header;
/// later appends land after it, so the flushed index stays intact until the
/// next flush supersedes it. Updates append a fresh copy of the record and
/// remap the recid, so stale space (old record versions, superseded
/// indexes) accumulates until the tree is defragmented into a new store.
/// Durability is delegated to `flush()`: a crash between flushes rewinds
/// the store to its last flushed state.
const HEADER_SIZE: u64 = 32;
const MAGIC: &[u8; 8] = b"KURADB01";
const FORMAT_VERSION: u32 = 1;

/// Default LRU cache capacity, in records.
const DEFAULT_CACHE_CAPACITY: usize = 256;

pub struct FileStore {
    file: File,
    index: HashMap<Recid, (u64, u32)>,
    next_recid: Recid,
    /// Append position; also where the next index flush lands.
    end_offset: u64,
    cache: LruCache<Recid, Vec<u8>>,
    dirty: bool,
}

impl FileStore {
    /// Create a new store file. Fails if the path already exists.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut store = FileStore {
            file,
            index: HashMap::new(),
            next_recid: 1,
            end_offset: HEADER_SIZE,
            cache: LruCache::new(NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap()),
            dirty: false,
        };
        store.write_header(0)?;
        Ok(store)
    }

    /// Open an existing store file and load its record index.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut store = FileStore {
            file,
            index: HashMap::new(),
            next_recid: 1,
            end_offset: HEADER_SIZE,
            cache: LruCache::new(NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap()),
            dirty: false,
        };

        let mut header = [0u8; HEADER_SIZE as usize];
        store.file.seek(SeekFrom::Start(0))?;
        store.file.read_exact(&mut header)?;

        if &header[0..8] != MAGIC {
            return Err(KuraError::InvalidFormat("bad store magic".into()));
        }
        let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(KuraError::InvalidFormat(format!(
                "unsupported store format version {}",
                version
            )));
        }
        let stored_crc = u32::from_le_bytes(header[28..32].try_into().unwrap());
        if stored_crc != crc32fast::hash(&header[0..28]) {
            return Err(KuraError::Corruption("store header checksum mismatch".into()));
        }

        store.next_recid = u64::from_le_bytes(header[12..20].try_into().unwrap());
        let index_offset = u64::from_le_bytes(header[20..28].try_into().unwrap());
        if index_offset != 0 {
            store.read_index(index_offset)?;
        }
        // appends go at the end of the file, past any unflushed tail
        store.end_offset = store.file.seek(SeekFrom::End(0))?;

        debug!(
            records = store.index.len(),
            next_recid = store.next_recid,
            "opened record store"
        );
        Ok(store)
    }

    /// Write the record index at the append position and point the header
    /// at it. The previous index becomes stale space.
    pub fn flush(&mut self) -> Result<()> {
        let mut buf = Vec::with_capacity(self.index.len() * 6 + 8);
        encode_varint(&mut buf, self.index.len() as u64);
        for (&recid, &(offset, len)) in &self.index {
            encode_varint(&mut buf, recid);
            encode_varint(&mut buf, offset);
            encode_varint(&mut buf, len as u64);
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        let index_offset = self.end_offset;
        self.file.seek(SeekFrom::Start(index_offset))?;
        self.file.write_all(&buf)?;
        self.write_header(index_offset)?;
        self.file.sync_all()?;
        self.end_offset = index_offset + buf.len() as u64;
        self.dirty = false;
        debug!(records = self.index.len(), "flushed record store");
        Ok(())
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn write_header(&mut self, index_offset: u64) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..8].copy_from_slice(MAGIC);
        header[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[12..20].copy_from_slice(&self.next_recid.to_le_bytes());
        header[20..28].copy_from_slice(&index_offset.to_le_bytes());
        let crc = crc32fast::hash(&header[0..28]);
        header[28..32].copy_from_slice(&crc.to_le_bytes());

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    fn read_index(&mut self, index_offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(index_offset))?;
        let mut raw = Vec::new();
        self.file.read_to_end(&mut raw)?;

        let mut r = Reader::new(&raw);
        let count = r.read_varint()? as usize;
        for _ in 0..count {
            let recid = r.read_varint()?;
            let offset = r.read_varint()?;
            let len = r.read_varint()? as u32;
            self.index.insert(recid, (offset, len));
        }
        let parsed = raw.len() - r.remaining();
        let stored_crc = u32::from_le_bytes(
            r.read_bytes(4)?
                .try_into()
                .expect("BUG: read_bytes(4) returned wrong length"),
        );
        if stored_crc != crc32fast::hash(&raw[0..parsed]) {
            return Err(KuraError::Corruption("store index checksum mismatch".into()));
        }
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.end_offset;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.end_offset += data.len() as u64;
        self.dirty = true;
        Ok(offset)
    }

    fn read_at(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl RecordStore for FileStore {
    fn insert(&mut self, data: &[u8]) -> Result<Recid> {
        let recid = self.next_recid;
        self.next_recid += 1;
        let offset = self.append(data)?;
        self.index.insert(recid, (offset, data.len() as u32));
        self.cache.put(recid, data.to_vec());
        Ok(recid)
    }

    fn fetch(&mut self, recid: Recid) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.get(&recid) {
            return Ok(data.clone());
        }
        let &(offset, len) = self
            .index
            .get(&recid)
            .ok_or(KuraError::RecordNotFound(recid))?;
        let data = self.read_at(offset, len)?;
        self.cache.put(recid, data.clone());
        Ok(data)
    }

    fn update(&mut self, recid: Recid, data: &[u8]) -> Result<()> {
        if !self.index.contains_key(&recid) {
            return Err(KuraError::RecordNotFound(recid));
        }
        let offset = self.append(data)?;
        self.index.insert(recid, (offset, data.len() as u32));
        self.cache.put(recid, data.to_vec());
        Ok(())
    }

    fn delete(&mut self, recid: Recid) -> Result<()> {
        self.index
            .remove(&recid)
            .ok_or(KuraError::RecordNotFound(recid))?;
        self.cache.pop(&recid);
        self.dirty = true;
        Ok(())
    }

    fn fetch_raw(&mut self, recid: Recid) -> Result<Vec<u8>> {
        let &(offset, len) = self
            .index
            .get(&recid)
            .ok_or(KuraError::RecordNotFound(recid))?;
        self.read_at(offset, len)
    }

    fn force_insert(&mut self, recid: Recid, data: &[u8]) -> Result<()> {
        let offset = self.append(data)?;
        self.index.insert(recid, (offset, data.len() as u32));
        self.next_recid = self.next_recid.max(recid + 1);
        self.cache.put(recid, data.to_vec());
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if self.dirty {
            let _ = self.flush();
        }
    }
}
