//! Persistence - durable records for blocks, tables, the level index and
//! the memtable snapshot
//!
//! Every record is framed the same way:
//!
//! ```text
//! ┌───────────┬─────────────┬────────────┬──────────────────┬────────────┐
//! │ magic u32 │ version u16 │ length u32 │ bincode payload  │ crc32 u32  │
//! └───────────┴─────────────┴────────────┴──────────────────┴────────────┘
//! ```
//!
//! [`DiskStore`] writes one file per record and renames it into place.
//! [`MemoryStore`] keeps the records in process, which lets tests drop an
//! engine and reopen it against the same state.

use crate::block::PhysicalBlock;
use crate::config::StoragePaths;
use crate::sstable::SSTable;
use bincode::Options;
use kvssd_core::format_version::{self, magic, FormatVersion};
use kvssd_core::{BlockId, Error, KvPair, Result, TableId, Zone};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const HEADER_LEN: usize = 10;
const TRAILER_LEN: usize = 4;

/// Persisted form of the level index: level → live table ids
pub type LevelsRecord = Vec<(u32, Vec<TableId>)>;

#[derive(Debug, Serialize, Deserialize)]
struct MemtableRecord {
    entries: Vec<KvPair>,
}

/// Durable storage for the simulator's state.
///
/// Loading a record that was never written yields `Ok(None)`. A record that
/// exists but cannot be decoded yields `Error::Corruption`.
pub trait FlashStore: Send + Sync {
    /// Persist one block with all of its pages
    fn save_block(&self, zone: Zone, block: &PhysicalBlock) -> Result<()>;
    /// Load one block
    fn load_block(&self, zone: Zone, id: BlockId) -> Result<Option<PhysicalBlock>>;
    /// Persist an SSTable record
    fn save_table(&self, table: &SSTable) -> Result<()>;
    /// Load an SSTable record
    fn load_table(&self, id: TableId) -> Result<Option<SSTable>>;
    /// Delete an SSTable record
    fn delete_table(&self, id: TableId) -> Result<()>;
    /// Persist the level index
    fn save_levels(&self, levels: &LevelsRecord) -> Result<()>;
    /// Load the level index
    fn load_levels(&self) -> Result<Option<LevelsRecord>>;
    /// Persist the memtable snapshot
    fn save_memtable(&self, entries: &[KvPair]) -> Result<()>;
    /// Remove the memtable snapshot
    fn clear_memtable(&self) -> Result<()>;
    /// Load the memtable snapshot
    fn load_memtable(&self) -> Result<Option<Vec<KvPair>>>;
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

/// Frame `payload` as a persisted record
pub fn encode_record<T: Serialize>(magic: u32, version: u16, payload: &T) -> Result<Vec<u8>> {
    let body = codec()
        .serialize(payload)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len() + TRAILER_LEN);
    buf.extend_from_slice(&magic.to_le_bytes());
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(buf)
}

/// Validate the framing of a persisted record and decode its payload
pub fn decode_record<T: DeserializeOwned>(
    expected_magic: u32,
    format: FormatVersion,
    bytes: &[u8],
) -> Result<T> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err(Error::Corruption(format!(
            "record of {} bytes is too short",
            bytes.len()
        )));
    }
    let found_magic = read_u32(bytes, 0);
    if found_magic != expected_magic {
        return Err(Error::Corruption(format!(
            "bad magic {:#010x}, expected {:#010x}",
            found_magic, expected_magic
        )));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if !format.can_read(version) {
        return Err(Error::Corruption(format!(
            "unsupported record version {}",
            version
        )));
    }
    let len = read_u32(bytes, 6) as usize;
    if HEADER_LEN + len + TRAILER_LEN != bytes.len() {
        return Err(Error::Corruption(format!(
            "payload length {} does not match record size {}",
            len,
            bytes.len()
        )));
    }
    let body = &bytes[HEADER_LEN..HEADER_LEN + len];
    let stored_crc = read_u32(bytes, HEADER_LEN + len);
    if crc32fast::hash(body) != stored_crc {
        return Err(Error::Corruption("checksum mismatch".into()));
    }
    codec()
        .with_limit(len as u64)
        .deserialize(body)
        .map_err(|e| Error::Corruption(format!("undecodable payload: {}", e)))
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

/// Decode a block record, as stored by [`DiskStore`]
pub fn decode_block(bytes: &[u8]) -> Result<PhysicalBlock> {
    decode_record(magic::BLOCK, format_version::block_version(), bytes)
}

/// Decode an SSTable record, as stored by [`DiskStore`]
pub fn decode_table(bytes: &[u8]) -> Result<SSTable> {
    decode_record(magic::TABLE, format_version::table_version(), bytes)
}

/// File-per-record store rooted at an engine directory
#[derive(Debug, Clone)]
pub struct DiskStore {
    paths: StoragePaths,
}

impl DiskStore {
    /// Open or create the directory layout at `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let paths = StoragePaths::new(dir);
        fs::create_dir_all(paths.root())?;
        fs::create_dir_all(paths.data_blocks())?;
        fs::create_dir_all(paths.meta_blocks())?;
        fs::create_dir_all(paths.tables())?;
        Ok(Self { paths })
    }

    /// Engine directory
    pub fn dir(&self) -> &Path {
        self.paths.root()
    }

    fn block_path(&self, zone: Zone, id: BlockId) -> PathBuf {
        let dir = match zone {
            Zone::Data => self.paths.data_blocks(),
            Zone::Metadata => self.paths.meta_blocks(),
        };
        dir.join(format!("{}.blk", id))
    }

    fn table_path(&self, id: TableId) -> PathBuf {
        self.paths.tables().join(format!("sst_{}.sst", id))
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_optional(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl FlashStore for DiskStore {
    fn save_block(&self, zone: Zone, block: &PhysicalBlock) -> Result<()> {
        let bytes = encode_record(magic::BLOCK, format_version::BLOCK_FORMAT_VERSION, block)?;
        Self::write_atomic(&self.block_path(zone, block.id), &bytes)
    }

    fn load_block(&self, zone: Zone, id: BlockId) -> Result<Option<PhysicalBlock>> {
        Self::read_optional(&self.block_path(zone, id))?
            .map(|bytes| decode_block(&bytes))
            .transpose()
    }

    fn save_table(&self, table: &SSTable) -> Result<()> {
        let bytes = encode_record(magic::TABLE, format_version::TABLE_FORMAT_VERSION, table)?;
        Self::write_atomic(&self.table_path(table.id), &bytes)
    }

    fn load_table(&self, id: TableId) -> Result<Option<SSTable>> {
        Self::read_optional(&self.table_path(id))?
            .map(|bytes| decode_table(&bytes))
            .transpose()
    }

    fn delete_table(&self, id: TableId) -> Result<()> {
        Self::remove_optional(&self.table_path(id))
    }

    fn save_levels(&self, levels: &LevelsRecord) -> Result<()> {
        let bytes = encode_record(magic::LEVELS, format_version::LEVELS_FORMAT_VERSION, levels)?;
        Self::write_atomic(&self.paths.levels(), &bytes)
    }

    fn load_levels(&self) -> Result<Option<LevelsRecord>> {
        Self::read_optional(&self.paths.levels())?
            .map(|bytes| {
                decode_record(magic::LEVELS, format_version::levels_version(), &bytes)
            })
            .transpose()
    }

    fn save_memtable(&self, entries: &[KvPair]) -> Result<()> {
        let record = MemtableRecord {
            entries: entries.to_vec(),
        };
        let bytes = encode_record(
            magic::MEMTABLE,
            format_version::MEMTABLE_FORMAT_VERSION,
            &record,
        )?;
        Self::write_atomic(&self.paths.memtable(), &bytes)
    }

    fn clear_memtable(&self) -> Result<()> {
        Self::remove_optional(&self.paths.memtable())
    }

    fn load_memtable(&self) -> Result<Option<Vec<KvPair>>> {
        Self::read_optional(&self.paths.memtable())?
            .map(|bytes| {
                decode_record::<MemtableRecord>(
                    magic::MEMTABLE,
                    format_version::memtable_version(),
                    &bytes,
                )
                .map(|record| record.entries)
            })
            .transpose()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    data_blocks: HashMap<BlockId, PhysicalBlock>,
    meta_blocks: HashMap<BlockId, PhysicalBlock>,
    tables: HashMap<TableId, SSTable>,
    levels: Option<LevelsRecord>,
    memtable: Option<Vec<KvPair>>,
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of SSTable records currently held
    pub fn table_count(&self) -> usize {
        self.state.lock().map(|s| s.tables.len()).unwrap_or(0)
    }
}

impl FlashStore for MemoryStore {
    fn save_block(&self, zone: Zone, block: &PhysicalBlock) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        let blocks = match zone {
            Zone::Data => &mut state.data_blocks,
            Zone::Metadata => &mut state.meta_blocks,
        };
        blocks.insert(block.id, block.clone());
        Ok(())
    }

    fn load_block(&self, zone: Zone, id: BlockId) -> Result<Option<PhysicalBlock>> {
        let state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        let blocks = match zone {
            Zone::Data => &state.data_blocks,
            Zone::Metadata => &state.meta_blocks,
        };
        Ok(blocks.get(&id).cloned())
    }

    fn save_table(&self, table: &SSTable) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        state.tables.insert(table.id, table.clone());
        Ok(())
    }

    fn load_table(&self, id: TableId) -> Result<Option<SSTable>> {
        let state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(state.tables.get(&id).cloned())
    }

    fn delete_table(&self, id: TableId) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        state.tables.remove(&id);
        Ok(())
    }

    fn save_levels(&self, levels: &LevelsRecord) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        state.levels = Some(levels.clone());
        Ok(())
    }

    fn load_levels(&self) -> Result<Option<LevelsRecord>> {
        let state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(state.levels.clone())
    }

    fn save_memtable(&self, entries: &[KvPair]) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        state.memtable = Some(entries.to_vec());
        Ok(())
    }

    fn clear_memtable(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        state.memtable = None;
        Ok(())
    }

    fn load_memtable(&self) -> Result<Option<Vec<KvPair>>> {
        let state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(state.memtable.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::PhysicalPage;
    use kvssd_core::{KeyRange, PageAddress};
    use tempfile::tempdir;

    fn sample_block() -> PhysicalBlock {
        let mut block = PhysicalBlock::new(5, 4);
        let addr = block.next_address().unwrap();
        block
            .program(PhysicalPage::data(
                addr,
                7,
                vec![("a".into(), "1".into()), ("b".into(), "2".into())],
            ))
            .unwrap();
        block.level = Some(1);
        block.allocated = true;
        block.tables.insert(3);
        block
    }

    fn sample_table() -> SSTable {
        SSTable {
            id: 3,
            level: 1,
            key_range: KeyRange::new("a", "b"),
            meta_address: PageAddress::new(0, 0),
            kv_pair_count: 2,
            data_page_count: 1,
        }
    }

    #[test]
    fn test_disk_store_block_roundtrip() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let block = sample_block();

        assert!(store.load_block(Zone::Data, 5).unwrap().is_none());
        store.save_block(Zone::Data, &block).unwrap();
        assert_eq!(store.load_block(Zone::Data, 5).unwrap(), Some(block));
        assert!(store.load_block(Zone::Metadata, 5).unwrap().is_none());
    }

    #[test]
    fn test_disk_store_tables_levels_memtable() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let table = sample_table();

        store.save_table(&table).unwrap();
        assert_eq!(store.load_table(3).unwrap(), Some(table));
        store.delete_table(3).unwrap();
        store.delete_table(3).unwrap();
        assert!(store.load_table(3).unwrap().is_none());

        let levels: LevelsRecord = vec![(0, vec![4]), (1, vec![1, 2])];
        store.save_levels(&levels).unwrap();
        assert_eq!(store.load_levels().unwrap(), Some(levels));

        let entries: Vec<KvPair> = vec![("k".into(), "v".into())];
        store.save_memtable(&entries).unwrap();
        assert_eq!(store.load_memtable().unwrap(), Some(entries));
        store.clear_memtable().unwrap();
        assert!(store.load_memtable().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_record_detected() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store.save_block(Zone::Data, &sample_block()).unwrap();

        let path = store.block_path(Zone::Data, 5);
        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = store.load_block(Zone::Data, 5).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_decode_record_rejects_framing_errors() {
        let bytes = encode_record(magic::TABLE, 1, &sample_table()).unwrap();
        assert!(decode_table(&bytes).is_ok());
        assert!(decode_block(&bytes).is_err());
        assert!(decode_table(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode_table(&[0u8; 3]).is_err());

        let mut future = bytes.clone();
        future[4] = 99;
        assert!(matches!(decode_table(&future), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_memory_store_contract() {
        let store = MemoryStore::new();
        store.save_block(Zone::Metadata, &sample_block()).unwrap();
        assert!(store.load_block(Zone::Data, 5).unwrap().is_none());
        assert!(store.load_block(Zone::Metadata, 5).unwrap().is_some());

        store.save_table(&sample_table()).unwrap();
        assert_eq!(store.table_count(), 1);
        store.delete_table(3).unwrap();
        assert_eq!(store.table_count(), 0);
        assert!(store.load_levels().unwrap().is_none());
    }
}
