//! Fixed-size memory-mapped shard files.
//!
//! A shard owns one region of the hyperspace and stores its records in a
//! single file of exactly [`FILE_SIZE`] bytes:
//!
//! ```text
//! 0              HASH_TABLE_SIZE      INDEX_SEGMENT_SIZE          FILE_SIZE
//! ├─ hash table ─┼─── search log ─────┼──────── data segment ─────────┤
//! ```
//!
//! The hash table answers point lookups, the search log keeps records in
//! append order for stale-space accounting and snapshots, and the data
//! segment is append-only. A single mutator writes; readers probe
//! concurrently without locks, which is sound because a hash-table slot,
//! once assigned to a key, is never reassigned to a different key.

pub mod snapshot;
pub mod vector;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memmap2::{MmapOptions, MmapRaw};

use crate::coordinate::Coordinate;
use crate::error::{Error, Result};

pub use snapshot::{ShardSnapshot, SnapshotEntry};
pub use vector::ShardVector;

/// Total size of a shard file. 16 MiB keeps shard creation, splitting, and
/// the test suite cheap; deployments wanting larger shards rebuild with a
/// bigger constant. Files are laid out in little-endian host order and are
/// not portable to big-endian machines.
pub const FILE_SIZE: u32 = 16 * 1024 * 1024;

pub const HASH_TABLE_ENTRIES: u32 = 65_536;
pub const HASH_TABLE_SIZE: u32 = HASH_TABLE_ENTRIES * 8;
pub const SEARCH_INDEX_ENTRIES: u32 = 65_536;
pub const SEARCH_INDEX_SIZE: u32 = SEARCH_INDEX_ENTRIES * 16;
pub const INDEX_SEGMENT_SIZE: u32 = HASH_TABLE_SIZE + SEARCH_INDEX_SIZE;
pub const DATA_SEGMENT_SIZE: u32 = FILE_SIZE - INDEX_SEGMENT_SIZE;

/// Flag bit marking a hash-table offset as tombstoned. The slot keeps its
/// primary hash so probe chains continue past it.
pub const HASH_OFFSET_INVALID: u32 = 1 << 31;

const fn align8(offset: u32) -> u32 {
    (offset + 7) & !7
}

/// One fixed-size memory-mapped shard file.
///
/// All methods take `&self`: the mapping is shared between concurrent
/// readers and the disk's single mutator. `data_offset` and
/// `search_offset` are only advanced by the mutator; readers never rely on
/// them and instead follow offsets published through hash-table slots.
pub struct Shard {
    map: MmapRaw,
    data_offset: AtomicU32,
    search_offset: AtomicU32,
}

impl Shard {
    /// Creates a zero-filled shard file of [`FILE_SIZE`] bytes, replacing
    /// any existing file of the same name, and maps it read/write.
    pub fn create(dir: &Path, name: &str) -> Result<Arc<Shard>> {
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        // Write real zeros rather than truncating to length: the file must
        // be fully allocated before records land in it.
        let zeros = vec![0u8; 1 << 20];
        let mut remaining = FILE_SIZE as usize;
        while remaining > 0 {
            let n = remaining.min(zeros.len());
            file.write_all(&zeros[..n])?;
            remaining -= n;
        }
        file.sync_all()?;

        let map = MmapOptions::new().map_raw(&file)?;
        Ok(Arc::new(Shard {
            map,
            data_offset: AtomicU32::new(INDEX_SEGMENT_SIZE),
            search_offset: AtomicU32::new(0),
        }))
    }

    /// Maps an existing shard file and rebuilds the append positions from
    /// the search log: the last entry with a nonzero data offset marks the
    /// final record, and the data offset resumes just past it.
    pub fn open(dir: &Path, name: &str) -> Result<Arc<Shard>> {
        let path = dir.join(name);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len != FILE_SIZE as u64 {
            return Err(Error::InvalidData(format!(
                "shard file {} has size {len}, expected {FILE_SIZE}",
                path.display()
            )));
        }

        let map = MmapOptions::new().map_raw(&file)?;
        let shard = Shard {
            map,
            data_offset: AtomicU32::new(INDEX_SEGMENT_SIZE),
            search_offset: AtomicU32::new(0),
        };

        let mut search_offset = 0;
        let mut data_offset = INDEX_SEGMENT_SIZE;
        while search_offset < SEARCH_INDEX_ENTRIES {
            let offset = shard.log_word(search_offset, 1).load(Ordering::Relaxed) as u32;
            if offset == 0 {
                break;
            }
            data_offset = offset;
            search_offset += 1;
        }

        if search_offset > 0 {
            let size = shard.record_size_at(data_offset)?;
            data_offset = align8(data_offset + size);
            if data_offset > FILE_SIZE {
                return Err(Error::InvalidData(format!(
                    "shard file {} ends past the file boundary",
                    path.display()
                )));
            }
        }

        shard.search_offset.store(search_offset, Ordering::Relaxed);
        shard.data_offset.store(data_offset, Ordering::Relaxed);
        Ok(Arc::new(shard))
    }

    /// Point lookup by primary hash and exact key.
    pub fn get(&self, primary_hash: u32, key: &[u8]) -> Result<Option<(Vec<Vec<u8>>, u64)>> {
        let word = match self.hash_lookup(primary_hash, key) {
            Ok((_, word)) => word,
            Err(Error::HashFull) => return Ok(None),
            Err(e) => return Err(e),
        };

        let offset = (word >> 32) as u32;
        if offset == 0 || offset & HASH_OFFSET_INVALID != 0 {
            return Ok(None);
        }

        // hash_lookup already compared the key, so only the value and
        // version remain to be decoded.
        Ok(Some((self.record_value(offset), self.record_version(offset))))
    }

    /// Appends a record and indexes it.
    ///
    /// Any prior version of the key has its search-log entry invalidated
    /// with the new record's offset. Returns `DataFull`/`SearchFull`/
    /// `HashFull` when the corresponding region is exhausted; the caller
    /// reacts by cleaning or splitting the shard.
    pub fn put(
        &self,
        primary_hash: u32,
        secondary_hash: u32,
        key: &[u8],
        value: &[Vec<u8>],
        version: u64,
    ) -> Result<()> {
        let size = record_size(key, value);
        let data_offset = self.data_offset.load(Ordering::Relaxed);
        if data_offset as u64 + size > FILE_SIZE as u64 {
            return Err(Error::DataFull);
        }
        let search_offset = self.search_offset.load(Ordering::Relaxed);
        if search_offset == SEARCH_INDEX_ENTRIES {
            return Err(Error::SearchFull);
        }

        let (bucket, word) = self.hash_lookup(primary_hash, key)?;

        let mut record = Vec::with_capacity(size as usize);
        record.write_u64::<LittleEndian>(version)?;
        record.write_u32::<LittleEndian>(key.len() as u32)?;
        record.extend_from_slice(key);
        record.write_u16::<LittleEndian>(value.len() as u16)?;
        for attr in value {
            record.write_u32::<LittleEndian>(attr.len() as u32)?;
            record.extend_from_slice(attr);
        }
        self.write_bytes(data_offset, &record);

        let prior_offset = (word >> 32) as u32;
        if prior_offset != 0 && prior_offset & HASH_OFFSET_INVALID == 0 {
            self.invalidate_log_entry(prior_offset, data_offset);
        }

        // Publish: log entry first, then the hash-table slot. The slot
        // store is the release point a racing reader acquires, so the
        // record bytes above are visible once the slot is.
        self.log_word(search_offset, 0).store(
            ((secondary_hash as u64) << 32) | primary_hash as u64,
            Ordering::Release,
        );
        self.log_word(search_offset, 1)
            .store(data_offset as u64, Ordering::Release);
        self.table_slot(bucket).store(
            ((data_offset as u64) << 32) | primary_hash as u64,
            Ordering::Release,
        );

        self.search_offset
            .store(search_offset + 1, Ordering::Relaxed);
        let new_data_offset = align8(data_offset + size as u32);

        // Kick a background msync whenever appends cross a 4 MiB boundary.
        if data_offset >> 22 != new_data_offset >> 22 {
            if let Err(e) = self.async_sync() {
                tracing::warn!(error = %e, "async msync after data append failed");
            }
        }

        self.data_offset.store(new_data_offset, Ordering::Relaxed);
        Ok(())
    }

    /// Tombstones the record for `key`, consuming an 8-byte placeholder
    /// from the data segment. Returns `Ok(false)` when the key is absent.
    ///
    /// The hash slot keeps its primary hash with [`HASH_OFFSET_INVALID`]
    /// set: probe chains must continue past tombstoned slots, and the slot
    /// stays reserved for this key should it be reinserted.
    pub fn del(&self, primary_hash: u32, key: &[u8]) -> Result<bool> {
        let (bucket, word) = match self.hash_lookup(primary_hash, key) {
            Ok(found) => found,
            Err(Error::HashFull) => return Ok(false),
            Err(e) => return Err(e),
        };

        let offset = (word >> 32) as u32;
        if offset == 0 || offset & HASH_OFFSET_INVALID != 0 {
            return Ok(false);
        }

        let data_offset = self.data_offset.load(Ordering::Relaxed);
        if data_offset as u64 + 8 > FILE_SIZE as u64 {
            return Err(Error::DataFull);
        }

        self.invalidate_log_entry(offset, data_offset);
        self.data_offset.store(data_offset + 8, Ordering::Relaxed);
        self.table_slot(bucket).store(
            (((HASH_OFFSET_INVALID | offset) as u64) << 32) | primary_hash as u64,
            Ordering::Release,
        );
        Ok(true)
    }

    /// Percentage of the shard occupied by invalidated records, measured
    /// both in data bytes and in search-log entries; the larger wins.
    pub fn stale_space(&self) -> u32 {
        let search_offset = self.search_offset.load(Ordering::Relaxed);
        let data_offset = self.data_offset.load(Ordering::Relaxed);
        let mut stale_bytes = 0u64;
        let mut stale_count = 0u64;

        for entry in 0..search_offset {
            let word = self.log_word(entry, 1).load(Ordering::Relaxed);
            if (word >> 32) as u32 == 0 {
                continue;
            }
            let start = word as u32;
            let end = if entry + 1 < search_offset {
                self.log_word(entry + 1, 1).load(Ordering::Relaxed) as u32
            } else {
                data_offset
            };
            stale_bytes += (end - start) as u64;
            stale_count += 1;
        }

        let by_bytes = 100 * stale_bytes / DATA_SEGMENT_SIZE as u64;
        let by_count = 100 * stale_count / SEARCH_INDEX_ENTRIES as u64;
        by_bytes.max(by_count) as u32
    }

    /// Percentage of the shard in use, measured both in data bytes and in
    /// search-log entries; the larger wins.
    pub fn used_space(&self) -> u32 {
        let data = 100 * (self.data_offset.load(Ordering::Relaxed) - INDEX_SEGMENT_SIZE) as u64
            / DATA_SEGMENT_SIZE as u64;
        let entries =
            100 * self.search_offset.load(Ordering::Relaxed) as u64 / SEARCH_INDEX_ENTRIES as u64;
        data.max(entries) as u32
    }

    pub fn free_space(&self) -> u32 {
        100 - self.used_space()
    }

    /// Schedules an asynchronous msync of the whole mapping.
    pub fn async_sync(&self) -> Result<()> {
        self.map
            .flush_async()
            .map_err(|e| Error::SyncFailed(e.to_string()))
    }

    /// Synchronously msyncs the whole mapping.
    pub fn sync(&self) -> Result<()> {
        self.map
            .flush()
            .map_err(|e| Error::SyncFailed(e.to_string()))
    }

    /// Iterator over the records live at this instant. Records invalidated
    /// after the snapshot is taken are still yielded.
    pub fn snapshot(this: &Arc<Shard>) -> ShardSnapshot {
        ShardSnapshot::new(Arc::clone(this))
    }

    /// Copies every live record whose point coordinate intersects `target`
    /// into `dst`, rebuilding `dst`'s hash table and search log from
    /// scratch. `dst` must not have been written through any other path.
    pub fn copy_to(&self, target: &Coordinate, dst: &Shard) -> Result<()> {
        debug_assert!(!std::ptr::eq(self, dst));
        dst.zero_range(0, INDEX_SEGMENT_SIZE as usize);
        dst.data_offset.store(INDEX_SEGMENT_SIZE, Ordering::Relaxed);
        dst.search_offset.store(0, Ordering::Relaxed);

        let search_offset = self.search_offset.load(Ordering::Relaxed);
        let data_offset = self.data_offset.load(Ordering::Relaxed);

        for entry in 0..search_offset {
            let offsets = self.log_word(entry, 1).load(Ordering::Relaxed);
            if (offsets >> 32) as u32 != 0 {
                continue;
            }
            let start = offsets as u32;
            if start == 0 {
                break;
            }

            let hashes = self.log_word(entry, 0).load(Ordering::Relaxed);
            let primary_hash = hashes as u32;
            let secondary_hash = (hashes >> 32) as u32;
            if !target.intersects(&Coordinate::point(primary_hash, secondary_hash)) {
                continue;
            }

            let end = if entry + 1 < search_offset {
                self.log_word(entry + 1, 1).load(Ordering::Relaxed) as u32
            } else {
                data_offset
            };

            let dst_offset = dst.data_offset.load(Ordering::Relaxed);
            let dst_entry = dst.search_offset.load(Ordering::Relaxed);
            dst.write_bytes(dst_offset, self.bytes(start, (end - start) as usize));
            dst.log_word(dst_entry, 0).store(hashes, Ordering::Release);
            dst.log_word(dst_entry, 1)
                .store(dst_offset as u64, Ordering::Release);
            let bucket = dst.free_slot(primary_hash)?;
            dst.table_slot(bucket).store(
                ((dst_offset as u64) << 32) | primary_hash as u64,
                Ordering::Release,
            );
            dst.search_offset.store(dst_entry + 1, Ordering::Relaxed);
            dst.data_offset
                .store(align8(dst_offset + (end - start)), Ordering::Relaxed);
        }

        Ok(())
    }

    /// Verifies shard invariants and logs every inconsistency found:
    /// search-log offsets strictly increase and are followed by a zero
    /// tail, offsets are 8-byte aligned within the data segment, and every
    /// live log entry agrees with its hash-table slot.
    pub fn fsck(&self) -> bool {
        let mut ok = true;
        let mut reached_zero = false;
        let mut prev_offset = 0u32;

        for entry in 0..SEARCH_INDEX_ENTRIES {
            let hashes = self.log_word(entry, 0).load(Ordering::Relaxed);
            let offsets = self.log_word(entry, 1).load(Ordering::Relaxed);
            let offset = offsets as u32;

            if offset == 0 {
                reached_zero = true;
                if offsets != 0 || hashes != 0 {
                    tracing::warn!(entry, "search log entry has no offset but nonzero words");
                    ok = false;
                }
                continue;
            }

            if reached_zero {
                tracing::warn!(entry, "search log entry follows the zero tail");
                ok = false;
                continue;
            }

            if entry > 0 && offset <= prev_offset {
                tracing::warn!(entry, offset, prev_offset, "search log offsets not increasing");
                ok = false;
            }
            prev_offset = offset;

            if offset % 8 != 0 || offset < INDEX_SEGMENT_SIZE || offset >= FILE_SIZE {
                tracing::warn!(entry, offset, "search log offset outside the data segment");
                ok = false;
                continue;
            }

            if (offsets >> 32) as u32 == 0 {
                let primary_hash = hashes as u32;
                let key = self.record_key(offset);
                match self.hash_lookup(primary_hash, key) {
                    Ok((_, word)) if (word >> 32) as u32 == offset => {}
                    _ => {
                        tracing::warn!(
                            entry,
                            offset,
                            primary_hash,
                            "live search log entry does not match its hash table slot"
                        );
                        ok = false;
                    }
                }
            }
        }

        ok
    }

    pub(crate) fn data_limit(&self) -> u32 {
        self.data_offset.load(Ordering::Relaxed)
    }

    pub(crate) fn search_limit(&self) -> u32 {
        self.search_offset.load(Ordering::Relaxed)
    }

    /// Finds the probe-terminating slot for `(primary_hash, key)`: either
    /// the slot already assigned to the pair (live or tombstoned) or the
    /// first never-assigned slot. A slot, once assigned, is never handed to
    /// a different key, which is what keeps a reader racing the mutator
    /// consistent: it sees either the old offset or the new one, both
    /// valid.
    fn hash_lookup(&self, primary_hash: u32, key: &[u8]) -> Result<(u32, u64)> {
        let start = primary_hash % HASH_TABLE_ENTRIES;

        for probe in 0..HASH_TABLE_ENTRIES {
            let bucket = (start + probe) % HASH_TABLE_ENTRIES;
            let word = self.table_slot(bucket).load(Ordering::Acquire);
            let offset = (word >> 32) as u32;

            if offset == 0 {
                return Ok((bucket, word));
            }

            if word as u32 == primary_hash {
                let record = offset & !HASH_OFFSET_INVALID;
                if self.record_key(record) == key {
                    return Ok((bucket, word));
                }
            }
        }

        Err(Error::HashFull)
    }

    /// First never-assigned slot for `primary_hash`, used when rebuilding a
    /// destination hash table during a copy.
    fn free_slot(&self, primary_hash: u32) -> Result<u32> {
        let start = primary_hash % HASH_TABLE_ENTRIES;

        for probe in 0..HASH_TABLE_ENTRIES {
            let bucket = (start + probe) % HASH_TABLE_ENTRIES;
            let word = self.table_slot(bucket).load(Ordering::Relaxed);
            if (word >> 32) as u32 == 0 {
                return Ok(bucket);
            }
        }

        Err(Error::HashFull)
    }

    /// Marks the live search-log entry holding `target` stale by writing
    /// `invalidator` into its upper word. Offsets are sorted by
    /// construction, so a binary search over the occupied prefix finds it.
    fn invalidate_log_entry(&self, target: u32, invalidator: u32) {
        let mut low: i64 = 0;
        let mut high: i64 = self.search_offset.load(Ordering::Relaxed) as i64 - 1;

        while low <= high {
            let mid = low + (high - low) / 2;
            let offset = self.log_word(mid as u32, 1).load(Ordering::Relaxed) as u32;

            match offset.cmp(&target) {
                std::cmp::Ordering::Greater => high = mid - 1,
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Equal => {
                    self.log_word(mid as u32, 1).store(
                        ((invalidator as u64) << 32) | target as u64,
                        Ordering::Release,
                    );
                    return;
                }
            }
        }
    }

    fn table_slot(&self, bucket: u32) -> &AtomicU64 {
        debug_assert!(bucket < HASH_TABLE_ENTRIES);
        // Safety: bucket is in range, the word is 8-byte aligned, and the
        // mapping lives as long as self.
        unsafe { &*(self.map.as_mut_ptr().add(bucket as usize * 8) as *const AtomicU64) }
    }

    pub(crate) fn log_word(&self, entry: u32, word: u32) -> &AtomicU64 {
        debug_assert!(entry < SEARCH_INDEX_ENTRIES && word < 2);
        let offset = HASH_TABLE_SIZE + entry * 16 + word * 8;
        // Safety: entry is in range, the word is 8-byte aligned, and the
        // mapping lives as long as self.
        unsafe { &*(self.map.as_mut_ptr().add(offset as usize) as *const AtomicU64) }
    }

    fn bytes(&self, offset: u32, len: usize) -> &[u8] {
        debug_assert!(offset as usize + len <= FILE_SIZE as usize);
        // Safety: the range is inside the mapping and record bytes are
        // never rewritten once published.
        unsafe { slice::from_raw_parts(self.map.as_mut_ptr().add(offset as usize), len) }
    }

    fn write_bytes(&self, offset: u32, data: &[u8]) {
        debug_assert!(offset as usize + data.len() <= FILE_SIZE as usize);
        // Safety: only the single mutator writes, and only to regions no
        // published offset points into yet.
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.map.as_mut_ptr().add(offset as usize),
                data.len(),
            );
        }
    }

    fn zero_range(&self, offset: u32, len: usize) {
        debug_assert!(offset as usize + len <= FILE_SIZE as usize);
        // Safety: same as write_bytes.
        unsafe {
            ptr::write_bytes(self.map.as_mut_ptr().add(offset as usize), 0, len);
        }
    }

    pub(crate) fn record_version(&self, offset: u32) -> u64 {
        LittleEndian::read_u64(self.bytes(offset, 8))
    }

    fn record_key_size(&self, offset: u32) -> u32 {
        LittleEndian::read_u32(self.bytes(offset + 8, 4))
    }

    pub(crate) fn record_key(&self, offset: u32) -> &[u8] {
        let size = self.record_key_size(offset);
        self.bytes(offset + 12, size as usize)
    }

    pub(crate) fn record_value(&self, offset: u32) -> Vec<Vec<u8>> {
        let key_size = self.record_key_size(offset);
        let mut cursor = offset + 12 + key_size;
        let arity = LittleEndian::read_u16(self.bytes(cursor, 2));
        cursor += 2;

        let mut value = Vec::with_capacity(arity as usize);
        for _ in 0..arity {
            let size = LittleEndian::read_u32(self.bytes(cursor, 4));
            cursor += 4;
            value.push(self.bytes(cursor, size as usize).to_vec());
            cursor += size;
        }
        value
    }

    /// Decodes the length of the record at `offset`, bounds-checking every
    /// step so a corrupt file cannot walk out of the mapping.
    fn record_size_at(&self, offset: u32) -> Result<u32> {
        let corrupt = || Error::InvalidData(format!("record at offset {offset} is corrupt"));

        if offset as u64 + 14 > FILE_SIZE as u64 {
            return Err(corrupt());
        }
        let key_size = self.record_key_size(offset);
        let mut cursor = offset as u64 + 12 + key_size as u64;
        if cursor + 2 > FILE_SIZE as u64 {
            return Err(corrupt());
        }
        let arity = LittleEndian::read_u16(self.bytes(cursor as u32, 2));
        cursor += 2;

        for _ in 0..arity {
            if cursor + 4 > FILE_SIZE as u64 {
                return Err(corrupt());
            }
            let size = LittleEndian::read_u32(self.bytes(cursor as u32, 4));
            cursor += 4 + size as u64;
        }
        if cursor > FILE_SIZE as u64 {
            return Err(corrupt());
        }

        Ok((cursor - offset as u64) as u32)
    }
}

fn record_size(key: &[u8], value: &[Vec<u8>]) -> u64 {
    let mut size = 8 + 4 + key.len() as u64 + 2;
    for attr in value {
        size += 4 + attr.len() as u64;
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use tempfile::TempDir;

    fn primary(key: &[u8]) -> u32 {
        hash::hash_bytes(key) as u32
    }

    fn value(attr: &[u8]) -> Vec<Vec<u8>> {
        vec![attr.to_vec()]
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let shard = Shard::create(dir.path(), "shard").unwrap();

        shard.put(primary(b"a"), 7, b"a", &value(b"one"), 1).unwrap();
        shard.put(primary(b"b"), 8, b"b", &value(b"two"), 2).unwrap();

        assert_eq!(
            shard.get(primary(b"a"), b"a").unwrap(),
            Some((value(b"one"), 1))
        );
        assert_eq!(
            shard.get(primary(b"b"), b"b").unwrap(),
            Some((value(b"two"), 2))
        );
        assert_eq!(shard.get(primary(b"c"), b"c").unwrap(), None);
    }

    #[test]
    fn test_overwrite_invalidates_prior_entry() {
        let dir = TempDir::new().unwrap();
        let shard = Shard::create(dir.path(), "shard").unwrap();

        shard.put(primary(b"k"), 1, b"k", &value(b"v1"), 1).unwrap();
        shard.put(primary(b"k"), 1, b"k", &value(b"v2"), 2).unwrap();

        assert_eq!(
            shard.get(primary(b"k"), b"k").unwrap(),
            Some((value(b"v2"), 2))
        );

        // The first log entry now carries the second record's offset as
        // its invalidator.
        let invalidator = (shard.log_word(0, 1).load(Ordering::Relaxed) >> 32) as u32;
        let second_offset = shard.log_word(1, 1).load(Ordering::Relaxed) as u32;
        assert_eq!(invalidator, second_offset);
        assert!(shard.stale_space() > 0 || shard.search_limit() == 2);
    }

    #[test]
    fn test_del_then_get_not_found() {
        let dir = TempDir::new().unwrap();
        let shard = Shard::create(dir.path(), "shard").unwrap();

        shard.put(primary(b"k"), 1, b"k", &value(b"v"), 1).unwrap();
        assert!(shard.del(primary(b"k"), b"k").unwrap());
        assert_eq!(shard.get(primary(b"k"), b"k").unwrap(), None);

        // Deleting again is a no-op.
        assert!(!shard.del(primary(b"k"), b"k").unwrap());

        // The tombstone consumed an 8-byte placeholder.
        let data_used = shard.data_limit() - INDEX_SEGMENT_SIZE;
        let record = record_size(b"k", &value(b"v"));
        assert_eq!(data_used as u64, align8(record as u32) as u64 + 8);
    }

    #[test]
    fn test_probe_slot_stability_across_delete_and_reinsert() {
        let dir = TempDir::new().unwrap();
        let shard = Shard::create(dir.path(), "shard").unwrap();

        // Two keys forced onto the same probe chain.
        let h = 42u32;
        shard.put(h, 0, b"first", &value(b"1"), 1).unwrap();
        shard.put(h, 0, b"second", &value(b"2"), 2).unwrap();

        let (first_bucket, _) = shard.hash_lookup(h, b"first").unwrap();
        let (second_bucket, _) = shard.hash_lookup(h, b"second").unwrap();
        assert_ne!(first_bucket, second_bucket);

        // Delete and reinsert the first key: it must land in the same slot,
        // and the second key must stay reachable through the chain.
        assert!(shard.del(h, b"first").unwrap());
        assert_eq!(shard.get(h, b"second").unwrap(), Some((value(b"2"), 2)));
        shard.put(h, 0, b"first", &value(b"1b"), 3).unwrap();

        let (reinserted_bucket, _) = shard.hash_lookup(h, b"first").unwrap();
        assert_eq!(first_bucket, reinserted_bucket);
        assert_eq!(shard.get(h, b"first").unwrap(), Some((value(b"1b"), 3)));
        assert_eq!(shard.get(h, b"second").unwrap(), Some((value(b"2"), 2)));
    }

    #[test]
    fn test_search_log_monotone_with_zero_tail() {
        let dir = TempDir::new().unwrap();
        let shard = Shard::create(dir.path(), "shard").unwrap();

        for i in 0..64u32 {
            let key = format!("key-{i:03}");
            shard
                .put(primary(key.as_bytes()), i, key.as_bytes(), &value(b"v"), i as u64)
                .unwrap();
        }

        let mut prev = 0;
        for entry in 0..64 {
            let offset = shard.log_word(entry, 1).load(Ordering::Relaxed) as u32;
            assert!(offset > prev, "offsets must strictly increase");
            assert_eq!(offset % 8, 0);
            prev = offset;
        }
        for entry in 64..128 {
            assert_eq!(shard.log_word(entry, 1).load(Ordering::Relaxed), 0);
            assert_eq!(shard.log_word(entry, 0).load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn test_space_accounting() {
        let dir = TempDir::new().unwrap();
        let shard = Shard::create(dir.path(), "shard").unwrap();
        assert_eq!(shard.used_space(), 0);
        assert_eq!(shard.stale_space(), 0);
        assert_eq!(shard.free_space(), 100);

        // A record around 1% of the data segment.
        let big = vec![vec![0xabu8; DATA_SEGMENT_SIZE as usize / 100]];
        shard.put(primary(b"big"), 0, b"big", &big, 1).unwrap();
        assert!(shard.used_space() >= 1);
        assert_eq!(shard.stale_space(), 0);

        // Overwriting makes the first copy stale.
        shard.put(primary(b"big"), 0, b"big", &big, 2).unwrap();
        assert!(shard.stale_space() >= 1);
    }

    #[test]
    fn test_data_full_and_search_full() {
        let dir = TempDir::new().unwrap();
        let shard = Shard::create(dir.path(), "shard").unwrap();

        // A record bigger than the whole data segment cannot fit.
        let oversized = vec![vec![0u8; FILE_SIZE as usize]];
        assert_eq!(
            shard.put(primary(b"k"), 0, b"k", &oversized, 1),
            Err(Error::DataFull)
        );

        // Filling the data segment with large records trips DataFull long
        // before the search log runs out.
        let chunk = vec![vec![0x55u8; DATA_SEGMENT_SIZE as usize / 4]];
        let mut filled = 0;
        loop {
            let key = format!("fill-{filled}");
            match shard.put(primary(key.as_bytes()), 0, key.as_bytes(), &chunk, 1) {
                Ok(()) => filled += 1,
                Err(Error::DataFull) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!((3..=4).contains(&filled));
    }

    #[test]
    fn test_reopen_resumes_append_positions() {
        let dir = TempDir::new().unwrap();
        {
            let shard = Shard::create(dir.path(), "shard").unwrap();
            shard.put(primary(b"a"), 1, b"a", &value(b"one"), 1).unwrap();
            shard.put(primary(b"b"), 2, b"b", &value(b"two"), 2).unwrap();
            shard.sync().unwrap();
        }

        let shard = Shard::open(dir.path(), "shard").unwrap();
        assert_eq!(shard.search_limit(), 2);
        assert_eq!(
            shard.get(primary(b"a"), b"a").unwrap(),
            Some((value(b"one"), 1))
        );

        // Appends continue past the recovered offset.
        shard.put(primary(b"c"), 3, b"c", &value(b"three"), 3).unwrap();
        assert_eq!(
            shard.get(primary(b"c"), b"c").unwrap(),
            Some((value(b"three"), 3))
        );
        assert!(shard.fsck());
    }

    #[test]
    fn test_copy_to_filters_by_coordinate() {
        let dir = TempDir::new().unwrap();
        let src = Shard::create(dir.path(), "src").unwrap();

        // Secondary hashes 0 and 1 so a mask on bit 0 separates them.
        src.put(primary(b"even"), 0, b"even", &value(b"e"), 1).unwrap();
        src.put(primary(b"odd"), 1, b"odd", &value(b"o"), 2).unwrap();

        let dst = Shard::create(dir.path(), "dst").unwrap();
        let odd_region = Coordinate::new(0, 0, 1, 1);
        src.copy_to(&odd_region, &dst).unwrap();

        assert_eq!(dst.get(primary(b"even"), b"even").unwrap(), None);
        assert_eq!(
            dst.get(primary(b"odd"), b"odd").unwrap(),
            Some((value(b"o"), 2))
        );
        assert_eq!(dst.search_limit(), 1);
        assert!(dst.fsck());
    }

    #[test]
    fn test_copy_to_drops_stale_records() {
        let dir = TempDir::new().unwrap();
        let src = Shard::create(dir.path(), "src").unwrap();

        src.put(primary(b"k"), 0, b"k", &value(b"old"), 1).unwrap();
        src.put(primary(b"k"), 0, b"k", &value(b"new"), 2).unwrap();
        src.put(primary(b"gone"), 0, b"gone", &value(b"x"), 3).unwrap();
        assert!(src.del(primary(b"gone"), b"gone").unwrap());

        let dst = Shard::create(dir.path(), "dst").unwrap();
        src.copy_to(&Coordinate::everything(), &dst).unwrap();

        assert_eq!(
            dst.get(primary(b"k"), b"k").unwrap(),
            Some((value(b"new"), 2))
        );
        assert_eq!(dst.get(primary(b"gone"), b"gone").unwrap(), None);
        assert_eq!(dst.search_limit(), 1);
        assert_eq!(dst.stale_space(), 0);
    }

    #[test]
    fn test_copy_to_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let src = Shard::create(dir.path(), "src").unwrap();

        src.put(primary(b"a"), 0, b"a", &value(b"1"), 1).unwrap();
        src.put(primary(b"a"), 0, b"a", &value(b"2"), 2).unwrap();
        src.put(primary(b"b"), 1, b"b", &value(b"3"), 3).unwrap();

        // Cleaning a shard twice observes the same state as cleaning once.
        let once = Shard::create(dir.path(), "once").unwrap();
        src.copy_to(&Coordinate::everything(), &once).unwrap();
        let twice = Shard::create(dir.path(), "twice").unwrap();
        once.copy_to(&Coordinate::everything(), &twice).unwrap();

        assert_eq!(once.search_limit(), twice.search_limit());
        assert_eq!(once.data_limit(), twice.data_limit());
        assert_eq!(once.stale_space(), 0);
        assert_eq!(twice.stale_space(), 0);
        for (key, want) in [(&b"a"[..], (value(b"2"), 2)), (&b"b"[..], (value(b"3"), 3))] {
            assert_eq!(once.get(primary(key), key).unwrap(), Some(want.clone()));
            assert_eq!(twice.get(primary(key), key).unwrap(), Some(want));
        }
    }

    #[test]
    fn test_fsck_clean_after_mutations() {
        let dir = TempDir::new().unwrap();
        let shard = Shard::create(dir.path(), "shard").unwrap();

        for i in 0..32u32 {
            let key = format!("key-{i}");
            shard
                .put(primary(key.as_bytes()), i, key.as_bytes(), &value(b"v"), 1)
                .unwrap();
        }
        for i in (0..32u32).step_by(3) {
            let key = format!("key-{i}");
            assert!(shard.del(primary(key.as_bytes()), key.as_bytes()).unwrap());
        }
        for i in (0..32u32).step_by(6) {
            let key = format!("key-{i}");
            shard
                .put(primary(key.as_bytes()), i, key.as_bytes(), &value(b"w"), 2)
                .unwrap();
        }

        assert!(shard.fsck());
    }
}
