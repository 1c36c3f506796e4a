//! Supervisor of the shard set.
//!
//! Locking doctrine: at most one thread mutates shards at a time, whether
//! that is draining the WAL or cleaning/splitting a shard; `mutate`
//! enforces this. `shards` guards the *pointer* to the published
//! [`ShardVector`], never its contents: readers briefly lock it to clone
//! the pointer, the mutator locks it only to swap in a new vector. `get`
//! tolerates reading a stale vector because it opens a WAL cursor first —
//! any write whose shard-side commit the stale walk could miss is still
//! inside the cursor's horizon.

mod flush;
mod tasks;

pub use tasks::{AsyncTask, FlushTask, PreallocateTask};

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};

use crate::config::DiskConfig;
use crate::coordinate::Coordinate;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::hash;
use crate::scheduler::Scheduler;
use crate::shard::{Shard, ShardSnapshot, ShardVector, SnapshotEntry};
use crate::wal::{LogEntry, Wal};

const LOCK_FILE: &str = "hypershard.lock";
const SPARE_POOL_CAP: usize = 16;
const CLEAN_THRESHOLD: u32 = 30;

/// A hyperspace-partitioned disk: a dynamic set of shards indexed by
/// coordinate, fed by an in-memory WAL.
pub struct Disk {
    config: DiskConfig,
    _lock: FileLock,
    /// Serializes structural shard mutation: WAL drain, clean, split, drop.
    mutate: Mutex<()>,
    /// Guards the pointer to the published vector, not its contents.
    shards: RwLock<Arc<ShardVector>>,
    wal: Wal,
    spares: Mutex<VecDeque<(String, Arc<Shard>)>>,
    spare_counter: AtomicU64,
}

impl Disk {
    /// Opens a disk directory with the given arity, claiming it
    /// exclusively and starting from a single shard that covers the whole
    /// hyperspace.
    pub fn open(dir: impl Into<PathBuf>, arity: u16) -> Result<Disk> {
        Self::open_with_config(DiskConfig::new(dir, arity))
    }

    pub fn open_with_config(config: DiskConfig) -> Result<Disk> {
        fs::create_dir_all(&config.dir)
            .map_err(|e| Error::MissingDisk(format!("cannot create {}: {e}", config.dir.display())))?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE))
            .map_err(|e| Error::MissingDisk(format!("cannot claim {}: {e}", config.dir.display())))?;

        let start = Coordinate::everything();
        let shard = Shard::create(&config.dir, &shard_filename(&start))?;
        let shards = RwLock::new(ShardVector::new(start, shard));

        Ok(Disk {
            config,
            _lock: lock,
            mutate: Mutex::new(()),
            shards,
            wal: Wal::new(),
            spares: Mutex::new(VecDeque::new()),
            spare_counter: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    pub fn arity(&self) -> u16 {
        self.config.arity
    }

    /// WAL entries not yet applied to shards.
    pub fn pending_writes(&self) -> usize {
        self.wal.len()
    }

    /// Number of shards in the published vector.
    pub fn shard_count(&self) -> usize {
        self.shards.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Point lookup. Walks the published shards, then overrides the result
    /// with any matching WAL entry; the last matching entry wins.
    pub fn get(&self, key: &[u8]) -> Result<Option<(Vec<Vec<u8>>, u64)>> {
        let coord = lookup_coordinate(key);

        // Cursor before vector snapshot; see the module doctrine above.
        let cursor = self.wal.cursor();
        let shards = self.current_shards()?;

        let mut shard_res = None;
        for i in 0..shards.len() {
            if !shards.coordinate(i).primary_contains(&coord) {
                continue;
            }
            if let Some(found) = shards.shard(i).get(coord.primary_hash, key)? {
                shard_res = Some(found);
                break;
            }
        }

        let mut overridden = false;
        let mut wal_res = None;
        for entry in cursor {
            if entry.coord.primary_contains(&coord) && entry.key == key {
                wal_res = entry.is_put().then_some((entry.value, entry.version));
                overridden = true;
            }
        }

        if overridden {
            Ok(wal_res)
        } else {
            Ok(shard_res)
        }
    }

    /// Appends a put to the WAL. No shard is touched.
    pub fn put(&self, key: &[u8], value: Vec<Vec<u8>>, version: u64) -> Result<()> {
        if value.len() + 1 != self.config.arity as usize {
            return Err(Error::WrongArity);
        }
        let coord = record_coordinate(key, &value);
        self.wal
            .append(LogEntry::put(coord, key.to_vec(), value, version));
        self.throttle()
    }

    /// Appends a delete to the WAL. No shard is touched.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        let coord = lookup_coordinate(key);
        self.wal.append(LogEntry::del(coord, key.to_vec()));
        self.throttle()
    }

    /// Drains up to one batch of WAL entries into shards. Returns
    /// immediately when another thread is already mutating.
    pub fn flush(&self) -> Result<()> {
        let _guard = match self.mutate.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(()),
            Err(TryLockError::Poisoned(e)) => return Err(e.into()),
        };
        self.flush_batch()
    }

    /// Schedules an asynchronous msync of every shard. All shards are
    /// attempted even when one fails.
    pub fn async_sync(&self) -> Result<()> {
        let shards = self.current_shards()?;
        let mut failed = None;
        for i in 0..shards.len() {
            if let Err(e) = shards.shard(i).async_sync() {
                tracing::warn!(shard = %shards.coordinate(i), error = %e, "async msync failed");
                failed = Some(e);
            }
        }
        failed.map_or(Ok(()), Err)
    }

    /// Synchronously msyncs every shard. All shards are attempted even
    /// when one fails.
    pub fn sync(&self) -> Result<()> {
        let shards = self.current_shards()?;
        let mut failed = None;
        for i in 0..shards.len() {
            if let Err(e) = shards.shard(i).sync() {
                tracing::warn!(shard = %shards.coordinate(i), error = %e, "msync failed");
                failed = Some(e);
            }
        }
        failed.map_or(Ok(()), Err)
    }

    /// Tops up the spare shard pool based on how close the live shards are
    /// to cleaning or splitting. Shards that are nearly full are about to
    /// be dealt with, so the emptier the shard, the more spares it may
    /// eventually need; cleans only ever take one file.
    pub fn preallocate(&self) -> Result<()> {
        if self.spares.lock()?.len() >= SPARE_POOL_CAP {
            return Ok(());
        }

        let shards = self.current_shards()?;
        let mut needed = 0usize;
        for i in 0..shards.len() {
            let shard = shards.shard(i);
            let stale = shard.stale_space();
            let free = shard.free_space();
            needed += if free <= 25 {
                0
            } else if free <= 50 {
                1
            } else if free <= 75 {
                if stale >= CLEAN_THRESHOLD {
                    1
                } else {
                    2
                }
            } else if stale >= CLEAN_THRESHOLD {
                1
            } else {
                4
            };
        }

        let target = needed.saturating_sub(self.spares.lock()?.len());
        for _ in 0..target {
            if self.spares.lock()?.len() >= SPARE_POOL_CAP {
                break;
            }
            let n = self.spare_counter.fetch_add(1, Ordering::SeqCst);
            let name = format!("spare-{n}");
            let shard = Shard::create(&self.config.dir, &name)?;
            self.spares.lock()?.push_back((name, shard));
        }

        Ok(())
    }

    /// Unlinks every shard file, spare, and the lock file, then removes
    /// the directory. Partial failures are reported as `DropFailed` but do
    /// not stop the sweep.
    pub fn drop_disk(&self) -> Result<()> {
        let _mutate = self.mutate.lock()?;
        let shards_guard = self.shards.write()?;
        let shards = shards_guard.clone();

        let mut failed = None;
        for i in 0..shards.len() {
            let path = self.config.dir.join(shard_filename(&shards.coordinate(i)));
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to unlink shard file");
                failed = Some(Error::DropFailed(e.to_string()));
            }
        }

        for (name, _) in self.spares.lock()?.drain(..) {
            if let Err(e) = fs::remove_file(self.config.dir.join(&name)) {
                tracing::warn!(spare = name, error = %e, "failed to unlink spare file");
                failed = Some(Error::DropFailed(e.to_string()));
            }
        }
        let _ = fs::remove_file(self.config.dir.join(LOCK_FILE));

        if failed.is_none() {
            if let Err(e) = fs::remove_dir(&self.config.dir) {
                failed = Some(Error::DropFailed(e.to_string()));
            }
        }

        failed.map_or(Ok(()), Err)
    }

    /// A consistent snapshot of every live record: the WAL is drained
    /// under the mutator mutex, then the per-shard snapshots are chained.
    /// A key lives in at most one shard, so each record is yielded once.
    pub fn snapshot(&self) -> Result<DiskSnapshot> {
        let _guard = self.mutate.lock()?;
        while !self.wal.is_empty() {
            self.flush_batch()?;
        }

        let shards = self.current_shards()?;
        let snapshots = (0..shards.len())
            .map(|i| Shard::snapshot(shards.shard(i)))
            .collect();
        Ok(DiskSnapshot { snapshots })
    }

    /// Runs fsck on every shard in the published vector.
    pub fn fsck(&self) -> Result<bool> {
        let shards = self.current_shards()?;
        let mut ok = true;
        for i in 0..shards.len() {
            if !shards.shard(i).fsck() {
                tracing::warn!(shard = %shards.coordinate(i), "shard failed fsck");
                ok = false;
            }
        }
        Ok(ok)
    }

    /// Registers the disk's periodic maintenance tasks with a scheduler.
    pub fn start(disk: &Arc<Disk>, scheduler: &Scheduler) {
        scheduler
            .register(Arc::new(FlushTask::new(Arc::clone(disk))))
            .register(Arc::new(PreallocateTask::new(Arc::clone(disk))))
            .register(Arc::new(AsyncTask::new(Arc::clone(disk))));
    }

    /// Inline backpressure: a writer that finds the WAL past the
    /// high-water mark drains a batch itself instead of racing ahead of
    /// the flusher.
    fn throttle(&self) -> Result<()> {
        if self.wal.len() > self.config.wal_high_water {
            self.flush()?;
        }
        Ok(())
    }

    pub(crate) fn current_shards(&self) -> Result<Arc<ShardVector>> {
        Ok(self.shards.read()?.clone())
    }

    pub(crate) fn publish_shards(&self, vector: Arc<ShardVector>) -> Result<()> {
        *self.shards.write()? = vector;
        Ok(())
    }

    pub(crate) fn shard_path(&self, coord: &Coordinate) -> PathBuf {
        self.config.dir.join(shard_filename(coord))
    }

    /// Creates a shard file under the coordinate's canonical name,
    /// preferring a renamed spare over fresh allocation.
    pub(crate) fn create_shard(&self, coord: &Coordinate) -> Result<Arc<Shard>> {
        self.materialize_shard(&shard_filename(coord))
    }

    /// Creates a shard file under the coordinate's in-flight `-tmp` name.
    pub(crate) fn create_tmp_shard(&self, coord: &Coordinate) -> Result<(String, Arc<Shard>)> {
        let name = shard_tmp_filename(coord);
        let shard = self.materialize_shard(&name)?;
        Ok((name, shard))
    }

    fn materialize_shard(&self, name: &str) -> Result<Arc<Shard>> {
        let spare = self.spares.lock()?.pop_front();
        if let Some((spare_name, shard)) = spare {
            fs::rename(
                self.config.dir.join(&spare_name),
                self.config.dir.join(name),
            )?;
            Ok(shard)
        } else {
            Shard::create(&self.config.dir, name)
        }
    }
}

/// Iterator chaining every shard's snapshot, in vector order.
pub struct DiskSnapshot {
    snapshots: VecDeque<ShardSnapshot>,
}

impl Iterator for DiskSnapshot {
    type Item = SnapshotEntry;

    fn next(&mut self) -> Option<SnapshotEntry> {
        while let Some(snapshot) = self.snapshots.front_mut() {
            if let Some(entry) = snapshot.next() {
                return Some(entry);
            }
            self.snapshots.pop_front();
        }
        None
    }
}

/// Coordinate used for lookups and deletes: primary half pinned to the
/// key's hash, secondary half free.
pub(crate) fn lookup_coordinate(key: &[u8]) -> Coordinate {
    Coordinate::new(u32::MAX, hash::hash_bytes(key) as u32, 0, 0)
}

/// Fully-masked point coordinate of a record: the secondary hash
/// interlaces the low bits of every attribute hash.
pub(crate) fn record_coordinate(key: &[u8], value: &[Vec<u8>]) -> Coordinate {
    let secondary = hash::lower_interlace(&hash::hash_attributes(value));
    Coordinate::new(
        u32::MAX,
        hash::hash_bytes(key) as u32,
        u32::MAX,
        secondary as u32,
    )
}

/// Canonical shard filename: the four coordinate words as 16-hex-digit
/// lowercase zero-padded groups.
pub(crate) fn shard_filename(coord: &Coordinate) -> String {
    coord.to_string()
}

fn shard_tmp_filename(coord: &Coordinate) -> String {
    format!("{coord}-tmp")
}
