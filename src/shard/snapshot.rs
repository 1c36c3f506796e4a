use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::Shard;

/// A decoded record yielded by a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub primary_hash: u32,
    pub secondary_hash: u32,
    pub key: Vec<u8>,
    pub value: Vec<Vec<u8>>,
    pub version: u64,
}

/// Iterator over the records that were live when the snapshot was taken.
///
/// The snapshot pins the search-log and data horizons at creation time.
/// Entries appended later fall outside the horizons, and entries
/// invalidated later carry an invalidator at or past the data horizon, so
/// both kinds of concurrent mutation leave the yielded set unchanged.
pub struct ShardSnapshot {
    shard: Arc<Shard>,
    limit_entries: u32,
    limit_data: u32,
    entry: u32,
}

impl ShardSnapshot {
    pub(crate) fn new(shard: Arc<Shard>) -> Self {
        let limit_entries = shard.search_limit();
        let limit_data = shard.data_limit();
        Self {
            shard,
            limit_entries,
            limit_data,
            entry: 0,
        }
    }
}

impl Iterator for ShardSnapshot {
    type Item = SnapshotEntry;

    fn next(&mut self) -> Option<SnapshotEntry> {
        while self.entry < self.limit_entries {
            let entry = self.entry;
            self.entry += 1;

            let offsets = self.shard.log_word(entry, 1).load(Ordering::Relaxed);
            let offset = offsets as u32;
            if offset == 0 {
                break;
            }

            // An invalidator below the data horizon predates the snapshot;
            // at or past it, the record was still live when we started.
            let invalidator = (offsets >> 32) as u32;
            if invalidator != 0 && invalidator < self.limit_data {
                continue;
            }

            let hashes = self.shard.log_word(entry, 0).load(Ordering::Relaxed);
            return Some(SnapshotEntry {
                primary_hash: hashes as u32,
                secondary_hash: (hashes >> 32) as u32,
                key: self.shard.record_key(offset).to_vec(),
                value: self.shard.record_value(offset),
                version: self.shard.record_version(offset),
            });
        }

        None
    }
}
