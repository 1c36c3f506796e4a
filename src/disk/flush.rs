use std::fs;
use std::sync::Arc;

use super::{Disk, CLEAN_THRESHOLD};
use crate::coordinate::Coordinate;
use crate::error::{Error, Result};
use crate::shard::{Shard, ShardVector};

/// Entries drained per flush call, bounding how long the mutator mutex is
/// held in one stretch.
const FLUSH_BATCH: usize = 100;

impl Disk {
    /// Applies up to [`FLUSH_BATCH`] WAL entries to shards, oldest first.
    /// The caller must hold the mutator mutex.
    ///
    /// A full shard stops the batch: the shard is cleaned or split, the
    /// offending entry stays queued, and the next flush retries it against
    /// the new vector.
    pub(crate) fn flush_batch(&self) -> Result<()> {
        for _ in 0..FLUSH_BATCH {
            let Some(entry) = self.wal.oldest() else {
                break;
            };
            let shards = self.current_shards()?;

            // Remove any prior version of the key, wherever it lives.
            let mut full_shard = None;
            for i in 0..shards.len() {
                if !shards.coordinate(i).primary_contains(&entry.coord) {
                    continue;
                }
                match shards.shard(i).del(entry.coord.primary_hash, &entry.key) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(Error::DataFull) => {
                        full_shard = Some(i);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if let Some(i) = full_shard {
                return self.handle_full_shard(&shards, i);
            }

            if entry.is_put() {
                // Back to front: split children are appended at the end of
                // the vector, so they win over a lingering parent.
                let mut full_shard = None;
                for i in (0..shards.len()).rev() {
                    if !shards.coordinate(i).contains(&entry.coord) {
                        continue;
                    }
                    match shards.shard(i).put(
                        entry.coord.primary_hash,
                        entry.coord.secondary_hash,
                        &entry.key,
                        &entry.value,
                        entry.version,
                    ) {
                        Ok(()) => break,
                        Err(Error::DataFull | Error::SearchFull | Error::HashFull) => {
                            full_shard = Some(i);
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
                if let Some(i) = full_shard {
                    return self.handle_full_shard(&shards, i);
                }
            }

            self.wal.remove_oldest();
        }

        Ok(())
    }

    /// A shard reported itself full. Reclaim stale space when there is
    /// enough of it; otherwise split four ways. A fully-masked shard can
    /// do neither.
    fn handle_full_shard(&self, shards: &Arc<ShardVector>, i: usize) -> Result<()> {
        let coord = shards.coordinate(i);
        if shards.shard(i).stale_space() >= CLEAN_THRESHOLD {
            self.clean_shard(shards, i)
        } else if coord.primary_mask == u32::MAX && coord.secondary_mask == u32::MAX {
            Err(Error::SplitFailed(format!(
                "shard {coord} is fully masked and cannot split"
            )))
        } else {
            self.split_shard(shards, i)
        }
    }

    /// Rewrites a shard's live records into a fresh `-tmp` file, renames
    /// it over the canonical name, and publishes the swapped vector. On
    /// failure the tmp file is unlinked and nothing is published.
    fn clean_shard(&self, shards: &Arc<ShardVector>, i: usize) -> Result<()> {
        let coord = shards.coordinate(i);
        let (tmp_name, replacement) = self.create_tmp_shard(&coord)?;

        let staged = (|| -> Result<Arc<ShardVector>> {
            shards.shard(i).copy_to(&coord, &replacement)?;
            let vector = shards.replace(i, Arc::clone(&replacement));
            fs::rename(self.config.dir.join(&tmp_name), self.shard_path(&coord))
                .map_err(|e| Error::DropFailed(e.to_string()))?;
            Ok(vector)
        })();

        match staged {
            Ok(vector) => {
                self.publish_shards(vector)?;
                tracing::info!(shard = %coord, "cleaned shard");
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(self.config.dir.join(&tmp_name));
                Err(e)
            }
        }
    }

    /// Splits a shard four ways: one secondary bit partitions the records
    /// into halves, one primary bit per half partitions again. The four
    /// children are built before the vector is swapped; on any failure the
    /// files created so far are unlinked and `SplitFailed` is reported.
    fn split_shard(&self, shards: &Arc<ShardVector>, i: usize) -> Result<()> {
        let coord = shards.coordinate(i);
        let shard = shards.shard(i);

        // Pass one: secondary-hash bit balance over the live records.
        let mut zeros = [0i64; 32];
        let mut ones = [0i64; 32];
        for record in Shard::snapshot(shard) {
            for bit in 0..32 {
                if coord.secondary_mask & (1u32 << bit) != 0 {
                    continue;
                }
                if record.secondary_hash & (1u32 << bit) != 0 {
                    ones[bit] += 1;
                } else {
                    zeros[bit] += 1;
                }
            }
        }
        let secondary_bit = 1u32 << which_to_split(coord.secondary_mask, &zeros, &ones);

        // Pass two: primary-hash bit balance within each secondary half.
        let mut zeros_lower = [0i64; 32];
        let mut ones_lower = [0i64; 32];
        let mut zeros_upper = [0i64; 32];
        let mut ones_upper = [0i64; 32];
        for record in Shard::snapshot(shard) {
            let (zeros, ones) = if record.secondary_hash & secondary_bit != 0 {
                (&mut zeros_upper, &mut ones_upper)
            } else {
                (&mut zeros_lower, &mut ones_lower)
            };
            for bit in 0..32 {
                if coord.primary_mask & (1u32 << bit) != 0 {
                    continue;
                }
                if record.primary_hash & (1u32 << bit) != 0 {
                    ones[bit] += 1;
                } else {
                    zeros[bit] += 1;
                }
            }
        }
        let lower_bit = 1u32 << which_to_split(coord.primary_mask, &zeros_lower, &ones_lower);
        let upper_bit = 1u32 << which_to_split(coord.primary_mask, &zeros_upper, &ones_upper);

        let child_coords = [
            Coordinate::new(
                coord.primary_mask | lower_bit,
                coord.primary_hash,
                coord.secondary_mask | secondary_bit,
                coord.secondary_hash,
            ),
            Coordinate::new(
                coord.primary_mask | upper_bit,
                coord.primary_hash,
                coord.secondary_mask | secondary_bit,
                coord.secondary_hash | secondary_bit,
            ),
            Coordinate::new(
                coord.primary_mask | lower_bit,
                coord.primary_hash | lower_bit,
                coord.secondary_mask | secondary_bit,
                coord.secondary_hash,
            ),
            Coordinate::new(
                coord.primary_mask | upper_bit,
                coord.primary_hash | upper_bit,
                coord.secondary_mask | secondary_bit,
                coord.secondary_hash | secondary_bit,
            ),
        ];

        let mut built: Vec<(Coordinate, Arc<Shard>)> = Vec::with_capacity(4);
        for child in child_coords {
            let staged = self.create_shard(&child).and_then(|new_shard| {
                shard.copy_to(&child, &new_shard)?;
                Ok(new_shard)
            });
            match staged {
                Ok(new_shard) => built.push((child, new_shard)),
                Err(e) => {
                    for (done, _) in &built {
                        let _ = fs::remove_file(self.shard_path(done));
                    }
                    let _ = fs::remove_file(self.shard_path(&child));
                    return Err(Error::SplitFailed(e.to_string()));
                }
            }
        }

        let children: [(Coordinate, Arc<Shard>); 4] = match built.try_into() {
            Ok(children) => children,
            Err(_) => {
                return Err(Error::SplitFailed(
                    "split produced fewer than four shards".into(),
                ))
            }
        };

        self.publish_shards(shards.split(i, children))?;

        // The parent file is superseded; a failed unlink only leaks space.
        let _ = fs::remove_file(self.shard_path(&coord));
        tracing::info!(shard = %coord, "split shard four ways");
        Ok(())
    }
}

/// Picks the unmasked bit whose one/zero counts are most balanced,
/// preferring lower-indexed bits on ties. Bit 0 is reserved and never
/// chosen; it is only the fallback when every bit is masked.
fn which_to_split(mask: u32, zeros: &[i64; 32], ones: &[i64; 32]) -> u32 {
    let mut best = 0u32;
    let mut diff = i64::MAX;

    for bit in 1..32 {
        if mask & (1u32 << bit) != 0 {
            continue;
        }
        let candidate = (ones[bit] - zeros[bit]).abs();
        if candidate < diff {
            best = bit as u32;
            diff = candidate;
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn attr(len: usize, fill: u8) -> Vec<Vec<u8>> {
        vec![vec![fill; len]]
    }

    fn drain(disk: &Disk) {
        while disk.pending_writes() > 0 {
            disk.flush().expect("flush failed");
        }
    }

    #[test]
    fn test_which_to_split_prefers_balanced_bits() {
        let mut zeros = [0i64; 32];
        let mut ones = [0i64; 32];

        // Bit 3 is perfectly balanced, everything else lopsided.
        for bit in 1..32 {
            zeros[bit] = 100;
            ones[bit] = if bit == 3 { 100 } else { 10 };
        }
        assert_eq!(which_to_split(0, &zeros, &ones), 3);

        // A masked bit is never chosen, even when balanced; the remaining
        // bits tie and the lowest wins.
        assert_eq!(which_to_split(1 << 3, &zeros, &ones), 1);

        // Bit 0 is never a candidate.
        zeros = [0; 32];
        ones = [0; 32];
        assert_eq!(which_to_split(0, &zeros, &ones), 1);
    }

    #[test]
    fn test_fill_splits_shard_and_keeps_records() {
        let dir = TempDir::new().unwrap();
        let disk = Disk::open(dir.path().join("disk"), 2).unwrap();

        // Enough 8 KiB records to overflow one shard's data segment.
        let n = 2200u32;
        for i in 0..n {
            let key = format!("key-{i:05}");
            disk.put(key.as_bytes(), attr(8 * 1024, (i % 251) as u8), i as u64)
                .unwrap();
            // Keep the WAL's memory footprint bounded while filling.
            if i % 200 == 199 {
                drain(&disk);
            }
        }
        drain(&disk);

        // The vector grew by at least one four-way split.
        assert!(disk.shard_count() >= 4, "expected a split to have happened");

        // Every record survived, each in exactly one shard.
        assert_eq!(disk.snapshot().unwrap().count(), n as usize);
        for i in (0..n).step_by(97) {
            let key = format!("key-{i:05}");
            assert_eq!(
                disk.get(key.as_bytes()).unwrap(),
                Some((attr(8 * 1024, (i % 251) as u8), i as u64)),
                "missing {key} after split"
            );
        }
    }

    #[test]
    fn test_overwrite_churn_cleans_shard_in_place() {
        let dir = TempDir::new().unwrap();
        let disk = Disk::open(dir.path().join("disk"), 2).unwrap();

        // Overwriting a small key set leaves almost everything stale, so
        // hitting the data limit must clean rather than split.
        let keys: Vec<String> = (0..100).map(|i| format!("key-{i:03}")).collect();
        for round in 0..8u64 {
            for key in &keys {
                disk.put(key.as_bytes(), attr(40 * 1024, round as u8), round)
                    .unwrap();
            }
            drain(&disk);
        }

        assert_eq!(disk.shard_count(), 1, "churn must clean, not split");
        for key in &keys {
            assert_eq!(
                disk.get(key.as_bytes()).unwrap(),
                Some((attr(40 * 1024, 7), 7)),
                "missing {key} after clean"
            );
        }

        // The rewritten shard holds only live records.
        let shards = disk.current_shards().unwrap();
        assert_eq!(shards.coordinate(0), Coordinate::everything());
        assert_eq!(disk.snapshot().unwrap().count(), keys.len());
    }

    #[test]
    fn test_split_consumes_spares() {
        let dir = TempDir::new().unwrap();
        let disk = Disk::open(dir.path().join("disk"), 2).unwrap();
        disk.preallocate().unwrap();
        let before = disk.spares.lock().unwrap().len();
        assert_eq!(before, 4);

        for i in 0..2200u32 {
            let key = format!("key-{i:05}");
            disk.put(key.as_bytes(), attr(8 * 1024, 1), i as u64).unwrap();
            if i % 200 == 199 {
                drain(&disk);
            }
        }
        drain(&disk);

        assert!(disk.shard_count() >= 4);
        assert!(disk.spares.lock().unwrap().len() < before);
    }
}
