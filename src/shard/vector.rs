use std::sync::Arc;

use super::Shard;
use crate::coordinate::Coordinate;

/// An immutable ordered sequence of `(Coordinate, Shard)` pairs.
///
/// The disk publishes one vector at a time; every change builds a new
/// vector and swaps the shared pointer. Split children are appended at the
/// end: the flush path scans back to front, so after a split the narrower
/// children win over a lingering parent.
pub struct ShardVector {
    entries: Vec<(Coordinate, Arc<Shard>)>,
}

impl ShardVector {
    pub fn new(coordinate: Coordinate, shard: Arc<Shard>) -> Arc<Self> {
        Arc::new(Self {
            entries: vec![(coordinate, shard)],
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn coordinate(&self, i: usize) -> Coordinate {
        self.entries[i].0
    }

    pub fn shard(&self, i: usize) -> &Arc<Shard> {
        &self.entries[i].1
    }

    /// A new vector with the shard at `i` swapped and every coordinate
    /// unchanged.
    pub fn replace(&self, i: usize, shard: Arc<Shard>) -> Arc<ShardVector> {
        let mut entries = self.entries.clone();
        entries[i] = (entries[i].0, shard);
        Arc::new(ShardVector { entries })
    }

    /// A new vector with slot `i` removed and the four split children
    /// appended at the end.
    pub fn split(&self, i: usize, children: [(Coordinate, Arc<Shard>); 4]) -> Arc<ShardVector> {
        let mut entries = self.entries.clone();
        entries.remove(i);
        entries.extend(children);
        Arc::new(ShardVector { entries })
    }
}
