use std::fmt;

use serde::{Deserialize, Serialize};

/// A region of the (primary, secondary) hyperspace.
///
/// Each half is a mask/hash pair: a record falls inside the region when its
/// hash agrees with the region's hash on every masked bit. A mask bit that
/// is clear matches every value in that position, so `(0, 0, 0, 0)` is the
/// whole hyperspace and fully-masked coordinates pin down a single point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub primary_mask: u32,
    pub primary_hash: u32,
    pub secondary_mask: u32,
    pub secondary_hash: u32,
}

impl Coordinate {
    pub const fn new(
        primary_mask: u32,
        primary_hash: u32,
        secondary_mask: u32,
        secondary_hash: u32,
    ) -> Self {
        Self {
            primary_mask,
            primary_hash,
            secondary_mask,
            secondary_hash,
        }
    }

    /// The region covering the entire hyperspace.
    pub const fn everything() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// The point coordinate of a single record.
    pub const fn point(primary_hash: u32, secondary_hash: u32) -> Self {
        Self::new(u32::MAX, primary_hash, u32::MAX, secondary_hash)
    }

    /// True when every point of `other` falls within `self`, judging only by
    /// the primary half.
    pub fn primary_contains(&self, other: &Coordinate) -> bool {
        self.primary_mask & (self.primary_hash ^ other.primary_hash) == 0
    }

    /// True when every point of `other` falls within `self`.
    pub fn contains(&self, other: &Coordinate) -> bool {
        self.primary_contains(other)
            && self.secondary_mask & (self.secondary_hash ^ other.secondary_hash) == 0
    }

    /// True when the two regions share at least one point: their hashes
    /// agree on every bit masked by both.
    pub fn intersects(&self, other: &Coordinate) -> bool {
        (self.primary_mask & other.primary_mask) & (self.primary_hash ^ other.primary_hash) == 0
            && (self.secondary_mask & other.secondary_mask)
                & (self.secondary_hash ^ other.secondary_hash)
                == 0
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}-{:016x}-{:016x}-{:016x}",
            self.primary_mask, self.primary_hash, self.secondary_mask, self.secondary_hash
        )
    }
}
