use crc::{Algorithm, Crc};

// Routing hashes must be stable across processes and releases, so the
// standard library hashers are out. CRC-64 gives a deterministic 64-bit
// digest that is cheap to compute on short keys.
pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA);

/// Stable 64-bit hash of an opaque byte string.
pub fn hash_bytes(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

/// Hashes every attribute of a value independently.
pub fn hash_attributes(attrs: &[Vec<u8>]) -> Vec<u64> {
    attrs.iter().map(|a| hash_bytes(a)).collect()
}

/// Interlaces the low-order bits of the given hashes into a single word.
///
/// Bit `k` of the result is bit `k / n` of `hashes[k % n]`, so every
/// attribute contributes alternating bit positions and a secondary mask
/// prefix constrains every attribute at once.
pub fn lower_interlace(hashes: &[u64]) -> u64 {
    if hashes.is_empty() {
        return 0;
    }

    let n = hashes.len();
    let mut interlaced = 0u64;

    for bit in 0..64 {
        let source = (hashes[bit % n] >> (bit / n)) & 1;
        interlaced |= source << bit;
    }

    interlaced
}
