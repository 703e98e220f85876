//! Hashing helpers used by the router and the table engine.
//!
//! The router needs two hash functions: one over a single `u64` (vnode names,
//! dense table keys) and one that mixes a pair of `u64`s (table id + sparse
//! id) into a single ring position. Both are built on `xxh3`, which is
//! already a workspace dependency, rather than `std`'s `SipHash` default,
//! since we need a stable, fast, non-DoS-resistant hash for routing (no
//! adversarial input model here).

use xxhash_rust::xxh3::xxh3_64;

/// Hash an arbitrary byte string into a ring position.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Hash a single `u64` key (used for dense table routing: `hash(table_id)`).
pub fn hash_u64(v: u64) -> u64 {
    hash_bytes(&v.to_le_bytes())
}

/// Mix a table id and a sparse row id into one hash, used for sparse row
/// routing: `hash(table_id, sparse_id)`.
pub fn mix_u64(table_id: u64, sparse_id: u64) -> u64 {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&table_id.to_le_bytes());
    buf[8..].copy_from_slice(&sparse_id.to_le_bytes());
    hash_bytes(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_is_order_sensitive() {
        assert_ne!(mix_u64(1, 2), mix_u64(2, 1));
    }

    #[test]
    fn hash_u64_is_deterministic() {
        assert_eq!(hash_u64(42), hash_u64(42));
    }
}
