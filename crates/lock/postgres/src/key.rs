use std::hash::Hasher;

use fnv::FnvHasher;

/// Map `prefix + key` to a Postgres advisory lock id.
///
/// FNV-1a 64 over the concatenated bytes, reinterpreted as a signed 64-bit
/// integer (Postgres advisory lock keys occupy the full `bigint` range, so
/// negative ids are fine).
pub(crate) fn advisory_lock_id(prefix: &str, key: &str) -> i64 {
    let mut hasher = FnvHasher::default();
    hasher.write(prefix.as_bytes());
    hasher.write(key.as_bytes());
    i64::from_ne_bytes(hasher.finish().to_ne_bytes())
}
