use std::hash::Hasher;

use fnv::FnvHasher;

/// Map `prefix + key` to a MySQL named-lock identifier.
///
/// FNV-1a 64 over the concatenated bytes, rendered as a 16-character hex
/// string. MySQL caps lock names at 64 characters, so hashing keeps arbitrary
/// caller keys inside the limit.
pub(crate) fn named_lock_id(prefix: &str, key: &str) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(prefix.as_bytes());
    hasher.write(key.as_bytes());
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteen_hex_chars() {
        let id = named_lock_id("ncps:lock:", "download:abc");
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn stable_and_prefix_scoped() {
        assert_eq!(
            named_lock_id("ncps:lock:", "k"),
            named_lock_id("ncps:lock:", "k")
        );
        assert_ne!(named_lock_id("ncps:lock:", "k"), named_lock_id("other:", "k"));
    }

    #[test]
    fn fnv1a_offset_basis() {
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(named_lock_id("", ""), "cbf29ce484222325");
    }
}
