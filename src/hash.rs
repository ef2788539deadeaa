use ring::digest;

/// Lowercase hex of the SHA-256 of the key. Filename-safe, collision-free
/// for practical purposes; this is the mangler the surrounding region is
/// expected to apply before keys reach the backend.
pub fn key_identifier(key: &str) -> String {
    let digest = digest::digest(&digest::SHA256, key.as_bytes());
    data_encoding::HEXLOWER.encode(digest.as_ref())
}

/// Map a key to a uniformly distributed byte offset in `[0, 2^63)`, used as
/// the position of its 1-byte advisory lock. The range stays within the
/// signed 64-bit `l_start` accepted by fcntl. Collisions merely serialize
/// two unrelated keys.
pub fn key_offset(key: &str) -> u64 {
    let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, key.as_bytes());
    let bytes = digest.as_ref();
    // the big-endian digest mod 2^63 is just its low 63 bits
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&bytes[bytes.len() - 8..]);
    u64::from_be_bytes(tail) & (i64::MAX as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_key_identifier() {
        assert_eq!(
            key_identifier(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            key_identifier("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_key_offset() {
        // low 63 bits of sha1("") = ...95601890afd80709
        assert_eq!(key_offset(""), 0x15601890afd80709);
        // sha1("hello") ends in 3b482cd9aea9434d, top bit already clear
        assert_eq!(key_offset("hello"), 0x3b482cd9aea9434d);
    }

    #[test]
    fn test_key_offset_fits_lockf_range() {
        for key in ["", "a", "b", "hello", "some/longer key with spaces"] {
            assert!(key_offset(key) < 1 << 63);
            // deterministic
            assert_eq!(key_offset(key), key_offset(key));
        }
        assert_ne!(key_offset("a"), key_offset("b"));
    }
}
