//! SHA-1 and challenge generation for cookie authentication.

use rand::RngCore;

/// Number of random bytes in an auth challenge. RFC 2831 suggests at least
/// 64 bits of entropy; 128 are used here.
pub(crate) const N_CHALLENGE_BYTES: usize = 128 / 8;

/// Hex-encoded SHA-1 digest of `data`.
pub(crate) fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = sha1_smol::Sha1::new();
    hasher.update(data);
    hasher.hexdigest()
}

/// A fresh hex-encoded 128-bit random challenge.
pub(crate) fn random_challenge_hex() -> String {
    let mut bytes = [0u8; N_CHALLENGE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Random hex string of `len` nibbles, for cookie secrets and socket names.
pub(crate) fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut s = hex::encode(bytes);
    s.truncate(len);
    s
}

/// Constant-time equality over ASCII hex digests.
///
/// Cookie verification must not leak how much of the hash matched.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        // sha1("abc")
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(sha1_hex(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn challenges_are_fresh_and_hex() {
        let a = random_challenge_hex();
        let b = random_challenge_hex();
        assert_eq!(a.len(), N_CHALLENGE_BYTES * 2);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn digest_comparison() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
