//! Cryptographic primitives used by the handshake and relay: secure
//! random bytes, AES-128-CFB-128, and the SHA-256 key derivation used
//! by the user directory.
pub mod random;
pub mod session;

use sha2::{Digest, Sha256};

/// `SHA-256(password)`, the 32-byte digest stored as a user's
/// long-term key.
pub fn hash_password(password: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password);
    hasher.finalize().into()
}

/// The first 16 bytes of a 32-byte digest, truncated to an AES-128 key.
///
/// The user record and the session-key reply both carry 32 bytes of
/// key material on the wire or in the directory, but AES-128 only
/// consumes 16; this is the single place that truncation happens so it
/// can never be accidentally skipped at a cipher-init call site.
pub fn truncate_key(digest: &[u8; 32]) -> [u8; 16] {
    digest[..16].try_into().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_password(b"hunter2"), hash_password(b"hunter2"));
        assert_ne!(hash_password(b"hunter2"), hash_password(b"hunter3"));
    }

    #[test]
    fn truncation_takes_first_half() {
        let digest = hash_password(b"hunter2");
        let key = truncate_key(&digest);
        assert_eq!(&key[..], &digest[..16]);
    }
}
