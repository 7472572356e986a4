//! AES-128-CFB-128 stream cipher, keyed and seeded per call.
//!
//! The handshake and the relay frames both re-initialise the cipher
//! with a fresh IV for every message rather than running one
//! continuously advancing stream. So there is no persistent stream
//! state to carry here, just a key and an IV, fed in fresh each time.
use aes::Aes128;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};

type Aes128CfbEnc = Encryptor<Aes128>;
type Aes128CfbDec = Decryptor<Aes128>;

/// Encrypts `buf` in place under AES-128-CFB(`key`, `iv`).
pub fn encrypt_in_place(key: &[u8; 16], iv: &[u8; 16], buf: &mut [u8]) {
    Aes128CfbEnc::new(key.into(), iv.into()).encrypt(buf);
}

/// Decrypts `buf` in place under AES-128-CFB(`key`, `iv`).
pub fn decrypt_in_place(key: &[u8; 16], iv: &[u8; 16], buf: &mut [u8]) {
    Aes128CfbDec::new(key.into(), iv.into()).decrypt(buf);
}

/// The per-connection relay session: one shared 16-byte key, used with
/// an independent, per-frame IV in each direction (the IV always rides
/// in the frame itself, so nothing here needs to persist across
/// frames either).
#[derive(Clone, Copy)]
pub struct SessionKey(pub [u8; 16]);

impl SessionKey {
    pub fn encrypt_frame(&self, iv: &[u8; 16], buf: &mut [u8]) {
        encrypt_in_place(&self.0, iv, buf);
    }

    pub fn decrypt_frame(&self, iv: &[u8; 16], buf: &mut [u8]) {
        decrypt_in_place(&self.0, iv, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_length() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let mut buf = plaintext.to_vec();
        encrypt_in_place(&key, &iv, &mut buf);
        assert_ne!(&buf[..], &plaintext[..]);
        decrypt_in_place(&key, &iv, &mut buf);
        assert_eq!(&buf[..], &plaintext[..]);
    }

    #[test]
    fn round_trips_full_relay_frame_payload() {
        let key = [1u8; 16];
        let iv = [2u8; 16];
        let mut plain = vec![0xABu8; 4096];
        let original = plain.clone();
        encrypt_in_place(&key, &iv, &mut plain);
        decrypt_in_place(&key, &iv, &mut plain);
        assert_eq!(plain, original);
    }

    #[test]
    fn session_key_wrapper_round_trips() {
        let sk = SessionKey([3u8; 16]);
        let iv = [4u8; 16];
        let mut buf = b"session payload".to_vec();
        let original = buf.clone();
        sk.encrypt_frame(&iv, &mut buf);
        assert_ne!(buf, original);
        sk.decrypt_frame(&iv, &mut buf);
        assert_eq!(buf, original);
    }
}
