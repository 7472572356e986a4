//! On-wire framing for the authenticated handshake and the relay
//! frames, normative byte-for-byte.
//!
//! These are pure functions over fixed-size byte arrays so the framing
//! itself is testable without a socket in sight.
use crate::buffer::HANDSHAKE_SIZE;
use crate::crypto::random;
use crate::crypto::session::{decrypt_in_place, encrypt_in_place};
use crate::error::{Error, Result};
use crate::socks5::{self, Target};

pub const FRAME_PAYLOAD: usize = 4096;
pub const IV_LEN: usize = 16;
pub const RELAY_FRAME_SIZE: usize = FRAME_PAYLOAD + IV_LEN;
const LENGTH_OFFSET: usize = FRAME_PAYLOAD - 2;

/// The cleartext prefix of a handshake block: `IV (16) | name_len (1) |
/// username (name_len)`.
pub struct HandshakePrefix {
    pub iv: [u8; 16],
    pub username: String,
    /// Offset of the first encrypted byte (`17 + name_len`).
    pub cipher_offset: usize,
}

/// Parses just the cleartext prefix of a 1024-byte handshake block:
/// IV, username length, username. The server needs this before it can
/// even look up which key to decrypt the rest with.
pub fn parse_handshake_prefix(block: &[u8; HANDSHAKE_SIZE]) -> Result<HandshakePrefix> {
    let iv: [u8; 16] = block[0..16].try_into().unwrap();
    let name_len = block[16] as usize;
    let cipher_offset = 17 + name_len;
    if cipher_offset > HANDSHAKE_SIZE {
        return Err(Error::Handshake("username length overruns block"));
    }
    let username = std::str::from_utf8(&block[17..cipher_offset])
        .map_err(|_| Error::Handshake("username is not utf-8"))?
        .to_string();
    Ok(HandshakePrefix {
        iv,
        username,
        cipher_offset,
    })
}

/// Decrypts the tail of a handshake block (`cipher_offset..1024`) in
/// place under `user_key`/`iv`, then parses the version byte and the
/// `ATYP ADDR PORT` target that follow (no `CMD`/`RSV`: this is not a
/// full SOCKS5 `CONNECT` request, just the target it carries).
pub fn decrypt_handshake_tail(
    block: &mut [u8; HANDSHAKE_SIZE],
    user_key: &[u8; 16],
    iv: &[u8; 16],
    cipher_offset: usize,
) -> Result<Target> {
    decrypt_in_place(user_key, iv, &mut block[cipher_offset..]);
    let tail = &block[cipher_offset..];
    if tail.is_empty() || tail[0] != socks5::VERSION {
        return Err(Error::Handshake("bad socks5 version in handshake"));
    }
    let (_, target) =
        socks5::parse_target(&tail[1..]).map_err(|_| Error::Handshake("bad socks5 target in handshake"))?;
    Ok(target)
}

/// Builds the 1024-byte handshake request (local -> server).
pub fn build_handshake_request(
    iv: &[u8; 16],
    username: &str,
    user_key: &[u8; 16],
    target: &Target,
) -> Result<[u8; HANDSHAKE_SIZE]> {
    if username.len() > crate::user::MAX_USERNAME {
        return Err(Error::Handshake("username too long"));
    }
    let mut block = [0u8; HANDSHAKE_SIZE];
    // Random padding for the whole block first; the cleartext prefix
    // below overwrites its own bytes, and the rest is encrypted in
    // place afterward so padding never leaks un-encrypted.
    random::fill(&mut block)?;

    block[0..16].copy_from_slice(iv);
    block[16] = username.len() as u8;
    let cipher_offset = 17 + username.len();
    block[17..cipher_offset].copy_from_slice(username.as_bytes());

    block[cipher_offset] = socks5::VERSION;
    let body = socks5::encode_target(target);
    let body_end = cipher_offset + 1 + body.len();
    if body_end > HANDSHAKE_SIZE {
        return Err(Error::Handshake("target address too long for handshake block"));
    }
    block[cipher_offset + 1..body_end].copy_from_slice(&body);

    encrypt_in_place(user_key, iv, &mut block[cipher_offset..]);
    Ok(block)
}

/// A 32-byte handshake reply: `IV_rep (16) | E(user_key, IV_rep,
/// session_key) (16)`. The reply IV decrypts the reply's own key
/// bytes.
pub fn build_handshake_reply(user_key: &[u8; 16], session_key: &[u8; 16]) -> Result<[u8; 32]> {
    let iv_rep = random::iv16()?;
    let mut reply = [0u8; 32];
    reply[0..16].copy_from_slice(&iv_rep);
    reply[16..32].copy_from_slice(session_key);
    encrypt_in_place(user_key, &iv_rep, &mut reply[16..32]);
    Ok(reply)
}

/// Recovers the session key from a 32-byte handshake reply.
pub fn parse_handshake_reply(reply: &[u8; 32], user_key: &[u8; 16]) -> [u8; 16] {
    let iv_rep: [u8; 16] = reply[0..16].try_into().unwrap();
    let mut key = [0u8; 16];
    key.copy_from_slice(&reply[16..32]);
    decrypt_in_place(user_key, &iv_rep, &mut key);
    key
}

/// Encrypts up to `FRAME_PAYLOAD` application bytes into a fresh
/// 4112-byte relay frame: `data || padding || len_le16` encrypted,
/// followed by the cleartext IV that seeded that encryption. `out`
/// must be exactly `RELAY_FRAME_SIZE` bytes; its own trailing 16 bytes
/// double as scratch space for the fresh IV before being overwritten
/// with the real one, so no extra allocation is needed per frame.
pub fn encode_relay_frame(session_key: &[u8; 16], payload: &[u8], out: &mut [u8]) -> Result<()> {
    debug_assert_eq!(out.len(), RELAY_FRAME_SIZE);
    if payload.len() > LENGTH_OFFSET {
        return Err(Error::Handshake("payload too large for one relay frame"));
    }
    let iv = random::iv16()?;

    let (plain, trailer) = out.split_at_mut(FRAME_PAYLOAD);
    random::fill(plain)?; // padding
    plain[..payload.len()].copy_from_slice(payload);
    plain[LENGTH_OFFSET..FRAME_PAYLOAD].copy_from_slice(&(payload.len() as u16).to_le_bytes());

    encrypt_in_place(session_key, &iv, plain);
    trailer.copy_from_slice(&iv);
    Ok(())
}

/// Decrypts a 4112-byte relay frame in place and returns the count of
/// real application bytes at the front of it. A lying/corrupt
/// `len_le16` is clamped to `FRAME_PAYLOAD`, never trusted past the
/// buffer it was decrypted into, so a malicious peer cannot induce a
/// read past the frame regardless of what it claims.
pub fn decode_relay_frame(session_key: &[u8; 16], frame: &mut [u8]) -> Result<usize> {
    if frame.len() != RELAY_FRAME_SIZE {
        return Err(Error::Handshake("short relay frame"));
    }
    let (plain, trailer) = frame.split_at_mut(FRAME_PAYLOAD);
    let iv: [u8; 16] = trailer.try_into().unwrap();
    decrypt_in_place(session_key, &iv, plain);

    let claimed = u16::from_le_bytes([plain[LENGTH_OFFSET], plain[LENGTH_OFFSET + 1]]) as usize;
    Ok(claimed.min(LENGTH_OFFSET))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn user_key() -> [u8; 16] {
        [0x42; 16]
    }

    #[test]
    fn handshake_request_parses_back_to_same_target() {
        let iv = [1u8; 16];
        let key = user_key();
        let target = Target {
            addr: socks5::Addr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 80,
        };
        let block = build_handshake_request(&iv, "serho", &key, &target).unwrap();

        let prefix = parse_handshake_prefix(&block).unwrap();
        assert_eq!(prefix.iv, iv);
        assert_eq!(prefix.username, "serho");
        assert_eq!(block[16], 5); // "serho" is 5 bytes

        let mut block_mut = block;
        let parsed_target =
            decrypt_handshake_tail(&mut block_mut, &key, &prefix.iv, prefix.cipher_offset).unwrap();
        assert_eq!(parsed_target, target);
    }

    #[test]
    fn handshake_tail_matches_spec_e1_byte_layout() {
        // E1: name "serho" (L=5), target 127.0.0.1:80. The encrypted
        // tail must read `05 01 7F 00 00 01 00 50` once decrypted:
        // version, ATYP, address, port — no CMD/RSV doubling the
        // version or inserting a command byte.
        let iv = [1u8; 16];
        let key = user_key();
        let target = Target {
            addr: socks5::Addr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 80,
        };
        let mut block = build_handshake_request(&iv, "serho", &key, &target).unwrap();
        assert_eq!(block[16], 5);
        assert_eq!(&block[17..22], b"serho");

        let cipher_offset = 22;
        decrypt_in_place(&key, &iv, &mut block[cipher_offset..]);
        assert_eq!(
            &block[cipher_offset..cipher_offset + 8],
            &[0x05, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50]
        );
    }

    #[test]
    fn handshake_reply_round_trips_session_key() {
        let user_key = user_key();
        let session_key = [0x99u8; 16];
        let reply = build_handshake_reply(&user_key, &session_key).unwrap();
        let recovered = parse_handshake_reply(&reply, &user_key);
        assert_eq!(recovered, session_key);
    }

    #[test]
    fn relay_frame_round_trips_payload() {
        let session_key = [7u8; 16];
        let payload = b"hello, destination";
        let mut frame = [0u8; RELAY_FRAME_SIZE];
        encode_relay_frame(&session_key, payload, &mut frame).unwrap();

        let len = decode_relay_frame(&session_key, &mut frame).unwrap();
        assert_eq!(len, payload.len());
        assert_eq!(&frame[..len], &payload[..]);
    }

    #[test]
    fn relay_frame_rejects_oversized_payload() {
        let session_key = [7u8; 16];
        let payload = vec![0u8; FRAME_PAYLOAD];
        let mut frame = [0u8; RELAY_FRAME_SIZE];
        assert!(encode_relay_frame(&session_key, &payload, &mut frame).is_err());
    }

    #[test]
    fn forged_length_field_is_clamped_not_trusted() {
        // A peer that lies about length_LE16 (e.g. 0xFFFF) must not
        // cause an out-of-bounds read; the claimed length is clamped
        // to the plaintext region that actually exists.
        let session_key = [3u8; 16];
        let iv = [5u8; 16];
        let mut plain = vec![0u8; FRAME_PAYLOAD];
        plain[LENGTH_OFFSET..].copy_from_slice(&0xFFFFu16.to_le_bytes());
        encrypt_in_place(&session_key, &iv, &mut plain);

        let mut frame = vec![0u8; RELAY_FRAME_SIZE];
        frame[..FRAME_PAYLOAD].copy_from_slice(&plain);
        frame[FRAME_PAYLOAD..].copy_from_slice(&iv);

        let len = decode_relay_frame(&session_key, &mut frame).unwrap();
        assert!(len <= LENGTH_OFFSET);
        assert_eq!(len, LENGTH_OFFSET);
    }
}
