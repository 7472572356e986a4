//! Full-duplex ciphered relay: the shared core driving bytes between a
//! wire-format leg and a plaintext leg.
//!
//! One side of a pair always speaks the framed, ciphered wire protocol
//! (full 4112-byte blocks); the other speaks whatever the plaintext
//! peer sends. Which physical socket (`client` or `remote`) plays
//! which role flips between the server and the local binary, so this
//! module stays role-agnostic: it only knows "the wire leg" and "the
//! plain leg", and `server.rs`/`local.rs` wire those onto
//! `Context::client`/`Context::remote` in the appropriate direction.
use std::io::{self, Read, Write};

use crate::buffer::RelayBuffer;
use crate::wire::{self, RELAY_FRAME_SIZE};

/// Outcome of a single read-side pump.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Not enough data arrived yet; interest stays registered as-is.
    WouldBlock,
    /// A full frame's worth of (now plaintext) payload sits in `buf`.
    /// The caller should stop reading this side and start writing the
    /// other.
    FrameReady,
    /// The peer closed its write half.
    Eof,
}

/// Outcome of a single write-side pump.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The socket send buffer is full; more writes are pending.
    WouldBlock,
    /// Everything in `buf` has been written out.
    Drained,
}

/// Reads from the wire leg until a full `RELAY_FRAME_SIZE` ciphertext
/// block has arrived, then decrypts it in place and shrinks `buf` down
/// to the real plaintext length carried in the frame's length field.
///
/// `buf` must be empty on entry (the caller only calls this once the
/// previous frame has been fully forwarded).
pub fn pump_read_wire(
    source: &mut impl Read,
    buf: &mut RelayBuffer,
    session_key: &[u8; 16],
) -> io::Result<ReadOutcome> {
    debug_assert!(buf.is_empty());
    loop {
        if buf.is_full() {
            break;
        }
        match source.read(buf.writable()) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => buf.commit_write(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    let len = wire::decode_relay_frame(session_key, buf.data_mut())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    buf.set_len(len);
    Ok(ReadOutcome::FrameReady)
}

/// Reads a single chunk of plaintext application bytes from the plain
/// leg (up to one frame's worth), encrypts it into a fresh relay
/// frame, and leaves that frame in `buf` ready to forward.
///
/// `buf` must be empty on entry.
pub fn pump_read_plain(
    source: &mut impl Read,
    buf: &mut RelayBuffer,
    session_key: &[u8; 16],
) -> io::Result<ReadOutcome> {
    debug_assert!(buf.is_empty());
    let mut payload = [0u8; wire::FRAME_PAYLOAD - 2];
    let n = loop {
        match source.read(&mut payload) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };
    debug_assert_eq!(buf.capacity(), RELAY_FRAME_SIZE);
    wire::encode_relay_frame(session_key, &payload[..n], buf.writable())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    buf.commit_write(RELAY_FRAME_SIZE);
    Ok(ReadOutcome::FrameReady)
}

/// Drains `buf` to `dest`, advancing the read cursor as each partial
/// write lands, so a later `WouldBlock` never loses already-sent
/// bytes or re-sends bytes already acked by the kernel.
pub fn pump_write(dest: &mut impl Write, buf: &mut RelayBuffer) -> io::Result<WriteOutcome> {
    loop {
        if buf.is_empty() {
            return Ok(WriteOutcome::Drained);
        }
        match dest.write(buf.data()) {
            Ok(0) => return Ok(WriteOutcome::WouldBlock),
            Ok(n) => buf.commit_read(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(WriteOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct MockReader {
        chunks: VecDeque<Vec<u8>>,
        block_after: bool,
    }

    impl MockReader {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            MockReader {
                chunks: chunks.into(),
                block_after: true,
            }
        }
    }

    impl Read for MockReader {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    out[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.block_after => Err(io::Error::from(io::ErrorKind::WouldBlock)),
                None => Ok(0),
            }
        }
    }

    #[derive(Default)]
    struct MockWriter {
        written: Vec<u8>,
        /// Bytes that can still be accepted before the socket send
        /// buffer is simulated as full; further writes return
        /// `WouldBlock` until the test raises this again.
        budget: usize,
    }

    impl Write for MockWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = data.len().min(self.budget);
            self.written.extend_from_slice(&data[..n]);
            self.budget -= n;
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn pump_read_plain_encrypts_one_chunk_into_a_frame() {
        let key = [9u8; 16];
        let mut reader = MockReader::new(vec![b"hello".to_vec()]);
        let mut buf = RelayBuffer::new();
        let outcome = pump_read_plain(&mut reader, &mut buf, &key).unwrap();
        assert_eq!(outcome, ReadOutcome::FrameReady);
        assert_eq!(buf.data_len(), RELAY_FRAME_SIZE);
    }

    #[test]
    fn wire_round_trip_through_pump_functions() {
        let key = [3u8; 16];
        let mut plain_buf = RelayBuffer::new();
        let mut plain_reader = MockReader::new(vec![b"forward me".to_vec()]);
        pump_read_plain(&mut plain_reader, &mut plain_buf, &key).unwrap();

        let frame = plain_buf.data().to_vec();
        let mut wire_reader = MockReader::new(vec![frame]);
        let mut wire_buf = RelayBuffer::new();
        let outcome = pump_read_wire(&mut wire_reader, &mut wire_buf, &key).unwrap();
        assert_eq!(outcome, ReadOutcome::FrameReady);
        assert_eq!(wire_buf.data(), b"forward me");
    }

    #[test]
    fn pump_read_wire_blocks_on_short_read() {
        let key = [1u8; 16];
        let mut reader = MockReader::new(vec![vec![0u8; 10]]);
        let mut buf = RelayBuffer::new();
        let outcome = pump_read_wire(&mut reader, &mut buf, &key).unwrap();
        assert_eq!(outcome, ReadOutcome::WouldBlock);
        assert_eq!(buf.data_len(), 10);
    }

    #[test]
    fn pump_read_reports_eof_on_empty_read() {
        let key = [1u8; 16];
        let mut reader = MockReader::new(vec![]);
        reader.block_after = false;
        let mut buf = RelayBuffer::new();
        assert_eq!(
            pump_read_plain(&mut reader, &mut buf, &key).unwrap(),
            ReadOutcome::Eof
        );
    }

    #[test]
    fn pump_write_partial_then_drained() {
        let mut buf = RelayBuffer::new();
        buf.writable()[..5].copy_from_slice(b"abcde");
        buf.commit_write(5);
        let mut writer = MockWriter {
            budget: 2,
            ..Default::default()
        };
        assert_eq!(pump_write(&mut writer, &mut buf).unwrap(), WriteOutcome::WouldBlock);
        assert_eq!(buf.data_len(), 3);
        assert_eq!(writer.written, b"ab");
        writer.budget = 100;
        assert_eq!(pump_write(&mut writer, &mut buf).unwrap(), WriteOutcome::Drained);
        assert_eq!(writer.written, b"abcde");
    }
}
