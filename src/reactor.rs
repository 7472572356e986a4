//! Event reactor (C3): a single-threaded, non-blocking readiness loop,
//! built on `mio::Poll` (epoll on Linux, with mio's own portable
//! fallbacks elsewhere). A thin, ownable value wrapping the kernel's
//! readiness multiplexer, with explicit register/reregister/deregister
//! and a poll loop that the caller drives directly instead of handing
//! control to a runtime.
use std::io;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};

use crate::pool::Handle;
use crate::timer::TimerQueue;

/// Which half of a connection pair a readiness event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    Client,
    Remote,
}

/// Packs a pool slot index and a half discriminant into a `mio::Token`.
/// The low bit is the half; the rest is the slot index. A context's
/// two sockets therefore always occupy adjacent, deterministic tokens,
/// so dispatch never needs a separate fd -> context side table.
pub fn token_for(index: usize, half: Half) -> Token {
    let bit = match half {
        Half::Client => 0,
        Half::Remote => 1,
    };
    Token((index << 1) | bit)
}

pub fn decode_token(token: Token) -> (usize, Half) {
    let raw = token.0;
    let half = if raw & 1 == 0 { Half::Client } else { Half::Remote };
    (raw >> 1, half)
}

/// A dedicated listener token, placed well above any slot-derived
/// token range in practice (accept handling checks this token
/// explicitly before falling through to `decode_token`).
pub const LISTENER: Token = Token(usize::MAX);

pub struct EventLoop {
    pub poll: Poll,
    events: Events,
    pub timers: TimerQueue,
}

impl EventLoop {
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(events_capacity),
            timers: TimerQueue::new(),
        })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// One iteration of the dispatch loop: computes a timeout from the
    /// timer heap's earliest deadline (never blocking past it), polls
    /// the kernel, and returns the ready tokens for the caller to
    /// dispatch. Due timers are the caller's responsibility to drain
    /// via `self.timers.pop_due` after handling I/O readiness.
    pub fn poll_once(&mut self) -> io::Result<Vec<(Token, bool, bool)>> {
        let timeout = self.timers.next_deadline().map(|deadline| {
            deadline.saturating_duration_since(Instant::now())
        }).unwrap_or(Duration::from_secs(1));

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        Ok(self
            .events
            .iter()
            .map(|ev| (ev.token(), ev.is_readable(), ev.is_writable()))
            .collect())
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }
}

pub const READ: Interest = Interest::READABLE;
pub const WRITE: Interest = Interest::WRITABLE;
pub const READ_WRITE: Interest = Interest::READABLE.add(Interest::WRITABLE);

/// Helper only used by tests and by callers that want to reason about
/// a `Handle`'s derived tokens without threading `Half` everywhere.
pub fn tokens_for_handle(handle: Handle) -> (Token, Token) {
    (
        token_for(handle.index(), Half::Client),
        token_for(handle.index(), Half::Remote),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_index_and_half() {
        let t = token_for(17, Half::Remote);
        assert_eq!(decode_token(t), (17, Half::Remote));
        let t = token_for(0, Half::Client);
        assert_eq!(decode_token(t), (0, Half::Client));
    }

    #[test]
    fn client_and_remote_tokens_for_same_index_differ() {
        let (c, r) = tokens_for_handle_for_test(5);
        assert_ne!(c, r);
    }

    fn tokens_for_handle_for_test(index: usize) -> (Token, Token) {
        (token_for(index, Half::Client), token_for(index, Half::Remote))
    }
}
