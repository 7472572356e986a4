//! The connection context (C2's data half): per-pair state owning two
//! sockets, two frame buffers, a crypto session, and a liveness mask.
use mio::net::TcpStream;

use crate::buffer::RelayBuffer;
use crate::crypto::session::SessionKey;
use crate::timer::TimerId;

/// Which of the two sockets in a pair are still open.
///
/// A closed four-state enum rather than a bitmask: the only
/// transitions observable from outside a context are exactly the ones
/// these four variants name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Dead,
    ClientOnly,
    RemoteOnly,
    Both,
}

impl Liveness {
    pub fn has_client(self) -> bool {
        matches!(self, Liveness::ClientOnly | Liveness::Both)
    }

    pub fn has_remote(self) -> bool {
        matches!(self, Liveness::RemoteOnly | Liveness::Both)
    }

    pub fn is_dead(self) -> bool {
        matches!(self, Liveness::Dead)
    }

    #[must_use]
    pub fn with_remote(self) -> Liveness {
        match self {
            Liveness::Dead => Liveness::RemoteOnly,
            Liveness::ClientOnly => Liveness::Both,
            other => other,
        }
    }

    #[must_use]
    fn without_client(self) -> Liveness {
        match self {
            Liveness::ClientOnly => Liveness::Dead,
            Liveness::Both => Liveness::RemoteOnly,
            other => other,
        }
    }

    #[must_use]
    fn without_remote(self) -> Liveness {
        match self {
            Liveness::RemoteOnly => Liveness::Dead,
            Liveness::Both => Liveness::ClientOnly,
            other => other,
        }
    }
}

/// Which halves a caller wants torn down. Distinct from `Liveness`
/// (the context's *current* state) because a release request and the
/// state it's applied to are different things, even though both only
/// ever combine client/remote bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseMask {
    pub client: bool,
    pub remote: bool,
}

impl ReleaseMask {
    pub const CLIENT: ReleaseMask = ReleaseMask {
        client: true,
        remote: false,
    };
    pub const REMOTE: ReleaseMask = ReleaseMask {
        client: false,
        remote: true,
    };
    pub const BOTH: ReleaseMask = ReleaseMask {
        client: true,
        remote: true,
    };
}

/// Which state a connection's protocol state machine is currently in.
/// States are encoded by which callback is currently registered on
/// which fd; this tag is what a dispatch function switches on to know
/// which callback that currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// H0: reading the 1024-byte handshake block from the client.
    ServerHandshakeRead,
    /// H1: non-blocking connect to the resolved target in progress.
    ServerConnecting,
    /// H2: writing the 32-byte handshake reply to the client.
    ServerReplyWrite,
    /// S0: reading the SOCKS5 method-negotiation greeting.
    LocalGreetRead,
    /// S0: writing the method-negotiation reply.
    LocalGreetWrite,
    /// S1: reading the SOCKS5 CONNECT request.
    LocalRequestRead,
    /// S1/S2: writing the SOCKS5 success reply to the local client and
    /// the 1024-byte handshake request to the Fakio server. The two
    /// writes run independently (different sockets, different
    /// buffers); this stage covers both, and each side's handler
    /// checks whether the other buffer has also drained before
    /// advancing to `LocalAwaitingKey`.
    LocalHandshakeWrite,
    /// S2: reading the 32-byte handshake reply from the Fakio server.
    LocalAwaitingKey,
    /// S3/H3: full-duplex ciphered relay, shared by both sides.
    Relay,
}

pub struct Context {
    pub client: Option<TcpStream>,
    pub remote: Option<TcpStream>,
    /// Whether `client`/`remote` is currently registered with the
    /// reactor's `Registry`. `arm()` consults these to choose `register`
    /// (not currently watched) over `reregister` (already watched) —
    /// `reregister`ing a source the registry doesn't know about yet
    /// fails with `ENOENT` instead of registering it.
    pub client_registered: bool,
    pub remote_registered: bool,
    /// Bytes travelling client -> remote; doubles as handshake-phase
    /// scratch space before the relay starts (reset and reused across
    /// phases rather than given a dedicated handshake buffer).
    pub req: RelayBuffer,
    /// Bytes travelling remote -> client; same dual role as `req`.
    pub res: RelayBuffer,
    pub liveness: Liveness,
    pub stage: Stage,
    /// Set once the relay session key has been established (S2 on the
    /// local side, H2 on the server side).
    pub session_key: Option<SessionKey>,
    /// Authenticated username; populated on the server side only.
    pub user: Option<String>,
    /// The looked-up user's long-term AES-128 key, held between H0
    /// (lookup) and H2 (encrypting the handshake reply under it) on
    /// the server side only; cleared once the reply is sent.
    pub user_key: Option<[u8; 16]>,
    /// Handle to this context's optional connection-level timeout.
    pub timer: Option<TimerId>,
}

impl Context {
    pub fn new() -> Self {
        Context {
            client: None,
            remote: None,
            client_registered: false,
            remote_registered: false,
            req: RelayBuffer::new(),
            res: RelayBuffer::new(),
            liveness: Liveness::Dead,
            stage: Stage::ServerHandshakeRead,
            session_key: None,
            user: None,
            user_key: None,
            timer: None,
        }
    }

    /// Returns the slot to its pristine, pool-ready state. Only valid
    /// to call once `liveness` is `Dead` (both sockets already closed).
    pub fn reset(&mut self) {
        debug_assert!(self.liveness.is_dead());
        debug_assert!(self.client.is_none());
        debug_assert!(self.remote.is_none());
        self.client_registered = false;
        self.remote_registered = false;
        self.req.reset();
        self.res.reset();
        self.session_key = None;
        self.user = None;
        self.user_key = None;
        self.timer = None;
    }

    /// Closes the fds named by `which`, intersected with the halves
    /// that are actually still alive, and updates `liveness`
    /// accordingly. Idempotent: releasing an already-dead half is a
    /// no-op.
    ///
    /// Returns `true` if the context is now fully `Dead`.
    pub fn release_halves(&mut self, which: ReleaseMask) -> bool {
        if which.client && self.liveness.has_client() {
            self.client = None; // drop closes the fd
            self.client_registered = false;
            self.liveness = self.liveness.without_client();
        }
        if which.remote && self.liveness.has_remote() {
            self.remote = None;
            self.remote_registered = false;
            self.liveness = self.liveness.without_remote();
        }
        self.liveness.is_dead()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_is_idempotent_on_cleared_half() {
        let mut c = Context::new();
        c.liveness = Liveness::Both;
        assert!(!c.release_halves(ReleaseMask::CLIENT));
        assert_eq!(c.liveness, Liveness::RemoteOnly);
        // Releasing CLIENT again, with the half already gone, must be
        // a no-op with the same observable effect.
        assert!(!c.release_halves(ReleaseMask::CLIENT));
        assert_eq!(c.liveness, Liveness::RemoteOnly);
    }

    #[test]
    fn releasing_both_halves_reaches_dead() {
        let mut c = Context::new();
        c.liveness = Liveness::Both;
        assert!(c.release_halves(ReleaseMask::BOTH));
        assert_eq!(c.liveness, Liveness::Dead);
    }

    #[test]
    fn releasing_remaining_half_reaches_dead() {
        let mut c = Context::new();
        c.liveness = Liveness::ClientOnly;
        assert!(c.release_halves(ReleaseMask::CLIENT));
        assert_eq!(c.liveness, Liveness::Dead);
    }
}
