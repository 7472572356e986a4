//! `fakio-server`'s connection engine: accepts SOCKS5-over-Fakio
//! clients, authenticates them, opens the real destination, and
//! relays ciphertext to cleartext. Authentication is a per-user key
//! lookup against the configured user directory.
use std::io::{self, Read};

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::buffer::{RelayBuffer, HANDSHAKE_SIZE};
use crate::config::ServerConfig;
use crate::context::{Context, Liveness, ReleaseMask, Stage};
use crate::crypto::session::SessionKey;
use crate::crypto::{self, random};
use crate::error::{Error, Result};
use crate::net;
use crate::pool::{ContextPool, Handle};
use crate::reactor::{self, EventLoop, Half, READ, WRITE};
use crate::relay::{self, ReadOutcome, WriteOutcome};
use crate::wire;

enum BlockRead {
    Pending,
    Ready,
    Eof,
}

/// Loops `recv` into `req` until a full handshake block has arrived.
/// Split out as a free function over disjoint field references so the
/// caller can borrow `ctx.client` and `ctx.req` independently.
fn read_handshake_block(client: &mut TcpStream, req: &mut RelayBuffer) -> io::Result<BlockRead> {
    loop {
        if req.data_len() >= HANDSHAKE_SIZE {
            return Ok(BlockRead::Ready);
        }
        let need = HANDSHAKE_SIZE - req.data_len();
        match client.read(&mut req.writable()[..need]) {
            Ok(0) => return Ok(BlockRead::Eof),
            Ok(n) => req.commit_write(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(BlockRead::Pending),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

pub struct Server {
    listener: mio::net::TcpListener,
    pool: ContextPool,
    users: crate::user::UserDirectory,
    /// The live handle currently occupying each pool slot, so a
    /// readiness event carrying only a slot index can be turned back
    /// into a generation-checked `Handle`.
    handles: Vec<Option<Handle>>,
    events: EventLoop,
}

impl Server {
    pub fn bind(cfg: ServerConfig) -> Result<Self> {
        let mut listener = net::bind_listener(&cfg.host, cfg.port)?;
        let event_capacity = cfg.connections.saturating_mul(2).saturating_add(1);
        let mut events = EventLoop::new(event_capacity).map_err(Error::Bind)?;
        events
            .registry()
            .register(&mut listener, reactor::LISTENER, READ)
            .map_err(Error::Bind)?;

        let pool = ContextPool::new(cfg.connections);
        let handles = (0..pool.max_size()).map(|_| None).collect();
        Ok(Server {
            listener,
            pool,
            users: cfg.users,
            handles,
            events,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            let ready = self.events.poll_once().map_err(Error::Io)?;
            for (token, readable, writable) in ready {
                if token == reactor::LISTENER {
                    self.accept_ready();
                    continue;
                }
                self.dispatch(token, readable, writable);
            }
            let now = self.events.now();
            let due: Vec<usize> = self.events.timers.pop_due(now);
            for index in due {
                self.close_index(index);
            }
        }
    }

    fn accept_ready(&mut self) {
        loop {
            let (mut stream, _addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("accept() failed: {e}");
                    return;
                }
            };
            if let Err(e) = net::set_nodelay(&stream) {
                log::warn!("set_nodelay failed: {e}");
            }
            let handle = match self.pool.acquire(Liveness::ClientOnly) {
                Some(h) => h,
                None => {
                    let err = Error::PoolExhausted;
                    log::warn!("{err}, dropping new connection");
                    drop(stream);
                    continue;
                }
            };
            let index = handle.index();
            let token = reactor::token_for(index, Half::Client);
            if let Err(e) = self.events.registry().register(&mut stream, token, READ) {
                log::warn!("register() failed: {e}");
                self.pool.release(handle, ReleaseMask::CLIENT);
                continue;
            }
            let ctx = self.pool.get_mut(handle).expect("just acquired");
            ctx.stage = Stage::ServerHandshakeRead;
            ctx.client = Some(stream);
            ctx.client_registered = true;
            self.handles[index] = Some(handle);
            log::debug!("new client connection, slot {index}");
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        let (index, half) = reactor::decode_token(token);
        let Some(handle) = self.handles[index] else {
            return;
        };
        let stage = match self.pool.get(handle) {
            Some(ctx) => ctx.stage,
            None => return,
        };
        match (stage, half) {
            (Stage::ServerHandshakeRead, Half::Client) if readable => self.on_handshake_readable(handle),
            (Stage::ServerConnecting, Half::Remote) if writable => self.on_connect_writable(handle),
            (Stage::ServerReplyWrite, Half::Client) if writable => self.on_reply_writable(handle),
            (Stage::Relay, Half::Client) if readable => self.on_relay_client_readable(handle),
            (Stage::Relay, Half::Client) if writable => self.on_relay_client_writable(handle),
            (Stage::Relay, Half::Remote) if readable => self.on_relay_remote_readable(handle),
            (Stage::Relay, Half::Remote) if writable => self.on_relay_remote_writable(handle),
            _ => {}
        }
    }

    /// H0: collects the 1024-byte handshake block, authenticates the
    /// user, decrypts and parses the embedded SOCKS5 `CONNECT`
    /// request, and opens a non-blocking connection to the target.
    fn on_handshake_readable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let Context { client, req, .. } = ctx;
        let client_ref = client.as_mut().expect("client socket present in H0");
        let outcome = read_handshake_block(client_ref, req);
        match outcome {
            Ok(BlockRead::Pending) => return,
            Ok(BlockRead::Eof) => {
                log::debug!("client closed during handshake");
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
            Err(e) => {
                log::debug!("recv() from client failed during handshake: {e}");
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
            Ok(BlockRead::Ready) => {}
        }

        let ctx = self.pool.get_mut(handle).expect("live handle");
        let mut raw: [u8; HANDSHAKE_SIZE] = ctx.req.data().try_into().expect("exactly HANDSHAKE_SIZE bytes");
        ctx.req.reset();

        let prefix = match wire::parse_handshake_prefix(&raw) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("bad handshake prefix: {e}");
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
        };
        let Some(user) = self.users.find_user(&prefix.username) else {
            let err = Error::UnknownUser;
            log::warn!("{err}: {:?}", prefix.username);
            self.release(handle, ReleaseMask::CLIENT);
            return;
        };
        let user_key = crypto::truncate_key(&user.key);

        let target = match wire::decrypt_handshake_tail(&mut raw, &user_key, &prefix.iv, prefix.cipher_offset) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("handshake request rejected: {e}");
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
        };

        let host = match &target.addr {
            crate::socks5::Addr::V4(ip) => ip.to_string(),
            crate::socks5::Addr::Domain(name) => name.clone(),
        };
        let mut remote = match net::connect_nonblocking(&host, target.port) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("connect to {host}:{} failed: {e}", target.port);
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
        };
        if let Err(e) = net::set_nodelay(&remote) {
            log::warn!("set_nodelay on remote failed: {e}");
        }

        let index = handle.index();
        let remote_token = reactor::token_for(index, Half::Remote);

        let ctx = self.pool.get_mut(handle).expect("live handle");
        if let Err(e) = self
            .events
            .registry()
            .deregister(ctx.client.as_mut().expect("client present"))
        {
            log::warn!("deregister(client) failed: {e}");
        }
        ctx.client_registered = false;
        if let Err(e) = self.events.registry().register(&mut remote, remote_token, WRITE) {
            log::warn!("register(remote) failed: {e}");
            self.release(handle, ReleaseMask::CLIENT);
            return;
        }

        let ctx = self.pool.get_mut(handle).expect("live handle");
        ctx.remote = Some(remote);
        ctx.remote_registered = true;
        ctx.user = Some(prefix.username);
        ctx.user_key = Some(user_key);
        ctx.liveness = ctx.liveness.with_remote();
        ctx.stage = Stage::ServerConnecting;
    }

    /// H1 completion: the non-blocking connect either succeeded or
    /// failed; either way we now know, so react and move to H2.
    fn on_connect_writable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let remote = ctx.remote.as_mut().expect("remote present in H1");
        match remote.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                log::warn!("connect to target failed: {e}");
                self.release(handle, ReleaseMask::BOTH);
                return;
            }
        }

        let session_key = match random::iv16() {
            Ok(k) => k,
            Err(e) => {
                log::error!("secure random source unavailable: {e}");
                self.release(handle, ReleaseMask::BOTH);
                return;
            }
        };
        let user_key = ctx.user_key.expect("set in H0");
        let reply = match wire::build_handshake_reply(&user_key, &session_key) {
            Ok(r) => r,
            Err(e) => {
                log::error!("failed to build handshake reply: {e}");
                self.release(handle, ReleaseMask::BOTH);
                return;
            }
        };

        ctx.session_key = Some(SessionKey(session_key));
        ctx.user_key = None;
        ctx.res.reset();
        ctx.res.writable()[..reply.len()].copy_from_slice(&reply);
        ctx.res.commit_write(reply.len());
        ctx.stage = Stage::ServerReplyWrite;

        let index = handle.index();
        if let Err(e) = self.events.registry().deregister(ctx.remote.as_mut().unwrap()) {
            log::warn!("deregister(remote) failed: {e}");
        }
        ctx.remote_registered = false;
        let client_token = reactor::token_for(index, Half::Client);
        if let Err(e) = self
            .events
            .registry()
            .register(ctx.client.as_mut().unwrap(), client_token, WRITE)
        {
            log::warn!("register(client) failed: {e}");
            self.release(handle, ReleaseMask::BOTH);
        } else {
            ctx.client_registered = true;
        }
    }

    /// H2: writes the 32-byte handshake reply, then enters the relay.
    fn on_reply_writable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let Context { client, res, .. } = ctx;
        let client_ref = client.as_mut().expect("client present in H2");
        match relay::pump_write(client_ref, res) {
            Ok(WriteOutcome::WouldBlock) => {}
            Ok(WriteOutcome::Drained) => {
                let ctx = self.pool.get_mut(handle).expect("live handle");
                ctx.stage = Stage::Relay;
                let index = handle.index();
                let client_token = reactor::token_for(index, Half::Client);
                let remote_token = reactor::token_for(index, Half::Remote);
                if let Err(e) = self
                    .events
                    .registry()
                    .reregister(ctx.client.as_mut().unwrap(), client_token, READ)
                {
                    log::warn!("reregister(client) failed: {e}");
                }
                if let Err(e) = self
                    .events
                    .registry()
                    .register(ctx.remote.as_mut().unwrap(), remote_token, READ)
                {
                    log::warn!("register(remote) failed: {e}");
                } else {
                    ctx.remote_registered = true;
                }
            }
            Err(e) => {
                log::debug!("send() of handshake reply failed: {e}");
                self.release(handle, ReleaseMask::BOTH);
            }
        }
    }

    fn on_relay_client_readable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let session_key = ctx.session_key.expect("set before Stage::Relay").0;
        let Context { client, req, .. } = ctx;
        let client_ref = client.as_mut().expect("client present in relay");
        match relay::pump_read_wire(client_ref, req, &session_key) {
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::FrameReady) => {
                let index = handle.index();
                self.arm(index, Half::Client, None);
                self.arm(index, Half::Remote, Some(WRITE));
            }
            Ok(ReadOutcome::Eof) => {
                log::debug!("client connection closed");
                self.release(handle, ReleaseMask::CLIENT);
            }
            Err(e) => {
                log::debug!("recv() from client failed: {e}");
                self.release(handle, ReleaseMask::BOTH);
            }
        }
    }

    fn on_relay_remote_writable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let Context { remote, req, .. } = ctx;
        let remote_ref = remote.as_mut().expect("remote present in relay");
        match relay::pump_write(remote_ref, req) {
            Ok(WriteOutcome::WouldBlock) => {}
            Ok(WriteOutcome::Drained) => {
                let index = handle.index();
                self.arm(index, Half::Remote, None);
                let has_client = self.pool.get(handle).map(|c| c.liveness.has_client()).unwrap_or(false);
                if has_client {
                    self.arm(index, Half::Client, Some(READ));
                    self.arm(index, Half::Remote, Some(READ));
                } else {
                    self.release(handle, ReleaseMask::REMOTE);
                }
            }
            Err(e) => {
                log::debug!("send() to remote failed: {e}");
                self.release(handle, ReleaseMask::BOTH);
            }
        }
    }

    fn on_relay_remote_readable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let session_key = ctx.session_key.expect("set before Stage::Relay").0;
        let Context { remote, res, .. } = ctx;
        let remote_ref = remote.as_mut().expect("remote present in relay");
        match relay::pump_read_plain(remote_ref, res, &session_key) {
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::FrameReady) => {
                let index = handle.index();
                self.arm(index, Half::Remote, None);
                self.arm(index, Half::Client, Some(WRITE));
            }
            Ok(ReadOutcome::Eof) => {
                log::debug!("remote connection closed");
                self.release(handle, ReleaseMask::REMOTE);
            }
            Err(e) => {
                log::debug!("recv() from remote failed: {e}");
                self.release(handle, ReleaseMask::BOTH);
            }
        }
    }

    fn on_relay_client_writable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let Context { client, res, .. } = ctx;
        let client_ref = client.as_mut().expect("client present in relay");
        match relay::pump_write(client_ref, res) {
            Ok(WriteOutcome::WouldBlock) => {}
            Ok(WriteOutcome::Drained) => {
                let index = handle.index();
                self.arm(index, Half::Client, None);
                let has_remote = self.pool.get(handle).map(|c| c.liveness.has_remote()).unwrap_or(false);
                if has_remote {
                    self.arm(index, Half::Client, Some(READ));
                    self.arm(index, Half::Remote, Some(READ));
                } else {
                    self.release(handle, ReleaseMask::CLIENT);
                }
            }
            Err(e) => {
                log::debug!("send() to client failed: {e}");
                self.release(handle, ReleaseMask::BOTH);
            }
        }
    }

    /// Updates interest on one half of a context's socket pair.
    /// `interest = None` deregisters it entirely. Uses `register` rather
    /// than `reregister` when the half isn't currently registered (e.g.
    /// a relay direction that was just deregistered to drain a write) —
    /// `reregister`ing a source the poller doesn't know about fails with
    /// `ENOENT` and would silently leave the interest never reinstated.
    fn arm(&mut self, index: usize, half: Half, interest: Option<Interest>) {
        let Some(handle) = self.handles[index] else { return };
        let Some(ctx) = self.pool.get_mut(handle) else { return };
        let Context {
            client,
            remote,
            client_registered,
            remote_registered,
            ..
        } = ctx;
        let (stream, registered): (&mut TcpStream, &mut bool) = match half {
            Half::Client => match client.as_mut() {
                Some(s) => (s, client_registered),
                None => return,
            },
            Half::Remote => match remote.as_mut() {
                Some(s) => (s, remote_registered),
                None => return,
            },
        };
        let token = reactor::token_for(index, half);
        let result = match interest {
            Some(i) if *registered => self.events.registry().reregister(stream, token, i),
            Some(i) => self.events.registry().register(stream, token, i),
            None => self.events.registry().deregister(stream),
        };
        match &result {
            Ok(()) => *registered = interest.is_some(),
            Err(e) => log::warn!("interest update failed: {e}"),
        }
    }

    fn release(&mut self, handle: Handle, which: ReleaseMask) {
        let index = handle.index();
        if which.client {
            self.arm(index, Half::Client, None);
        }
        if which.remote {
            self.arm(index, Half::Remote, None);
        }
        self.pool.release(handle, which);
        if self.pool.get(handle).is_none() {
            self.handles[index] = None;
        }
    }

    fn close_index(&mut self, index: usize) {
        if let Some(handle) = self.handles[index] {
            self.release(handle, ReleaseMask::BOTH);
        }
    }
}
