//! `fakio-local`'s connection engine: terminates an unmodified SOCKS5
//! client's handshake, dials the configured Fakio server over one
//! blocking connect, authenticates with the 1024/32-byte handshake,
//! and relays ciphertext to plaintext. Mirrors `server.rs`'s shape,
//! with client and remote's wire/plain leg roles swapped.
use std::io::{self, Read};
use std::net::Ipv4Addr;

use mio::net::TcpStream;
use mio::Token;

use crate::buffer::RelayBuffer;
use crate::config::LocalConfig;
use crate::context::{Context, Liveness, ReleaseMask, Stage};
use crate::crypto::session::SessionKey;
use crate::crypto::{self, random};
use crate::error::{Error, Result};
use crate::net;
use crate::pool::{ContextPool, Handle};
use crate::reactor::{self, EventLoop, Half, READ, WRITE};
use crate::relay::{self, ReadOutcome, WriteOutcome};
use crate::socks5;
use crate::wire;

enum BlockRead {
    Pending,
    Ready(usize),
    Eof,
}

/// Accumulates bytes from `client` into `buf` until `complete` reports
/// the total message length, mirroring `server.rs::read_handshake_block`
/// but for SOCKS5's variable-length messages: `complete` is re-run
/// after every partial read instead of being a fixed constant.
fn read_until(
    client: &mut TcpStream,
    buf: &mut RelayBuffer,
    complete: impl Fn(&[u8]) -> Option<usize>,
) -> io::Result<BlockRead> {
    loop {
        if let Some(need) = complete(buf.data()) {
            if buf.data_len() >= need {
                return Ok(BlockRead::Ready(need));
            }
        }
        match client.read(buf.writable()) {
            Ok(0) => return Ok(BlockRead::Eof),
            Ok(n) => buf.commit_write(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(BlockRead::Pending),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Reads exactly `want` bytes from `source` into `buf`, looping
/// through short reads the way `server.rs` loops to fill a fixed-size
/// handshake block.
fn read_exact_into(source: &mut TcpStream, buf: &mut RelayBuffer, want: usize) -> io::Result<BlockRead> {
    loop {
        if buf.data_len() >= want {
            return Ok(BlockRead::Ready(want));
        }
        let need = want - buf.data_len();
        match source.read(&mut buf.writable()[..need]) {
            Ok(0) => return Ok(BlockRead::Eof),
            Ok(n) => buf.commit_write(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(BlockRead::Pending),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

pub struct Local {
    listener: mio::net::TcpListener,
    pool: ContextPool,
    handles: Vec<Option<Handle>>,
    events: EventLoop,
    server_host: String,
    server_port: u16,
    username: String,
    user_key: [u8; 16],
}

impl Local {
    pub fn bind(cfg: LocalConfig) -> Result<Self> {
        let mut listener = net::bind_listener(&cfg.client_host, cfg.client_port)?;
        let connections = crate::config::DEFAULT_CONNECTIONS;
        let event_capacity = connections.saturating_mul(2).saturating_add(1);
        let mut events = EventLoop::new(event_capacity).map_err(Error::Bind)?;
        events
            .registry()
            .register(&mut listener, reactor::LISTENER, READ)
            .map_err(Error::Bind)?;

        let pool = ContextPool::new(connections);
        let handles = (0..pool.max_size()).map(|_| None).collect();
        let digest = crypto::hash_password(cfg.password.as_bytes());
        Ok(Local {
            listener,
            pool,
            handles,
            events,
            server_host: cfg.server_host,
            server_port: cfg.server_port,
            username: cfg.username,
            user_key: crypto::truncate_key(&digest),
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
            ctx.stage = Stage::LocalGreetRead;
            ctx.client = Some(stream);
            ctx.client_registered = true;
            self.handles[index] = Some(handle);
            log::debug!("new socks5 client, slot {index}");
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
            (Stage::LocalGreetRead, Half::Client) if readable => self.on_greet_readable(handle),
            (Stage::LocalGreetWrite, Half::Client) if writable => self.on_greet_writable(handle),
            (Stage::LocalRequestRead, Half::Client) if readable => self.on_request_readable(handle),
            (Stage::LocalHandshakeWrite, Half::Client) if writable => self.on_handshake_client_writable(handle),
            (Stage::LocalHandshakeWrite, Half::Remote) if writable => self.on_handshake_remote_writable(handle),
            (Stage::LocalAwaitingKey, Half::Remote) if readable => self.on_key_readable(handle),
            (Stage::Relay, Half::Client) if readable => self.on_relay_client_readable(handle),
            (Stage::Relay, Half::Client) if writable => self.on_relay_client_writable(handle),
            (Stage::Relay, Half::Remote) if readable => self.on_relay_remote_readable(handle),
            (Stage::Relay, Half::Remote) if writable => self.on_relay_remote_writable(handle),
            _ => {}
        }
    }

    /// S0: the method-negotiation greeting. Accepts only "no
    /// authentication"; anything else aborts.
    fn on_greet_readable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let Context { client, req, .. } = ctx;
        let client_ref = client.as_mut().expect("client present in S0");
        let outcome = read_until(client_ref, req, socks5::greeting_len_needed);
        let need = match outcome {
            Ok(BlockRead::Pending) => return,
            Ok(BlockRead::Eof) => {
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
            Err(e) => {
                log::debug!("recv() from socks5 client failed during greeting: {e}");
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
            Ok(BlockRead::Ready(need)) => need,
        };

        let ctx = self.pool.get_mut(handle).expect("live handle");
        let greeting = ctx.req.data()[..need].to_vec();
        ctx.req.reset();
        if let Err(e) = socks5::parse_greeting(&greeting) {
            log::warn!("bad socks5 greeting: {e}");
            self.release(handle, ReleaseMask::CLIENT);
            return;
        }

        let reply = socks5::method_reply();
        ctx.res.writable()[..reply.len()].copy_from_slice(&reply);
        ctx.res.commit_write(reply.len());
        ctx.stage = Stage::LocalGreetWrite;
        self.arm(handle.index(), Half::Client, Some(WRITE));
    }

    fn on_greet_writable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let Context { client, res, .. } = ctx;
        let client_ref = client.as_mut().expect("client present in S0");
        match relay::pump_write(client_ref, res) {
            Ok(WriteOutcome::WouldBlock) => {}
            Ok(WriteOutcome::Drained) => {
                let ctx = self.pool.get_mut(handle).expect("live handle");
                ctx.stage = Stage::LocalRequestRead;
                self.arm(handle.index(), Half::Client, Some(READ));
            }
            Err(e) => {
                log::debug!("send() of method reply failed: {e}");
                self.release(handle, ReleaseMask::CLIENT);
            }
        }
    }

    /// S1: the `CONNECT` request. Dials the Fakio server over one
    /// blocking connect, builds the 1024-byte authenticated handshake
    /// block, and queues both that block (to the server) and a
    /// success reply (to the local client).
    fn on_request_readable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let Context { client, req, .. } = ctx;
        let client_ref = client.as_mut().expect("client present in S1");
        let outcome = read_until(client_ref, req, socks5::request_len_needed);
        let need = match outcome {
            Ok(BlockRead::Pending) => return,
            Ok(BlockRead::Eof) => {
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
            Err(e) => {
                log::debug!("recv() from socks5 client failed during request: {e}");
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
            Ok(BlockRead::Ready(need)) => need,
        };

        let ctx = self.pool.get_mut(handle).expect("live handle");
        let request = ctx.req.data()[..need].to_vec();
        ctx.req.reset();
        let (_, target) = match socks5::parse_connect_request(&request) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("bad socks5 request: {e}");
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
        };

        let remote_std = match net::connect_blocking(&self.server_host, self.server_port) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("connect to fakio server {}:{} failed: {e}", self.server_host, self.server_port);
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
        };
        if let Err(e) = remote_std.set_nonblocking(true) {
            log::warn!("set_nonblocking on remote failed: {e}");
        }
        let mut remote = TcpStream::from_std(remote_std);
        if let Err(e) = net::set_nodelay(&remote) {
            log::warn!("set_nodelay on remote failed: {e}");
        }

        let iv = match random::iv16() {
            Ok(iv) => iv,
            Err(e) => {
                log::error!("secure random source unavailable: {e}");
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
        };
        let handshake = match wire::build_handshake_request(&iv, &self.username, &self.user_key, &target) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("failed to build handshake request: {e}");
                self.release(handle, ReleaseMask::CLIENT);
                return;
            }
        };

        let index = handle.index();
        let remote_token = reactor::token_for(index, Half::Remote);
        if let Err(e) = self.events.registry().register(&mut remote, remote_token, WRITE) {
            log::warn!("register(remote) failed: {e}");
            self.release(handle, ReleaseMask::CLIENT);
            return;
        }

        let ctx = self.pool.get_mut(handle).expect("live handle");
        ctx.remote = Some(remote);
        ctx.remote_registered = true;
        ctx.liveness = ctx.liveness.with_remote();
        ctx.req.writable()[..handshake.len()].copy_from_slice(&handshake);
        ctx.req.commit_write(handshake.len());

        let reply = socks5::success_reply(Ipv4Addr::UNSPECIFIED, 0);
        ctx.res.writable()[..reply.len()].copy_from_slice(&reply);
        ctx.res.commit_write(reply.len());

        ctx.stage = Stage::LocalHandshakeWrite;
        self.arm(index, Half::Client, Some(WRITE));
    }

    fn on_handshake_client_writable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let Context { client, res, .. } = ctx;
        let client_ref = client.as_mut().expect("client present in S1/S2");
        match relay::pump_write(client_ref, res) {
            Ok(WriteOutcome::WouldBlock) => {}
            Ok(WriteOutcome::Drained) => {
                self.arm(handle.index(), Half::Client, None);
                self.advance_past_handshake_write(handle);
            }
            Err(e) => {
                log::debug!("send() of success reply to socks5 client failed: {e}");
                self.release(handle, ReleaseMask::BOTH);
            }
        }
    }

    fn on_handshake_remote_writable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let Context { remote, req, .. } = ctx;
        let remote_ref = remote.as_mut().expect("remote present in S1/S2");
        match relay::pump_write(remote_ref, req) {
            Ok(WriteOutcome::WouldBlock) => {}
            Ok(WriteOutcome::Drained) => {
                self.arm(handle.index(), Half::Remote, None);
                self.advance_past_handshake_write(handle);
            }
            Err(e) => {
                log::debug!("send() of handshake request to fakio server failed: {e}");
                self.release(handle, ReleaseMask::BOTH);
            }
        }
    }

    /// Both the success reply (to the local client) and the handshake
    /// block (to the server) are independent writes on independent
    /// sockets; only once both have drained does S2 begin.
    fn advance_past_handshake_write(&mut self, handle: Handle) {
        let ctx = match self.pool.get(handle) {
            Some(ctx) => ctx,
            None => return,
        };
        if !ctx.req.is_empty() || !ctx.res.is_empty() {
            return;
        }
        let ctx = self.pool.get_mut(handle).expect("live handle");
        ctx.stage = Stage::LocalAwaitingKey;
        self.arm(handle.index(), Half::Remote, Some(READ));
    }

    /// S2: the 32-byte handshake reply carrying the session key.
    fn on_key_readable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let Context { remote, res, .. } = ctx;
        let remote_ref = remote.as_mut().expect("remote present in S2");
        let outcome = read_exact_into(remote_ref, res, 32);
        match outcome {
            Ok(BlockRead::Pending) => return,
            Ok(BlockRead::Eof) => {
                log::debug!("fakio server closed during handshake reply");
                self.release(handle, ReleaseMask::BOTH);
                return;
            }
            Err(e) => {
                log::debug!("recv() of handshake reply failed: {e}");
                self.release(handle, ReleaseMask::BOTH);
                return;
            }
            Ok(BlockRead::Ready(_)) => {}
        }

        let ctx = self.pool.get_mut(handle).expect("live handle");
        let reply: [u8; 32] = ctx.res.data().try_into().expect("exactly 32 bytes");
        ctx.res.reset();
        let session_key = wire::parse_handshake_reply(&reply, &self.user_key);
        ctx.session_key = Some(SessionKey(session_key));
        ctx.stage = Stage::Relay;

        let index = handle.index();
        self.arm(index, Half::Client, Some(READ));
        self.arm(index, Half::Remote, Some(READ));
    }

    /// Plain leg: reads application bytes from the local SOCKS5
    /// client and encrypts them into a relay frame bound for the
    /// server (the roles are swapped from `server.rs`: here `client`
    /// is plaintext and `remote` is the ciphered wire leg).
    fn on_relay_client_readable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let session_key = ctx.session_key.expect("set before Stage::Relay").0;
        let Context { client, req, .. } = ctx;
        let client_ref = client.as_mut().expect("client present in relay");
        match relay::pump_read_plain(client_ref, req, &session_key) {
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::FrameReady) => {
                let index = handle.index();
                self.arm(index, Half::Client, None);
                self.arm(index, Half::Remote, Some(WRITE));
            }
            Ok(ReadOutcome::Eof) => {
                log::debug!("socks5 client connection closed");
                self.release(handle, ReleaseMask::CLIENT);
            }
            Err(e) => {
                log::debug!("recv() from socks5 client failed: {e}");
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
                log::debug!("send() to fakio server failed: {e}");
                self.release(handle, ReleaseMask::BOTH);
            }
        }
    }

    /// Wire leg: reads a ciphered relay frame from the server and
    /// decrypts it for delivery to the local SOCKS5 client.
    fn on_relay_remote_readable(&mut self, handle: Handle) {
        let ctx = self.pool.get_mut(handle).expect("live handle");
        let session_key = ctx.session_key.expect("set before Stage::Relay").0;
        let Context { remote, res, .. } = ctx;
        let remote_ref = remote.as_mut().expect("remote present in relay");
        match relay::pump_read_wire(remote_ref, res, &session_key) {
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::FrameReady) => {
                let index = handle.index();
                self.arm(index, Half::Remote, None);
                self.arm(index, Half::Client, Some(WRITE));
            }
            Ok(ReadOutcome::Eof) => {
                log::debug!("fakio server connection closed");
                self.release(handle, ReleaseMask::REMOTE);
            }
            Err(e) => {
                log::debug!("recv() from fakio server failed: {e}");
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
                log::debug!("send() to socks5 client failed: {e}");
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
    fn arm(&mut self, index: usize, half: Half, interest: Option<mio::Interest>) {
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
