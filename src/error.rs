//! Crate-wide error type.
//!
//! Kept as a plain enum with hand-written `Display`/`Error` impls,
//! matching the rest of the ambient stack: no `thiserror`, just the
//! conversions call sites actually need so `?` composes through I/O
//! and config-parsing boundaries.
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// Configuration file missing, unreadable, or missing a required key.
    Config(String),
    /// Listener bind/listen failed at startup.
    Bind(io::Error),
    /// A socket operation failed for a reason other than WouldBlock.
    Io(io::Error),
    /// The SOCKS5 greeting or request was malformed.
    Socks5(&'static str),
    /// The 1024-byte handshake block was short, corrupt, or named an
    /// unknown user.
    Handshake(&'static str),
    /// The connecting user is not in the user directory.
    UnknownUser,
    /// The context pool has no free slots.
    PoolExhausted,
    /// The secure random source could not produce bytes.
    RandomUnavailable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::Bind(e) => write!(f, "bind/listen failed: {e}"),
            Error::Io(e) => write!(f, "i/o error: {e}"),
            Error::Socks5(msg) => write!(f, "socks5 protocol error: {msg}"),
            Error::Handshake(msg) => write!(f, "handshake error: {msg}"),
            Error::UnknownUser => write!(f, "unknown user"),
            Error::PoolExhausted => write!(f, "context pool exhausted"),
            Error::RandomUnavailable => write!(f, "secure random source unavailable"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
