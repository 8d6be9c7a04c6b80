//! Wire protocol between rendezvous server and clients.
//!
//! Every message is one leading tag byte, optionally followed by a
//! `host:port` body:
//!
//! | wire          | message   | direction        |
//! |---------------|-----------|------------------|
//! | `<`           | LISTEN    | request          |
//! | `>host:port`  | CONNECT   | request          |
//! | `*host:port`  | HOLEPUNCH | response         |
//! | `?`           | NOT_FOUND | response         |
//! | `.` or empty  | CLOSE     | request/response |
//!
//! The format carries no length or terminator, so [`Message::decode`] works
//! incrementally over an accumulation buffer: callers keep feeding it the
//! buffered bytes until it frames a message or rejects them. A zero-length
//! read (peer gone) is the "empty payload" spelling of CLOSE and is handled
//! at the socket layer, not here.

use std::fmt;
use std::io::{Error as IoError, ErrorKind::Other};
use std::net::{SocketAddr, ToSocketAddrs};

use crate::{Error, Result};

const TAG_LISTEN: u8 = b'<';
const TAG_CONNECT: u8 = b'>';
const TAG_HOLEPUNCH: u8 = b'*';
const TAG_NOT_FOUND: u8 = b'?';
const TAG_CLOSE: u8 = b'.';

/// A `host:port` pair identifying a network destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<A: AsRef<str>>(host: A, port: u16) -> Self {
        Self {
            host: host.as_ref().to_string(),
            port,
        }
    }

    /// Parse `host:port`.
    ///
    /// Bounded splitting on the last `:` (so IPv6 textual hosts survive)
    /// with a range-checked numeric port. Network bytes are never handed to
    /// anything more general than this.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s.rsplit_once(':').ok_or(Error::MalformedMessage)?;
        if host.is_empty() || port.is_empty() || port.len() > 5 {
            return Err(Error::MalformedMessage);
        }
        if !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::MalformedMessage);
        }
        let port = port.parse::<u16>().map_err(|_| Error::MalformedMessage)?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Resolve to a socket address.
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Io(IoError::new(Other, "endpoint resolve fail")))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A rendezvous protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Listen,
    Connect(Endpoint),
    Holepunch(Endpoint),
    NotFound,
    Close,
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Listen => vec![TAG_LISTEN],
            Message::Connect(ep) => body(TAG_CONNECT, ep),
            Message::Holepunch(ep) => body(TAG_HOLEPUNCH, ep),
            Message::NotFound => vec![TAG_NOT_FOUND],
            Message::Close => vec![TAG_CLOSE],
        }
    }

    /// Try to decode one message from the front of `buf`.
    ///
    /// `Ok(None)` means the buffered bytes are only a prefix of a message;
    /// keep reading. On success the returned count is the number of bytes
    /// consumed. A body message is complete once a colon and at least one
    /// port digit are buffered; the whole digit run is consumed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>> {
        let Some(&tag) = buf.first() else {
            return Ok(None);
        };

        match tag {
            TAG_LISTEN => Ok(Some((Message::Listen, 1))),
            TAG_NOT_FOUND => Ok(Some((Message::NotFound, 1))),
            TAG_CLOSE => Ok(Some((Message::Close, 1))),
            TAG_CONNECT => Ok(decode_body(&buf[1..])?
                .map(|(ep, used)| (Message::Connect(ep), used + 1))),
            TAG_HOLEPUNCH => Ok(decode_body(&buf[1..])?
                .map(|(ep, used)| (Message::Holepunch(ep), used + 1))),
            _ => Err(Error::MalformedMessage),
        }
    }
}

fn body(tag: u8, ep: &Endpoint) -> Vec<u8> {
    let mut buf = vec![tag];
    buf.extend_from_slice(ep.to_string().as_bytes());
    buf
}

fn decode_body(body: &[u8]) -> Result<Option<(Endpoint, usize)>> {
    let Some(colon) = body.iter().rposition(|&b| b == b':') else {
        return Ok(None);
    };
    if colon + 1 == body.len() {
        return Ok(None);
    }

    let text = std::str::from_utf8(body).map_err(|_| Error::MalformedMessage)?;
    Endpoint::parse(text).map(|ep| Some((ep, body.len())))
}
