//! Rendezvous server.
//!
//! A single thread multiplexes the listening socket and every open control
//! connection through `poll(2)`. Connections and the registry live on that
//! thread only, and nothing on it blocks: reads are bounded and
//! non-blocking, and partial messages stay in a per-connection buffer until
//! a whole message frames.
//!
//! A CONNECT that finds its target is answered within one loop pass: both
//! HOLEPUNCH replies, the registry removal and both closes happen with no
//! readiness wait in between, so no other request can observe a
//! half-matched pair.

use std::collections::HashMap;
use std::io::{self, Error as IoError, ErrorKind::Other, Read, Write};
use std::net::{IpAddr, Shutdown::Both, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, Socket, Type};

use crate::proto::{Endpoint, Message};
use crate::registry::Registry;
use crate::{Config, Error, Result};

/// Longest readiness wait before the shutdown flag is rechecked.
const POLL_TICK_MS: u16 = 250;

enum ConnState {
    Connected,
    Waiting,
}

/// A client's control connection. Created on accept, removed (the terminal
/// closed state) on match, CLOSE, zero-length read or I/O error.
struct ControlConnection {
    sock: TcpStream,
    peer: SocketAddr,
    state: ConnState,
    buf: Vec<u8>,
}

impl ControlConnection {
    fn endpoint(&self) -> Endpoint {
        self.peer.into()
    }
}

/// Cloneable handle that makes [`Server::run`] return at its next pass.
#[derive(Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Relaxed);
    }

    fn requested(&self) -> bool {
        self.0.load(Relaxed)
    }
}

/// Rendezvous server.
///
/// Matches a CONNECT against the waiting LISTEN entry for the target host
/// and answers both sides with the other's observed endpoint, after which
/// the peers punch directly and the server is out of the path.
pub struct Server {
    listener: TcpListener,
    conns: HashMap<u64, ControlConnection>,
    registry: Registry,
    next_token: u64,
    max_read_bytes: usize,
    shutdown: ShutdownHandle,
}

impl Server {
    pub fn new(cfg: &Config) -> Result<Self> {
        let addr = (cfg.bind_host.as_str(), cfg.bind_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Io(IoError::new(Other, "bind address resolve fail")))?;

        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        #[cfg(unix)]
        sock.set_reuse_port(true)?;
        sock.bind(&addr.into())?;
        sock.listen(cfg.backlog)?;
        sock.set_nonblocking(true)?;
        let listener: TcpListener = sock.into();

        log::info!("listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            conns: HashMap::new(),
            registry: Registry::default(),
            next_token: 0,
            max_read_bytes: cfg.max_read_bytes,
            shutdown: ShutdownHandle::default(),
        })
    }

    /// Observed listen address (useful when bound to port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for stopping the reactor from another thread.
    pub fn handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Drive the reactor until shutdown is requested.
    ///
    /// No client behavior stops the loop; malformed input and I/O failures
    /// cost at most the offending connection.
    pub fn run(mut self) -> Result<()> {
        loop {
            if self.shutdown.requested() {
                log::info!("shutdown, closing {} connections", self.conns.len());
                for (_, conn) in self.conns.drain() {
                    let _ = conn.sock.shutdown(Both);
                }
                return Ok(());
            }

            let (accept_ready, ready) = self.wait_ready()?;

            if accept_ready {
                self.accept_pending();
            }
            for token in ready {
                self.handle_readable(token);
            }
        }
    }

    /// Readiness wait over {listener} ∪ {control sockets}, capped at
    /// [`POLL_TICK_MS`].
    fn wait_ready(&self) -> Result<(bool, Vec<u64>)> {
        let tokens: Vec<u64> = self.conns.keys().copied().collect();

        let mut fds = Vec::with_capacity(tokens.len() + 1);
        fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        for token in &tokens {
            fds.push(PollFd::new(self.conns[token].sock.as_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::from(POLL_TICK_MS)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok((false, Vec::new())),
            Err(e) => return Err(io::Error::from(e).into()),
        }

        let readable = |fd: &PollFd| {
            fd.revents()
                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
                .unwrap_or(false)
        };

        let accept_ready = readable(&fds[0]);
        let ready = tokens
            .into_iter()
            .zip(&fds[1..])
            .filter(|(_, fd)| readable(fd))
            .map(|(token, _)| token)
            .collect();

        Ok((accept_ready, ready))
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((sock, peer)) => {
                    if let Err(e) = sock.set_nonblocking(true) {
                        log::debug!("accept {}: {}", peer, e);
                        continue;
                    }
                    let token = self.next_token;
                    self.next_token += 1;
                    log::debug!("accept {} (#{})", peer, token);
                    self.conns.insert(
                        token,
                        ControlConnection {
                            sock,
                            peer,
                            state: ConnState::Connected,
                            buf: Vec::new(),
                        },
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("accept: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, token: u64) {
        let mut chunk = vec![0u8; self.max_read_bytes];

        // May be gone already: matched or evicted earlier in this pass.
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        match conn.sock.read(&mut chunk) {
            Ok(0) => {
                log::debug!("{} disconnect (#{})", conn.peer, token);
                self.close(token);
                return;
            }
            Ok(n) => conn.buf.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                log::debug!("{} read error: {} (#{})", conn.peer, e, token);
                self.close(token);
                return;
            }
        }

        self.drain_messages(token);
    }

    fn drain_messages(&mut self, token: u64) {
        enum Step {
            Msg(Message),
            Wait,
            Garbage,
        }

        let cap = self.max_read_bytes;
        loop {
            let step = match self.conns.get_mut(&token) {
                None => return,
                Some(conn) => match Message::decode(&conn.buf) {
                    Ok(Some((msg, used))) => {
                        conn.buf.drain(..used);
                        Step::Msg(msg)
                    }
                    Ok(None) if conn.buf.len() >= cap => {
                        conn.buf.clear();
                        Step::Garbage
                    }
                    Ok(None) => Step::Wait,
                    Err(_) => {
                        conn.buf.clear();
                        Step::Garbage
                    }
                },
            };

            match step {
                Step::Msg(msg) => self.dispatch(token, msg),
                Step::Wait => return,
                Step::Garbage => {
                    // No resync point in this format: drop the bytes, fail
                    // the request, keep the connection.
                    log::debug!("#{} malformed input", token);
                    self.reply(token, Message::NotFound);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, token: u64, msg: Message) {
        log::trace!("#{} {:?}", token, msg);
        match msg {
            Message::Listen => self.handle_listen(token),
            Message::Connect(target) => self.handle_connect(token, target),
            Message::Close => self.close(token),
            // Clients never legitimately send responses.
            Message::Holepunch(_) | Message::NotFound => self.reply(token, Message::NotFound),
        }
    }

    fn handle_listen(&mut self, token: u64) {
        let host = match self.conns.get_mut(&token) {
            None => return,
            Some(conn) => match conn.state {
                // Already waiting: a confused client. Fail the request but
                // keep the registration.
                ConnState::Waiting => None,
                ConnState::Connected => {
                    conn.state = ConnState::Waiting;
                    log::debug!("{} waiting (#{})", conn.peer, token);
                    Some(conn.peer.ip())
                }
            },
        };

        let Some(host) = host else {
            self.reply(token, Message::NotFound);
            return;
        };

        // No reply; the client blocks until a CONNECT for this host comes
        // in. An earlier waiter for the host is evicted and failed.
        if let Some(evicted) = self.registry.register(host, token) {
            log::debug!("evict #{} for {}", evicted, host);
            self.reply(evicted, Message::NotFound);
            self.close(evicted);
        }
    }

    fn handle_connect(&mut self, token: u64, target: Endpoint) {
        let connected = match self.conns.get(&token) {
            None => return,
            Some(conn) => matches!(conn.state, ConnState::Connected),
        };
        if !connected {
            self.reply(token, Message::NotFound);
            return;
        }

        let peer_token = target
            .host
            .parse::<IpAddr>()
            .ok()
            .and_then(|host| self.registry.lookup(&host))
            .filter(|peer| self.conns.contains_key(peer));

        let Some(peer_token) = peer_token else {
            log::debug!("#{} target {} not found", token, target);
            self.reply(token, Message::NotFound);
            return;
        };

        let peer_ep = self.conns[&peer_token].endpoint();
        let self_ep = self.conns[&token].endpoint();
        log::debug!("match {} <-> {}", self_ep, peer_ep);

        self.reply(token, Message::Holepunch(peer_ep));
        self.reply(peer_token, Message::Holepunch(self_ep));
        self.close(peer_token);
        self.close(token);
    }

    fn reply(&mut self, token: u64, msg: Message) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if let Err(e) = conn.sock.write_all(&msg.encode()) {
            log::debug!("{} write error: {} (#{})", conn.peer, e, token);
            self.close(token);
        }
    }

    /// Remove and close a control connection. Idempotent.
    fn close(&mut self, token: u64) {
        if let Some(conn) = self.conns.remove(&token) {
            self.registry.remove(&conn.peer.ip(), token);
            let _ = conn.sock.shutdown(Both);
        }
    }
}
