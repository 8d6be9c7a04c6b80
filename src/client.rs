//! Rendezvous client.
//!
//! Drives the LISTEN/CONNECT exchange with the rendezvous server over a
//! short-lived control connection, then runs the punch engine against the
//! peer endpoint the server observed.
//!
//! The control connection and the punch socket share one local port. Many
//! NATs keep the (local port → external port) mapping alive for a short
//! window after the control socket closes, but only when the same local
//! port is rebound; that timing dependency is what the reuse options and
//! the engines' retry budgets exist for.

use std::io::{self, Error as IoError, ErrorKind::Other, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use crate::proto::{Endpoint, Message};
use crate::punch::{stream_socket, Puncher, Role};
use crate::{Config, Error, Result};

/// Rendezvous client, generic over the punch transport.
///
/// # Example
/// ```no_run
/// use holepunch::client::Client;
/// use holepunch::punch::TcpPuncher;
///
/// let mut c = Client::new(
///     "rendezvous.example.net:20000",
///     "0.0.0.0:20001".parse().unwrap(),
///     TcpPuncher::default(),
/// ).unwrap();
/// let stream = c.listen().unwrap();
/// ```
pub struct Client<P> {
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    puncher: P,
    max_read_bytes: usize,
}

impl<P: Puncher> Client<P> {
    /// `local_addr` picks the port shared by the control connection and the
    /// punch socket; port 0 lets the OS choose one.
    pub fn new(server_addr: &str, local_addr: SocketAddr, puncher: P) -> Result<Self> {
        let server_addr = server_addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Io(IoError::new(Other, "server name resolve fail")))?;

        Ok(Self {
            server_addr,
            local_addr,
            puncher,
            max_read_bytes: Config::default().max_read_bytes,
        })
    }

    /// Wait to be introduced to a peer, then punch toward it.
    ///
    /// Blocks until the server sends HOLEPUNCH; NOT_FOUND or a malformed
    /// reply fails with [`Error::RendezvousRejected`].
    pub fn listen(&mut self) -> Result<P::Conn> {
        self.rendezvous(Message::Listen, Role::Listener)
    }

    /// Ask the server to introduce `target`, then punch toward it.
    pub fn connect(&mut self, target: &Endpoint) -> Result<P::Conn> {
        self.rendezvous(Message::Connect(target.clone()), Role::Dialer)
    }

    fn rendezvous(&mut self, request: Message, role: Role) -> Result<P::Conn> {
        let mut control = self.connect_server()?;
        let local_addr = control.local_addr()?;
        log::debug!("control {} -> {}", local_addr, self.server_addr);

        control.write_all(&request.encode())?;
        let reply = self.read_reply(&mut control)?;
        drop(control);

        match reply {
            Message::Holepunch(peer) => {
                log::debug!("introduced to {}", peer);
                let peer_addr = peer.to_socket_addr()?;
                self.puncher.punch(local_addr, peer_addr, role)
            }
            _ => Err(Error::RendezvousRejected),
        }
    }

    fn connect_server(&self) -> Result<TcpStream> {
        let sock = stream_socket(self.local_addr)?;
        sock.connect(&self.server_addr.into())?;
        Ok(sock.into())
    }

    /// Block for one framed reply; partial reads stay buffered.
    fn read_reply(&self, control: &mut TcpStream) -> Result<Message> {
        let mut buf = Vec::new();
        let mut chunk = vec![0u8; self.max_read_bytes];

        loop {
            let n = match control.read(&mut chunk) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                // Server hung up without a verdict.
                return Ok(Message::Close);
            }
            buf.extend_from_slice(&chunk[..n]);

            match Message::decode(&buf) {
                Ok(Some((msg, _))) => return Ok(msg),
                Ok(None) if buf.len() >= self.max_read_bytes => {
                    return Err(Error::RendezvousRejected)
                }
                Ok(None) => {}
                Err(_) => return Err(Error::RendezvousRejected),
            }
        }
    }
}

#[cfg(all(test, feature = "server"))]
mod tests {
    use super::*;
    use crate::punch::{TcpPuncher, UdpPuncher};
    use crate::server::Server;
    use std::net::{TcpListener, UdpSocket};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn start_server() -> (SocketAddr, crate::server::ShutdownHandle) {
        let cfg = Config {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 0,
            ..Config::default()
        };
        let server = Server::new(&cfg).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        thread::spawn(move || server.run());
        (addr, handle)
    }

    fn reserve_tcp_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn local(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// The server answers a CONNECT with no waiter with NOT_FOUND, which
    /// the client surfaces as a rejection.
    #[test]
    fn connect_without_listener_is_rejected() {
        let (addr, stop) = start_server();

        let mut c = Client::new(
            &addr.to_string(),
            local(0),
            TcpPuncher::new(Duration::from_secs(1)),
        )
        .unwrap();

        let err = c.connect(&Endpoint::new("203.0.113.9", 999)).unwrap_err();
        assert!(matches!(err, Error::RendezvousRejected));

        stop.shutdown();
    }

    #[test]
    fn tcp_rendezvous_end_to_end() {
        let (addr, stop) = start_server();
        let server_addr = addr.to_string();

        let p1 = reserve_tcp_port();
        let sa = server_addr.clone();
        let t = thread::spawn(move || {
            let mut c = Client::new(
                &sa,
                local(p1),
                TcpPuncher::new(Duration::from_secs(10)),
            )
            .unwrap();
            let mut s = c.listen().unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).unwrap();
            s.write_all(b"world").unwrap();
            buf
        });

        // Keep asking until the listener is registered, as the demo
        // clients do.
        let mut stream = None;
        for _ in 0..50 {
            let mut c = Client::new(
                &server_addr,
                local(0),
                TcpPuncher::new(Duration::from_secs(10)),
            )
            .unwrap();
            match c.connect(&Endpoint::new("127.0.0.1", p1)) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(Error::RendezvousRejected) => {
                    thread::sleep(Duration::from_millis(100))
                }
                Err(e) => panic!("{}", e),
            }
        }
        let mut s = stream.expect("listener never registered");

        s.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        s.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(&t.join().unwrap(), b"hello");

        stop.shutdown();
    }

    #[test]
    fn udp_rendezvous_end_to_end() {
        let (addr, stop) = start_server();
        let server_addr = addr.to_string();

        let p1 = reserve_tcp_port();
        let gate = Arc::new(Barrier::new(2));

        let sa = server_addr.clone();
        let gate2 = gate.clone();
        let t = thread::spawn(move || {
            let mut c = Client::new(
                &sa,
                local(p1),
                UdpPuncher::new(Duration::from_secs(10), 5),
            )
            .unwrap();
            let sock: UdpSocket = c.listen().unwrap();
            gate2.wait();
            sock.send(b"ping").unwrap();
            let mut buf = [0u8; 4];
            sock.recv(&mut buf).unwrap();
            buf
        });

        let mut sock = None;
        for _ in 0..50 {
            let mut c = Client::new(
                &server_addr,
                local(0),
                UdpPuncher::new(Duration::from_secs(10), 5),
            )
            .unwrap();
            match c.connect(&Endpoint::new("127.0.0.1", p1)) {
                Ok(s) => {
                    sock = Some(s);
                    break;
                }
                Err(Error::RendezvousRejected) => {
                    thread::sleep(Duration::from_millis(100))
                }
                Err(e) => panic!("{}", e),
            }
        }
        let sock = sock.expect("listener never registered");
        gate.wait();

        let mut buf = [0u8; 4];
        sock.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        sock.send(b"pong").unwrap();
        assert_eq!(&t.join().unwrap(), b"pong");

        stop.shutdown();
    }
}
