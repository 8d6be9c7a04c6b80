//! UDP hole punching.
//!
//! Symmetric: each side fires a punch datagram at the other's observed
//! endpoint (opening its own NAT's outbound-triggered mapping) and waits
//! for anything inbound from the peer. UDP has no connection state, so the
//! engine does the peer filtering itself; strangers are dropped without
//! resetting the wait. Silence is answered with a bounded number of
//! retransmissions, then [`Error::PunchTimeout`].

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use super::{dgram_socket, Puncher, Role};
use crate::{Config, Error, Result};

const PUNCH: &[u8] = b"*";

/// UDP punch engine.
#[derive(Debug, Clone)]
pub struct UdpPuncher {
    timeout: Duration,
    retries: u32,
}

impl UdpPuncher {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self { timeout, retries }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.punch_timeout, cfg.punch_retries)
    }
}

impl Default for UdpPuncher {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Puncher for UdpPuncher {
    type Conn = UdpSocket;

    fn punch(&self, local: SocketAddr, peer: SocketAddr, _role: Role) -> Result<UdpSocket> {
        log::debug!("udp punch {} -> {}", local, peer);
        let sock: UdpSocket = dgram_socket(local)?.into();

        // The budget split across the initial punch and each retransmission.
        let window = self.timeout / (self.retries + 1);
        let deadline = Instant::now() + self.timeout;

        for _ in 0..=self.retries {
            sock.send_to(PUNCH, peer)?;
            let attempt_deadline = (Instant::now() + window).min(deadline);

            loop {
                let remaining = attempt_deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                sock.set_read_timeout(Some(remaining))?;

                let mut buf = [0u8; 1500];
                match sock.recv_from(&mut buf) {
                    Ok((_, from)) if from == peer => {
                        sock.connect(peer)?;
                        drain_punches(&sock)?;
                        sock.set_read_timeout(None)?;
                        return Ok(sock);
                    }
                    Ok((n, from)) => log::debug!("discard {} bytes from {}", n, from),
                    Err(ref e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) =>
                    {
                        break;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Err(Error::PunchTimeout(self.timeout))
    }
}

/// A retransmitted punch datagram can still be queued after the match; eat
/// those so they never surface as application data.
fn drain_punches(sock: &UdpSocket) -> Result<()> {
    sock.set_nonblocking(true)?;
    let mut buf = [0u8; 1500];
    loop {
        match sock.peek(&mut buf) {
            Ok(n) if buf[..n] == *PUNCH => {
                let _ = sock.recv(&mut buf)?;
            }
            _ => break,
        }
    }
    sock.set_nonblocking(false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn reserve_addr() -> SocketAddr {
        UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
    }

    #[test]
    fn punch_between_two_local_peers() {
        let a1 = reserve_addr();
        let a2 = reserve_addr();

        let puncher = UdpPuncher::new(Duration::from_secs(5), 4);
        let other = puncher.clone();
        let gate = Arc::new(Barrier::new(2));
        let gate2 = gate.clone();

        let t = thread::spawn(move || {
            let sock = other.punch(a1, a2, Role::Listener).unwrap();
            gate2.wait();
            sock.send(b"ping").unwrap();
            let mut buf = [0u8; 4];
            sock.recv(&mut buf).unwrap();
            buf
        });

        let sock = puncher.punch(a2, a1, Role::Dialer).unwrap();
        gate.wait();
        let mut buf = [0u8; 4];
        sock.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        sock.send(b"pong").unwrap();

        assert_eq!(&t.join().unwrap(), b"pong");
    }

    #[test]
    fn stranger_datagrams_are_discarded() {
        let engine_local = reserve_addr();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let puncher = UdpPuncher::new(Duration::from_secs(5), 4);
        let t = thread::spawn(move || puncher.punch(engine_local, peer_addr, Role::Dialer));

        // Wait for the engine's punch so we know it is up.
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"*");
        assert_eq!(from, engine_local);

        // A stranger's datagram must not complete the punch.
        stranger.send_to(b"nonsense", engine_local).unwrap();
        thread::sleep(Duration::from_millis(200));
        peer.send_to(b"*", engine_local).unwrap();

        let sock = t.join().unwrap().unwrap();
        assert_eq!(sock.peer_addr().unwrap(), peer_addr);
    }

    #[test]
    fn punch_times_out_in_silence() {
        let engine_local = reserve_addr();
        let silent = reserve_addr();

        let puncher = UdpPuncher::new(Duration::from_millis(300), 2);
        let err = puncher.punch(engine_local, silent, Role::Dialer).unwrap_err();
        assert!(matches!(err, Error::PunchTimeout(_)));
    }
}
