//! TCP hole punching.
//!
//! Both sides bind their control-connection port and send SYNs at each
//! other. The dialer retries a bounded connect until one completes; when
//! the remote side dials too, the crossing SYNs finish as a simultaneous
//! open. The listener keeps an acceptor on the port and nudges the peer
//! with short, discarded dials whose only purpose is opening the local
//! NAT's outbound-triggered mapping.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use super::{stream_socket, Puncher, Role};
use crate::{Config, Error, Result};

/// First retry delay; doubled per round up to [`MAX_BACKOFF`], plus jitter.
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
/// Cap for a single connect attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const JITTER_MS: u64 = 50;

/// TCP punch engine.
#[derive(Debug, Clone)]
pub struct TcpPuncher {
    timeout: Duration,
}

impl TcpPuncher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.punch_timeout)
    }
}

impl Default for TcpPuncher {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Puncher for TcpPuncher {
    type Conn = TcpStream;

    fn punch(&self, local: SocketAddr, peer: SocketAddr, role: Role) -> Result<TcpStream> {
        log::debug!("tcp punch {} -> {} as {:?}", local, peer, role);
        let deadline = Instant::now() + self.timeout;
        match role {
            Role::Dialer => dial(local, peer, deadline, self.timeout),
            Role::Listener => accept(local, peer, deadline, self.timeout),
        }
    }
}

fn dial(local: SocketAddr, peer: SocketAddr, deadline: Instant, budget: Duration) -> Result<TcpStream> {
    let mut backoff = INITIAL_BACKOFF;
    let mut rng = rand::thread_rng();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::PunchTimeout(budget));
        }

        let sock = stream_socket(local)?;
        match sock.connect_timeout(&peer.into(), DIAL_TIMEOUT.min(remaining)) {
            Ok(()) => return Ok(sock.into()),
            Err(e) => log::trace!("dial {}: {}", peer, e),
        }

        let jitter = Duration::from_millis(rng.gen_range(0..=JITTER_MS));
        let nap = (backoff + jitter).min(deadline.saturating_duration_since(Instant::now()));
        thread::sleep(nap);
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn accept(local: SocketAddr, peer: SocketAddr, deadline: Instant, budget: Duration) -> Result<TcpStream> {
    let sock = stream_socket(local)?;
    sock.listen(1)?;
    sock.set_nonblocking(true)?;
    let listener: TcpListener = sock.into();

    let mut backoff = INITIAL_BACKOFF;
    let mut rng = rand::thread_rng();

    loop {
        match listener.accept() {
            Ok((stream, from)) if from.ip() == peer.ip() => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Ok((_, from)) => log::debug!("discard connection from {}", from),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::PunchTimeout(budget));
        }

        // Usually doomed; it exists to open the NAT mapping so the peer's
        // SYNs can land on the acceptor. If the SYNs cross it completes as
        // a simultaneous open and wins outright.
        if let Ok(nudge) = stream_socket(local) {
            match nudge.connect_timeout(&peer.into(), DIAL_TIMEOUT.min(remaining)) {
                Ok(()) => return Ok(nudge.into()),
                Err(e) => log::trace!("nudge {}: {}", peer, e),
            }
        }

        let jitter = Duration::from_millis(rng.gen_range(0..=JITTER_MS));
        let nap = (backoff + jitter).min(deadline.saturating_duration_since(Instant::now()));
        thread::sleep(nap);
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn reserve_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn punch_between_two_local_peers() {
        let a1: SocketAddr = format!("127.0.0.1:{}", reserve_port()).parse().unwrap();
        let a2: SocketAddr = format!("127.0.0.1:{}", reserve_port()).parse().unwrap();

        let puncher = TcpPuncher::new(Duration::from_secs(10));
        let listener_side = puncher.clone();
        let t = thread::spawn(move || {
            let mut s = listener_side.punch(a1, a2, Role::Listener).unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).unwrap();
            s.write_all(b"pong").unwrap();
            buf
        });

        let mut s = puncher.punch(a2, a1, Role::Dialer).unwrap();
        s.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        s.read_exact(&mut buf).unwrap();

        assert_eq!(&buf, b"pong");
        assert_eq!(&t.join().unwrap(), b"ping");
    }

    #[test]
    fn dial_times_out_against_a_dead_peer() {
        let local: SocketAddr = format!("127.0.0.1:{}", reserve_port()).parse().unwrap();
        let dead: SocketAddr = format!("127.0.0.1:{}", reserve_port()).parse().unwrap();

        let puncher = TcpPuncher::new(Duration::from_millis(300));
        let err = puncher.punch(local, dead, Role::Dialer).unwrap_err();
        assert!(matches!(err, Error::PunchTimeout(_)));
    }

    #[test]
    fn acceptor_ignores_strangers() {
        let local: SocketAddr = format!("127.0.0.1:{}", reserve_port()).parse().unwrap();
        // A peer that never shows up, from an address no stranger uses.
        let peer: SocketAddr = "127.0.0.2:19999".parse().unwrap();

        let puncher = TcpPuncher::new(Duration::from_secs(2));
        let t = thread::spawn(move || puncher.punch(local, peer, Role::Listener));

        thread::sleep(Duration::from_millis(300));
        // A connection from the wrong host is discarded, not returned.
        let _stranger = TcpStream::connect(local);

        let err = t.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::PunchTimeout(_)));
    }
}
