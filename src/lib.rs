//!Rendezvous and hole punching for P2P communication across NAT/firewall.
//!
//!Two peers behind NAT (or a firewall that only allows outbound
//!connections) cannot talk directly until each has sent traffic toward the
//!other's externally visible endpoint. The rendezvous server exists to
//!teach them those endpoints and line up the attempt; it never carries
//!application data.
//!
//!## How it works
//!A listening peer opens a control connection to the server from the local
//!port it intends to punch with and sends LISTEN. A connecting peer does
//!the same and sends CONNECT with the target's host:port. The server
//!matches the pair, answers both sides with HOLEPUNCH carrying the other's
//!observed address, and closes the control connections. Each peer then
//!rebinds the same local port and punches: TCP dials until the SYNs cross
//!or land on the listening side's acceptor, UDP fires punch datagrams and
//!filters inbound traffic down to the peer.
//!
//!The essential is that control connection and punch socket share one
//!local port, so the NAT mapping the server observed is the one the peer's
//!packets will hit. The implementation depends on SO_REUSEADDR (and
//!SO_REUSEPORT on unix), so it is OS dependent.
//!
//!## Feature flags
//!For convenience the crate includes both client and server code by
//!default. Mostly you only need one side:
//!
//!```toml
//!holepunch = { version = "0.1", default-features = false, features = ["client"] }
//!```
//!
//!- `client`: rendezvous client and the TCP/UDP punch engines
//!- `server`: rendezvous server (single-threaded reactor)

mod config;
mod error;
pub mod proto;

pub use config::Config;
pub use error::{Error, Result};

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub mod punch;

#[cfg(feature = "server")]
mod registry;
#[cfg(feature = "server")]
pub mod server;
