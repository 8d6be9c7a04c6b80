use std::io;
use std::time::Duration;

/// Errors surfaced by the rendezvous client, server and punch engines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bytes that do not decode as a protocol message.
    #[error("malformed protocol message")]
    MalformedMessage,

    /// The server answered NOT_FOUND, or closed the exchange without
    /// introducing a peer.
    #[error("rendezvous rejected by server")]
    RendezvousRejected,

    /// The punch retry/timeout budget was spent without a peer socket.
    #[error("hole punch timed out after {0:?}")]
    PunchTimeout(Duration),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
