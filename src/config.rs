use std::time::Duration;

/// Settings for the rendezvous server and the punch engines.
///
/// Collaborators (the CLI, embedding applications) build one, override what
/// they need and hand it to `Server::new` or the puncher constructors.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the rendezvous server binds to.
    pub bind_host: String,
    pub bind_port: u16,
    /// Listen backlog of the rendezvous socket.
    pub backlog: i32,
    /// Upper bound for a single read and for an unframed per-connection
    /// buffer.
    pub max_read_bytes: usize,
    /// Overall deadline for one punch attempt.
    pub punch_timeout: Duration,
    /// Punch datagram retransmissions (UDP) before giving up.
    pub punch_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 20000,
            backlog: 5,
            max_read_bytes: 65535,
            punch_timeout: Duration::from_secs(10),
            punch_retries: 5,
        }
    }
}
