use std::net::SocketAddr;

use structopt::StructOpt;

use holepunch::client::Client;
use holepunch::proto::Endpoint;
use holepunch::punch::{TcpPuncher, UdpPuncher};
use holepunch::server::Server;
use holepunch::{Config, Result};

#[derive(StructOpt, Debug)]
#[structopt(name = "holepunch")]
enum Opt {
    /// Run the rendezvous server
    Server(ServerOpt),
    /// Rendezvous with a peer through a server
    Client(ClientOpt),
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "bind-host", default_value = "0.0.0.0")]
    bind_host: String,

    #[structopt(long = "bind-port", default_value = "20000")]
    bind_port: u16,
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "server-addr")]
    server_addr: String,

    /// Local port shared by the control connection and the punch socket
    #[structopt(long = "local-port", default_value = "0")]
    local_port: u16,

    #[structopt(long = "transport", default_value = "tcp", possible_values = &["tcp", "udp"])]
    transport: String,

    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(StructOpt, Debug)]
enum Cmd {
    /// Wait for a peer to connect
    Listen,
    /// Connect to a listening peer
    Connect {
        /// Peer as host:port
        peer: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    match Opt::from_args() {
        Opt::Server(opt) => run_server(opt),
        Opt::Client(opt) => run_client(opt),
    }
}

fn run_server(opt: ServerOpt) -> Result<()> {
    let cfg = Config {
        bind_host: opt.bind_host,
        bind_port: opt.bind_port,
        ..Config::default()
    };

    Server::new(&cfg)?.run()
}

fn run_client(opt: ClientOpt) -> Result<()> {
    let cfg = Config::default();
    let local: SocketAddr = ([0, 0, 0, 0], opt.local_port).into();

    match opt.transport.as_str() {
        "udp" => {
            let mut c = Client::new(&opt.server_addr, local, UdpPuncher::from_config(&cfg))?;
            let sock = match opt.cmd {
                Cmd::Listen => c.listen()?,
                Cmd::Connect { ref peer } => c.connect(&Endpoint::parse(peer)?)?,
            };
            log::info!(
                "peer socket ready: {} <-> {}",
                sock.local_addr()?,
                sock.peer_addr()?
            );
        }
        _ => {
            let mut c = Client::new(&opt.server_addr, local, TcpPuncher::from_config(&cfg))?;
            let stream = match opt.cmd {
                Cmd::Listen => c.listen()?,
                Cmd::Connect { ref peer } => c.connect(&Endpoint::parse(peer)?)?,
            };
            log::info!(
                "peer socket ready: {} <-> {}",
                stream.local_addr()?,
                stream.peer_addr()?
            );
        }
    }

    Ok(())
}
