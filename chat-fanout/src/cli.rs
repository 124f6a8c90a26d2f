use std::net::{IpAddr, SocketAddr};

use clap::{Args, Parser, Subcommand};

use crate::config::{DEFAULT_PORT, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the fan-out server until interrupted.
    Server(ServerArgs),
    /// Connect to a server and exchange lines over stdin/stdout.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address of the interface to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// TCP port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig::new(self.port).with_host(self.host)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:7000")]
    pub server: SocketAddr,
}
