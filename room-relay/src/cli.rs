use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = crate::config::DEFAULT_LISTEN_ADDR)]
    pub listen: SocketAddr,

    /// Maximum number of simultaneously connected clients.
    #[arg(long, default_value_t = crate::config::DEFAULT_CAPACITY, value_parser = parse_capacity)]
    pub capacity: usize,

    /// Drop a client whose socket does not accept a frame within this many milliseconds.
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = crate::config::DEFAULT_LISTEN_ADDR)]
    pub server: SocketAddr,
}

fn parse_capacity(raw: &str) -> Result<usize, String> {
    let capacity: usize = raw
        .parse()
        .map_err(|_| format!("'{raw}' is not a number"))?;
    if capacity == 0 {
        return Err("capacity must be at least 1".to_string());
    }
    Ok(capacity)
}
