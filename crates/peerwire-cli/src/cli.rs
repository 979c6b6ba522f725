//! Command-line interface definitions and parsing

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Logical name this node identifies as
    #[arg(short, long)]
    pub name: Option<String>,

    /// Payload codec (bincode or json)
    #[arg(long)]
    pub codec: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a TCP server and print text messages from peers
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },
    /// Connect to a TCP server, identify, send one text message and exit
    Send {
        /// Server address
        #[arg(short, long)]
        addr: String,
        /// Message content
        message: String,
    },
    /// Scan for peerwire BLE peripherals
    BleScan,
    /// Connect to a BLE peer by logical name and send one text message
    BleSend {
        /// Logical name advertised by the peer
        #[arg(short, long)]
        to: String,
        /// Message content
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_before_subcommand() {
        let cli = Cli::try_parse_from([
            "peerwire",
            "--name",
            "laptop",
            "send",
            "--addr",
            "127.0.0.1:47800",
            "hello there",
        ])
        .unwrap();
        assert_eq!(cli.name.as_deref(), Some("laptop"));
        match cli.command {
            Commands::Send { addr, message } => {
                assert_eq!(addr, "127.0.0.1:47800");
                assert_eq!(message, "hello there");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn serve_bind_must_be_a_socket_address() {
        assert!(Cli::try_parse_from(["peerwire", "serve", "--bind", "not-an-addr"]).is_err());
        let cli = Cli::try_parse_from(["peerwire", "serve", "-b", "0.0.0.0:9000"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { bind: Some(a) } if a.port() == 9000));
    }

    #[test]
    fn ble_send_requires_target() {
        assert!(Cli::try_parse_from(["peerwire", "ble-send", "hi"]).is_err());
    }
}
