use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use signal_relay::RelayConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub relay: RelayConfig,
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-relay",
    author,
    version,
    about = "Signaling relay for WebRTC negotiation between endpoints"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    pub listen_addr: String,

    /// Echo endpoint log lines through the relay's own logger.
    #[arg(long, env = "BEACH_RELAY_DEV_MODE", default_value_t = false)]
    pub dev_mode: bool,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(ServerConfig {
            listen_addr,
            relay: RelayConfig {
                dev_mode: cli.dev_mode,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn cli_flags_become_server_config() {
        let cli = Cli::parse_from(["beach-relay", "--listen-addr", "0.0.0.0:9000", "--dev-mode"]);
        let config = ServerConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert!(config.relay.dev_mode);
    }

    #[test_timeout::timeout]
    fn rejects_unparseable_address() {
        let cli = Cli::parse_from(["beach-relay", "--listen-addr", "not-an-addr"]);
        let err = ServerConfig::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("not-an-addr"));
    }
}
