//! Server configuration (spec §6 "Configuration (in-memory)").

use clap::Parser;

/// A configured peer: `(name, shared_secret, address, port)` per spec §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServerRecord {
    pub name: String,
    pub shared_secret: String,
    pub address: String,
    pub port: u16,
}

impl std::str::FromStr for RemoteServerRecord {
    type Err = String;

    /// Parses `name:secret:address:port`, matching the flag format below.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(4, ':').collect();
        let [name, secret, address, port] = parts.as_slice() else {
            return Err(format!(
                "expected name:secret:address:port, got {s:?}"
            ));
        };
        let port = port
            .parse()
            .map_err(|e| format!("invalid port in {s:?}: {e}"))?;
        Ok(RemoteServerRecord {
            name: (*name).to_string(),
            shared_secret: (*secret).to_string(),
            address: (*address).to_string(),
            port,
        })
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "tsircd", about = "TS/J10-style IRC daemon kernel")]
pub struct ServerConfig {
    /// Address clients connect to.
    #[arg(long, env = "TSIRCD_CLIENT_ADDR", default_value = "0.0.0.0:6667")]
    pub client_addr: String,

    /// Address peer servers connect to.
    #[arg(long, env = "TSIRCD_SERVER_ADDR", default_value = "0.0.0.0:4400")]
    pub peer_addr: String,

    /// This server's one-character routing token (spec §3 "Peer server").
    #[arg(long, env = "TSIRCD_TOKEN", default_value = "A")]
    pub token: String,

    /// This server's display name.
    #[arg(long, env = "TSIRCD_SERVER_NAME", default_value = "irc.example.net")]
    pub server_name: String,

    /// The network's display name.
    #[arg(long, env = "TSIRCD_NETWORK_NAME", default_value = "ExampleNet")]
    pub network_name: String,

    /// Server description, sent in netburst `S` lines.
    #[arg(long, env = "TSIRCD_DESCRIPTION", default_value = "tsircd server")]
    pub description: String,

    /// Optional path to a MOTD text file.
    #[arg(long, env = "TSIRCD_MOTD_FILE")]
    pub motd_file: Option<String>,

    /// Configured peers, each `name:secret:address:port`. Repeatable.
    #[arg(long = "peer", env = "TSIRCD_PEERS", value_delimiter = ',')]
    pub remote_servers: Vec<RemoteServerRecord>,

    /// Interval, in seconds, between outbound connector ticks (spec §4.3
    /// `call_remote_servers`).
    #[arg(long, default_value_t = 60)]
    pub connect_interval_secs: u64,

    /// Idle threshold, in seconds, before the reaper pings a connection
    /// (spec §4.5).
    #[arg(long, default_value_t = 120)]
    pub idle_timeout_secs: u64,

    /// Upper bound on live client entities (spec §7 "resource" error kind).
    /// A connect attempt past this limit is refused rather than accepted.
    #[arg(long, env = "TSIRCD_MAX_CLIENTS", default_value_t = 100_000)]
    pub max_clients: usize,
}

#[cfg(test)]
pub(crate) fn test_config() -> ServerConfig {
    ServerConfig {
        client_addr: "127.0.0.1:0".into(),
        peer_addr: "127.0.0.1:0".into(),
        token: "A".into(),
        server_name: "irc.test".into(),
        network_name: "TestNet".into(),
        description: "test server".into(),
        motd_file: None,
        remote_servers: vec![],
        connect_interval_secs: 60,
        idle_timeout_secs: 120,
        max_clients: 100_000,
    }
}

impl ServerConfig {
    pub fn load_motd(&self) -> Option<Vec<String>> {
        let path = self.motd_file.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(text) => Some(text.lines().map(|l| l.to_string()).collect()),
            Err(e) => {
                tracing::warn!("Failed to read MOTD file {path}: {e}");
                None
            }
        }
    }
}
