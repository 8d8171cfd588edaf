use std::{
    collections::HashMap,
    fs::read_to_string,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use service::allocation::ports::PortRange;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl From<Transport> for service::Transport {
    fn from(value: Transport) -> Self {
        match value {
            Transport::Udp => Self::Udp,
            Transport::Tcp => Self::Tcp,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct Interface {
    pub transport: Transport,
    ///
    /// turn server listen address
    ///
    pub listen: SocketAddr,
    ///
    /// external address
    ///
    /// specify the node external address and port.
    /// for the case of exposing the service to the outside,
    /// you need to manually specify the server external IP
    /// address and service listening port.
    ///
    pub external: SocketAddr,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// turn server realm
    ///
    /// specify the domain where the server is located.
    /// for a single node, this configuration is fixed,
    /// but each node can be configured as a different domain.
    ///
    #[serde(default = "Server::realm")]
    pub realm: String,
    ///
    /// turn server listen interfaces
    ///
    /// The address and port to which the UDP or TCP listener is bound.
    /// Multiple addresses can be bound at the same time. The binding address
    /// supports ipv4 and ipv6.
    ///
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    ///
    /// Maximum number of concurrent allocations, 0 disables the quota.
    ///
    #[serde(default = "Server::max_allocations")]
    pub max_allocations: usize,
    ///
    /// Lifetime in seconds of a channel binding.
    ///
    #[serde(default = "Server::default_channel_binding_lifetime")]
    pub channel_binding_lifetime: u64,
    ///
    /// How long in seconds an issued nonce is accepted.
    ///
    #[serde(default = "Server::default_nonce_lifetime")]
    pub nonce_lifetime: u64,
    ///
    /// Interval in seconds between two sweeps of expired allocations,
    /// permissions and channel bindings.
    ///
    #[serde(default = "Server::default_sweep_interval")]
    pub sweep_interval: u64,
    ///
    /// SOFTWARE attribute value carried by every response.
    ///
    #[serde(default = "Server::software")]
    pub software: String,
}

impl Server {
    fn realm() -> String {
        "localhost".to_string()
    }

    fn max_allocations() -> usize {
        4096
    }

    fn default_channel_binding_lifetime() -> u64 {
        600
    }

    fn default_nonce_lifetime() -> u64 {
        3600
    }

    fn default_sweep_interval() -> u64 {
        5
    }

    fn software() -> String {
        concat!("turn-relay.", env!("CARGO_PKG_VERSION")).to_string()
    }

    pub fn channel_binding_lifetime(&self) -> Duration {
        Duration::from_secs(self.channel_binding_lifetime)
    }

    pub fn nonce_lifetime(&self) -> Duration {
        Duration::from_secs(self.nonce_lifetime)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            realm: Self::realm(),
            interfaces: Default::default(),
            max_allocations: Self::max_allocations(),
            channel_binding_lifetime: Self::default_channel_binding_lifetime(),
            nonce_lifetime: Self::default_nonce_lifetime(),
            sweep_interval: Self::default_sweep_interval(),
            software: Self::software(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Relay {
    ///
    /// The IP address relay sockets are bound on.
    ///
    #[serde(default = "Relay::listen")]
    pub listen: IpAddr,
    ///
    /// The IP address advertised in XOR-RELAYED-ADDRESS, defaults to the
    /// listen address.
    ///
    #[serde(default)]
    pub external: Option<IpAddr>,
    ///
    /// Port range, the maximum range is 49152..65535.
    ///
    #[serde(default)]
    pub port_range: PortRange,
}

impl Relay {
    fn listen() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    pub fn external(&self) -> IpAddr {
        self.external.unwrap_or(self.listen)
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            external: None,
            port_range: PortRange::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Auth {
    ///
    /// static user password
    ///
    /// This option can be used to specify the static identity authentication
    /// information used by the turn server for verification. Static
    /// credentials are tried before the shared secret.
    ///
    #[serde(default)]
    pub static_credentials: HashMap<String, String>,
    ///
    /// Shared secret of the TURN REST API.
    ///
    /// The password of a username is `base64(hmac-sha1(secret, username))`,
    /// usernames of the form `<expiry>:<name>` stop working once the unix
    /// timestamp `expiry` has passed.
    ///
    #[serde(default)]
    pub static_auth_secret: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub relay: Relay,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub auth: Auth,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: turn-relay --config /etc/turn-relay/config.json5
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl FromStr for Config {
    type Err = serde_json5::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        serde_json5::from_str(value)
    }
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is specified,
    /// the configuration is read from the configuration file, otherwise the
    /// default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => read_to_string(path)?.parse()?,
            None => Self::default(),
        })
    }
}
