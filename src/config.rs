use std::{fs::read_to_string, str::FromStr, time::Duration};

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// A STUN server, by name.
///
/// Servers are re-resolved when queried, keeping only the first IPv4/UDP
/// address each lookup yields.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct StunServer {
    pub host: String,
    pub service: String,
}

impl StunServer {
    pub fn new(host: &str, service: &str) -> Self {
        Self {
            host: host.to_string(),
            service: service.to_string(),
        }
    }
}

impl std::fmt::Display for StunServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.service)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Stun {
    ///
    /// The pool of binding servers queried for the reflexive address.
    ///
    /// At least two servers are needed to tell an endpoint-independent NAT
    /// from an endpoint-dependent one.
    ///
    #[serde(default = "Stun::servers")]
    pub servers: Vec<StunServer>,
    ///
    /// Initial retransmission timeout for a binding request, in
    /// milliseconds. Doubles every round.
    ///
    #[serde(default = "Stun::timeout_ms")]
    pub timeout_ms: u64,
    ///
    /// Number of doubling retransmission rounds before the final one.
    ///
    #[serde(default = "Stun::max_retransmissions")]
    pub max_retransmissions: u32,
    ///
    /// The final round waits for timeout-ms times this multiplier.
    ///
    #[serde(default = "Stun::final_timeout_multiplier")]
    pub final_timeout_multiplier: u32,
}

impl Stun {
    fn servers() -> Vec<StunServer> {
        vec![
            StunServer::new("stun.l.google.com", "19302"),
            StunServer::new("stun.freeswitch.org", "3478"),
            StunServer::new("stun.voip.blackberry.com", "3478"),
        ]
    }

    fn timeout_ms() -> u64 {
        500
    }

    fn max_retransmissions() -> u32 {
        7
    }

    fn final_timeout_multiplier() -> u32 {
        16
    }

    /// How long a transaction stays live: the sum of every retransmission
    /// timeout plus the final round.
    pub fn ttl(&self) -> Duration {
        let rounds: u64 = (0..self.max_retransmissions)
            .map(|round| self.timeout_ms << round)
            .sum();

        Duration::from_millis(rounds + self.timeout_ms * self.final_timeout_multiplier as u64)
    }
}

impl Default for Stun {
    fn default() -> Self {
        Self {
            servers: Self::servers(),
            timeout_ms: Self::timeout_ms(),
            max_retransmissions: Self::max_retransmissions(),
            final_timeout_multiplier: Self::final_timeout_multiplier(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct Timers {
    ///
    /// Interval between NAT keepalive binding requests, in milliseconds.
    ///
    /// Keepalive runs continuously from socket creation so the NAT never
    /// expires the binding under the socket.
    ///
    #[serde(default = "Timers::nat_keepalive_ms")]
    pub nat_keepalive_ms: u64,
    ///
    /// Interval between punch retransmissions, in milliseconds.
    ///
    #[serde(default = "Timers::punch_interval_ms")]
    pub punch_interval_ms: u64,
    ///
    /// Total time a socket keeps punching before giving up and closing.
    ///
    #[serde(default = "Timers::punch_timeout_ms")]
    pub punch_timeout_ms: u64,
}

impl Timers {
    fn nat_keepalive_ms() -> u64 {
        5000
    }

    fn punch_interval_ms() -> u64 {
        5000
    }

    fn punch_timeout_ms() -> u64 {
        180_000
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            nat_keepalive_ms: Self::nat_keepalive_ms(),
            punch_interval_ms: Self::punch_interval_ms(),
            punch_timeout_ms: Self::punch_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Limits {
    ///
    /// Maximum number of live sockets per context.
    ///
    #[serde(default = "Limits::max_socket_count")]
    pub max_socket_count: usize,
    ///
    /// Largest backlog a listener may ask for.
    ///
    #[serde(default = "Limits::max_backlog")]
    pub max_backlog: usize,
    ///
    /// The advertised receive window. Flow control is handled by the
    /// stream engine; the handshake advertises this constant.
    ///
    #[serde(default = "Limits::constant_window")]
    pub constant_window: u16,
}

impl Limits {
    fn max_socket_count() -> usize {
        32
    }

    fn max_backlog() -> usize {
        64
    }

    fn constant_window() -> u16 {
        4096
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_socket_count: Self::max_socket_count(),
            max_backlog: Self::max_backlog(),
            constant_window: Self::constant_window(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
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

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
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

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
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

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub stun: Stun,
    #[serde(default)]
    pub timers: Timers,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub log: Log,
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
    /// Example: atp --config /etc/atp/config.json
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => serde_json5::from_str::<Self>(&read_to_string(&path)?)?,
            None => Self::default(),
        })
    }
}
