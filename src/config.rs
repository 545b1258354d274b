use anyhow::Result;
use clap::Parser;
use frame::{Options, Params};
use serde::Deserialize;
use std::fs::read_to_string;

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS")
)]
pub struct Cli {
    /// path to a TOML configuration file; defaults are used if omitted.
    #[arg(long)]
    pub config: Option<String>,

    /// run as the accepting side instead of connecting.
    #[arg(long)]
    pub accept: bool,

    /// remote peer as `ip:port`. Required in connect mode; optional in
    /// accept mode, where omitting it accepts from any peer.
    #[arg(long)]
    pub remote: Option<String>,

    /// initial read buffer size for the echo loop; grown automatically
    /// if a peer sends a larger message.
    #[arg(long, default_value_t = 4096)]
    pub echo_chunk: usize,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Endpoint {
    #[serde(default = "Endpoint::default_ip")]
    pub ip: String,
    #[serde(default = "Endpoint::default_port")]
    pub port: u16,
    #[serde(default = "Endpoint::default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub chaos: u32,
}

impl Endpoint {
    fn default_ip() -> String {
        "127.0.0.1".into()
    }

    fn default_port() -> u16 {
        26258
    }

    fn default_hostname() -> String {
        "sprot".into()
    }

    /// Converts to the string-keyed mapping the protocol stack's lower
    /// layers parse their bind parameters from.
    pub fn as_params(&self) -> Params {
        let mut params = Params::new();
        params.insert("ip".into(), self.ip.clone());
        params.insert("port".into(), self.port.to_string());
        params.insert("hostname".into(), self.hostname.clone());
        params.insert("chaos".into(), self.chaos.to_string());
        params
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            ip: Self::default_ip(),
            port: Self::default_port(),
            hostname: Self::default_hostname(),
            chaos: 0,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct ProtocolOptions {
    #[serde(default = "ProtocolOptions::default_max_frame_size")]
    pub max_frame_size: u32,
    #[serde(default = "ProtocolOptions::default_no_ack_count")]
    pub no_ack_count: u32,
    #[serde(default = "ProtocolOptions::default_storage_max")]
    pub storage_max: u32,
    #[serde(default = "ProtocolOptions::default_storage_trim")]
    pub storage_trim: u32,
    #[serde(default = "ProtocolOptions::default_op_timeout")]
    pub op_timeout: u32,
    #[serde(default = "ProtocolOptions::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "ProtocolOptions::default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "ProtocolOptions::default_max_requests_in_queue")]
    pub max_requests_in_queue: u32,
}

impl ProtocolOptions {
    fn default_max_frame_size() -> u32 {
        Options::default().max_frame_size
    }
    fn default_no_ack_count() -> u32 {
        Options::default().no_ack_count
    }
    fn default_storage_max() -> u32 {
        Options::default().storage_max
    }
    fn default_storage_trim() -> u32 {
        Options::default().storage_trim
    }
    fn default_op_timeout() -> u32 {
        Options::default().op_timeout
    }
    fn default_max_retries() -> u32 {
        Options::default().max_retries
    }
    fn default_max_connections() -> u32 {
        Options::default().max_connections
    }
    fn default_max_requests_in_queue() -> u32 {
        Options::default().max_requests_in_queue
    }

    /// Builds the frame-layer [`Options`] record via `Options::load`, so
    /// `mtu` stays derived from `max_frame_size` exactly as it would for
    /// any other caller of that layer.
    pub fn to_frame_options(self) -> Options {
        let mut params = Params::new();
        params.insert("max_frame_size".into(), self.max_frame_size.to_string());
        params.insert("no_ack_count".into(), self.no_ack_count.to_string());
        params.insert("storage_max".into(), self.storage_max.to_string());
        params.insert("storage_trim".into(), self.storage_trim.to_string());
        params.insert("op_timeout".into(), self.op_timeout.to_string());
        params.insert("max_retries".into(), self.max_retries.to_string());
        params.insert("max_connections".into(), self.max_connections.to_string());
        params.insert(
            "max_requests_in_queue".into(),
            self.max_requests_in_queue.to_string(),
        );
        Options::load(&params)
    }
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        let d = Options::default();
        Self {
            max_frame_size: d.max_frame_size,
            no_ack_count: d.no_ack_count,
            storage_max: d.storage_max,
            storage_trim: d.storage_trim,
            op_timeout: d.op_timeout,
            max_retries: d.max_retries,
            max_connections: d.max_connections,
            max_requests_in_queue: d.max_requests_in_queue,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
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
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default = "Log::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Log {
    fn default_queue_capacity() -> usize {
        1024
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub local: Endpoint,
    #[serde(default)]
    pub options: ProtocolOptions,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    /// Reads the TOML file named by `cli.config`, if any, falling back
    /// to defaults for every field (and the whole file) otherwise.
    pub fn load(cli: &Cli) -> Result<Self> {
        let raw = match &cli.config {
            Some(path) => read_to_string(path)?,
            None => String::new(),
        };
        Ok(toml::from_str(&raw)?)
    }
}
