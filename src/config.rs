//! Configuration for the bmeter server and client.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Port used when an address omits one.
pub const DEFAULT_PORT: u16 = 7777;

/// Command-line arguments for the broadcast server
#[derive(Parser, Debug)]
#[command(name = "bmeter-server")]
#[command(author = "bmeter authors")]
#[command(version = "0.1.0")]
#[command(about = "Broadcasts fixed-size frames to every connected client", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Frame duration in milliseconds (default: 40)
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    pub duration: Option<u32>,

    /// Frame size in bytes (default: 2500)
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    pub size: Option<u32>,

    /// Burst width: frames sent back-to-back per timer period (default: 1)
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    pub burst: Option<u32>,

    /// ip_address:tcp_port to listen on (default: *:7777)
    #[arg(long)]
    pub bind: Option<String>,

    /// Exit after the specified timeout in seconds
    #[arg(long)]
    pub exit_after: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Command-line arguments for the load client
#[derive(Parser, Debug)]
#[command(name = "bmeter-client")]
#[command(author = "bmeter authors")]
#[command(version = "0.1.0")]
#[command(about = "Opens connections to a bmeter server and discards what arrives", long_about = None)]
pub struct ClientArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address (default: 127.0.0.1:7777)
    #[arg(short, long)]
    pub server_addr: Option<String>,

    /// Number of clients to simulate (default: 1)
    #[arg(short, long)]
    pub num_clients: Option<u32>,

    /// Interval between frame reports, 0 means no reports (default: 0)
    #[arg(short, long)]
    pub report_interval: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub frame: FrameSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to listen on
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Exit after this many seconds
    pub exit_after: Option<u64>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_sessions: default_max_sessions(),
            exit_after: None,
        }
    }
}

/// Frame timing and size
#[derive(Debug, Deserialize)]
pub struct FrameSection {
    /// Frame duration in milliseconds
    #[serde(default = "default_duration")]
    pub duration: u32,
    /// Frame size in bytes
    #[serde(default = "default_size")]
    pub size: u32,
    /// Frames sent back-to-back per timer period
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for FrameSection {
    fn default() -> Self {
        Self {
            duration: default_duration(),
            size: default_size(),
            burst: default_burst(),
        }
    }
}

/// Page pool sizing
#[derive(Debug, Deserialize)]
pub struct PoolSection {
    /// Size of each page in bytes
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Pages allocated up front
    #[serde(default = "default_min_pages")]
    pub min_pages: usize,
    /// Cap on total pages (0 = unbounded)
    #[serde(default)]
    pub max_pages: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            min_pages: default_min_pages(),
            max_pages: 0,
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Server address to connect to
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Number of connections to open
    #[serde(default = "default_num_clients")]
    pub num_clients: u32,
    /// Interval between frame reports (0 = no reports)
    #[serde(default)]
    pub report_interval: u32,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            num_clients: default_num_clients(),
            report_interval: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_bind() -> String {
    format!("*:{DEFAULT_PORT}")
}

fn default_max_sessions() -> usize {
    10000
}

fn default_duration() -> u32 {
    40
}

fn default_size() -> u32 {
    2500
}

fn default_burst() -> u32 {
    1
}

fn default_page_size() -> usize {
    4096
}

fn default_min_pages() -> usize {
    4096
}

fn default_server_addr() -> String {
    format!("127.0.0.1:{DEFAULT_PORT}")
}

fn default_num_clients() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Frame duration
    pub duration: Duration,
    pub frame_size: usize,
    pub burst: u32,
    pub exit_after: Option<Duration>,
    pub max_sessions: usize,
    pub page_size: usize,
    pub min_pages: usize,
    pub max_pages: usize,
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name (CLI wins).
    pub fn from_args(cli: ServerArgs) -> Result<Self, ConfigError> {
        let toml_config = load_toml(cli.config.as_ref())?;

        let bind_str = cli.bind.unwrap_or(toml_config.server.bind);
        let bind = parse_bind_addr(&bind_str)
            .ok_or_else(|| ConfigError::InvalidAddress("bind", bind_str.clone()))?;

        let duration = cli.duration.unwrap_or(toml_config.frame.duration);
        let size = cli.size.unwrap_or(toml_config.frame.size);
        let burst = cli.burst.unwrap_or(toml_config.frame.burst);
        require_positive("duration", duration as u64)?;
        require_positive("size", size as u64)?;
        require_positive("burst", burst as u64)?;
        require_positive("page_size", toml_config.pool.page_size as u64)?;

        Ok(ServerConfig {
            bind,
            duration: Duration::from_millis(duration as u64),
            frame_size: size as usize,
            burst,
            exit_after: cli
                .exit_after
                .or(toml_config.server.exit_after)
                .map(Duration::from_secs),
            max_sessions: toml_config.server.max_sessions,
            page_size: toml_config.pool.page_size,
            min_pages: toml_config.pool.min_pages,
            max_pages: toml_config.pool.max_pages,
            log_level: pick_log_level(cli.log_level, toml_config.logging.level),
        })
    }

    /// Interval between frame timer firings.
    ///
    /// Each firing sends `burst` frames, so the average rate stays at one
    /// frame per `duration`.
    pub fn tick_period(&self) -> Duration {
        self.duration * self.burst
    }
}

/// Final resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub num_clients: u32,
    /// Accepted for compatibility; no reports are produced.
    pub report_interval: u32,
    pub log_level: String,
}

impl ClientConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ClientArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name (CLI wins).
    pub fn from_args(cli: ClientArgs) -> Result<Self, ConfigError> {
        let toml_config = load_toml(cli.config.as_ref())?;

        let addr_str = cli.server_addr.unwrap_or(toml_config.client.server_addr);
        let server_addr = parse_server_addr(&addr_str)
            .ok_or_else(|| ConfigError::InvalidAddress("server-addr", addr_str.clone()))?;

        Ok(ClientConfig {
            server_addr,
            num_clients: cli.num_clients.unwrap_or(toml_config.client.num_clients),
            report_interval: cli
                .report_interval
                .unwrap_or(toml_config.client.report_interval),
            log_level: pick_log_level(cli.log_level, toml_config.logging.level),
        })
    }
}

fn load_toml(path: Option<&PathBuf>) -> Result<TomlConfig, ConfigError> {
    match path {
        Some(config_path) => {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))
        }
        None => Ok(TomlConfig::default()),
    }
}

fn pick_log_level(cli: String, file: String) -> String {
    if cli != "info" {
        cli
    } else {
        file
    }
}

fn require_positive(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(name, "must be at least 1".to_string()));
    }
    Ok(())
}

/// Parse a listen address.
///
/// Accepts `ip:port`, `ip` (default port), and `:port` or `*:port` for all
/// interfaces.
pub fn parse_bind_addr(s: &str) -> Option<SocketAddr> {
    let s = s.trim();
    if let Some(port) = s.strip_prefix("*:").or_else(|| s.strip_prefix(':')) {
        let port = port.parse().ok()?;
        return Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if s == "*" {
        return Some(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            DEFAULT_PORT,
        ));
    }
    parse_ip_addr(s)
}

/// Parse a server address to connect to.
///
/// Accepts `ip:port`, `ip` (default port), `:port` (loopback), and
/// `host:port`, which is resolved.
pub fn parse_server_addr(s: &str) -> Option<SocketAddr> {
    let s = s.trim();
    if let Some(port) = s.strip_prefix(':') {
        let port = port.parse().ok()?;
        return Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    if let Some(addr) = parse_ip_addr(s) {
        return if addr.ip().is_unspecified() {
            None
        } else {
            Some(addr)
        };
    }
    s.to_socket_addrs().ok()?.next()
}

fn parse_ip_addr(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    s.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, DEFAULT_PORT))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidAddress(&'static str, String),
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidAddress(option, value) => {
                write!(
                    f,
                    "Invalid value \"{}\" for --{} (IP:PORT expected)",
                    value, option
                )
            }
            ConfigError::InvalidValue(option, reason) => {
                write!(f, "Invalid value for {}: {}", option, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
