//! Proxy configuration.
//!
//! Values come from command-line flags (each with an environment variable
//! fallback). When a config file is given, every key present in it overrides
//! the flag value.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::discovery::{SentinelConfig, DEFAULT_ROLE_POLL_INTERVAL};
use crate::master::WatcherConfig;
use crate::proxy::{ListenerConfig, RelayConfig};

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:6379";
pub const DEFAULT_SENTINEL_ADDRESS: &str = "127.0.0.1:26379";
pub const DEFAULT_MONITOR_NAME: &str = "test";

/// Log levels accepted on the command line and in config files.
const LOG_LEVELS: [&str; 6] = ["fatal", "error", "warn", "info", "debug", "trace"];

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable text.
    Text,
}

/// Sentinel-aware redis proxy.
#[derive(Debug, Parser)]
#[command(name = "sentinel-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file location. Values in the file override flags.
    #[arg(short = 'c', long, env = "SENTINEL_PROXY_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Proxy listen address.
    #[arg(short = 'l', long, env = "SENTINEL_PROXY_LISTEN_ADDRESS", default_value = DEFAULT_LISTEN_ADDRESS)]
    pub listen_address: String,

    /// Log level.
    #[arg(short = 'L', long, env = "SENTINEL_PROXY_LOG_LEVEL", default_value = "info", value_parser = LOG_LEVELS)]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "SENTINEL_PROXY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Time to wait for a node to transition to master (seconds).
    #[arg(short = 't', long, env = "SENTINEL_PROXY_MASTER_WAIT", default_value_t = 30)]
    pub master_wait: u64,

    /// Name of the sentinel monitor.
    #[arg(short = 'm', long, env = "SENTINEL_PROXY_MONITOR_NAME", default_value = DEFAULT_MONITOR_NAME)]
    pub monitor_name: String,

    /// Time to wait to connect to redis or sentinel (seconds).
    #[arg(short = 'r', long, env = "SENTINEL_PROXY_READY_WAIT", default_value_t = 30)]
    pub ready_wait: u64,

    /// Address of the sentinel node.
    #[arg(short = 's', long, env = "SENTINEL_PROXY_SENTINEL_ADDRESS", default_value = DEFAULT_SENTINEL_ADDRESS)]
    pub sentinel_address: String,

    /// Sentinel password (also used for redis nodes).
    #[arg(short = 'p', long, env = "SENTINEL_PROXY_SENTINEL_PASSWORD", default_value = "", hide_env_values = true)]
    pub sentinel_password: String,

    /// Time to wait for sentinel to respond (seconds).
    #[arg(short = 'w', long, env = "SENTINEL_PROXY_SENTINEL_WAIT", default_value_t = 10)]
    pub sentinel_wait: u64,
}

/// Keys accepted in a config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct FileConfig {
    listen_address: Option<String>,
    sentinel_address: Option<String>,
    sentinel_password: Option<String>,
    monitor_name: Option<String>,
    master_wait: Option<u64>,
    ready_wait: Option<u64>,
    sentinel_wait: Option<u64>,
    log_level: Option<String>,
    log_format: Option<LogFormat>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply(self, cli: &mut Cli) {
        if let Some(v) = self.listen_address {
            cli.listen_address = v;
        }
        if let Some(v) = self.sentinel_address {
            cli.sentinel_address = v;
        }
        if let Some(v) = self.sentinel_password {
            cli.sentinel_password = v;
        }
        if let Some(v) = self.monitor_name {
            cli.monitor_name = v;
        }
        if let Some(v) = self.master_wait {
            cli.master_wait = v;
        }
        if let Some(v) = self.ready_wait {
            cli.ready_wait = v;
        }
        if let Some(v) = self.sentinel_wait {
            cli.sentinel_wait = v;
        }
        if let Some(v) = self.log_level {
            cli.log_level = v;
        }
        if let Some(v) = self.log_format {
            cli.log_format = v;
        }
    }
}

/// Resolved proxy configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address clients connect to, as `host:port`. The host may be a name.
    pub listen_address: String,

    /// Sentinel `host:port`.
    pub sentinel_address: String,

    /// Password for sentinel and redis nodes.
    pub sentinel_password: Option<String>,

    /// Sentinel monitor tracking the master.
    pub monitor_name: String,

    /// How long a candidate may take to report the master role.
    pub master_wait: Duration,

    /// Connect timeout for sentinel and redis.
    pub ready_wait: Duration,

    /// Read timeout for sentinel replies; also the watcher's retry interval.
    pub sentinel_wait: Duration,

    /// Log level (fatal, error, warn, info, debug, trace).
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Config {
    /// Build the configuration from parsed flags, applying the config file if one is set.
    pub fn load(mut cli: Cli) -> Result<Self> {
        if let Some(path) = cli.config_file.clone() {
            FileConfig::read(&path)?.apply(&mut cli);
        }
        Self::from_cli(cli)
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        let listen_address = normalize_listen_address(&cli.listen_address)
            .with_context(|| format!("Invalid listen address '{}'", cli.listen_address))?;

        if cli.monitor_name.trim().is_empty() {
            bail!("Monitor name must not be empty");
        }
        if cli.sentinel_address.trim().is_empty() {
            bail!("Sentinel address must not be empty");
        }
        if !LOG_LEVELS.contains(&cli.log_level.as_str()) {
            bail!(
                "Invalid log level '{}' (expected one of {})",
                cli.log_level,
                LOG_LEVELS.join(", ")
            );
        }

        for (name, secs) in [
            ("master-wait", cli.master_wait),
            ("ready-wait", cli.ready_wait),
            ("sentinel-wait", cli.sentinel_wait),
        ] {
            if secs == 0 {
                bail!("{} must be at least 1 second", name);
            }
        }

        let sentinel_password = Some(cli.sentinel_password).filter(|p| !p.is_empty());

        Ok(Self {
            listen_address,
            sentinel_address: cli.sentinel_address,
            sentinel_password,
            monitor_name: cli.monitor_name,
            master_wait: Duration::from_secs(cli.master_wait),
            ready_wait: Duration::from_secs(cli.ready_wait),
            sentinel_wait: Duration::from_secs(cli.sentinel_wait),
            log_level: cli.log_level,
            log_format: cli.log_format,
        })
    }

    /// Filter directive for the tracing subscriber.
    ///
    /// `fatal` has no tracing equivalent and maps to `error`.
    pub fn log_filter(&self) -> String {
        match self.log_level.as_str() {
            "fatal" => "error".to_string(),
            level => level.to_string(),
        }
    }

    pub fn sentinel_config(&self) -> SentinelConfig {
        SentinelConfig {
            address: self.sentinel_address.clone(),
            password: self.sentinel_password.clone(),
            monitor_name: self.monitor_name.clone(),
            connect_timeout: self.ready_wait,
            read_timeout: self.sentinel_wait,
            master_wait: self.master_wait,
            role_poll_interval: DEFAULT_ROLE_POLL_INTERVAL,
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            poll_interval: self.sentinel_wait,
            connect_timeout: self.ready_wait,
        }
    }

    /// Resolve the listen address and build the listener configuration.
    pub async fn listener_config(&self) -> Result<ListenerConfig> {
        let bind_addr = tokio::net::lookup_host(self.listen_address.as_str())
            .await
            .with_context(|| format!("Failed to resolve listen address '{}'", self.listen_address))?
            .next()
            .with_context(|| format!("No addresses found for '{}'", self.listen_address))?;

        Ok(ListenerConfig::with_relay(bind_addr, RelayConfig::default()))
    }
}

/// Check `host:port` and fill in the wildcard host for `:port`.
fn normalize_listen_address(addr: &str) -> Result<String> {
    // IP literals, including bracketed IPv6, need no further checks.
    if addr.parse::<SocketAddr>().is_ok() {
        return Ok(addr.to_string());
    }

    let Some((host, port)) = addr.rsplit_once(':') else {
        bail!("expected host:port");
    };
    port.parse::<u16>()
        .with_context(|| format!("invalid port '{}'", port))?;

    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(format!("{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["sentinel-proxy"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::load(parse(&[])).unwrap();

        assert_eq!(config.listen_address, DEFAULT_LISTEN_ADDRESS);
        assert_eq!(config.sentinel_address, DEFAULT_SENTINEL_ADDRESS);
        assert_eq!(config.monitor_name, DEFAULT_MONITOR_NAME);
        assert!(config.sentinel_password.is_none());
        assert_eq!(config.master_wait, Duration::from_secs(30));
        assert_eq!(config.ready_wait, Duration::from_secs(30));
        assert_eq!(config.sentinel_wait, Duration::from_secs(10));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_short_flags() {
        let config = Config::load(parse(&[
            "-l",
            "0.0.0.0:7000",
            "-s",
            "10.0.0.5:26379",
            "-p",
            "hunter2",
            "-m",
            "cache",
            "-t",
            "5",
            "-r",
            "3",
            "-w",
            "2",
            "-L",
            "debug",
        ]))
        .unwrap();

        assert_eq!(config.listen_address, "0.0.0.0:7000");
        assert_eq!(config.sentinel_address, "10.0.0.5:26379");
        assert_eq!(config.sentinel_password.as_deref(), Some("hunter2"));
        assert_eq!(config.monitor_name, "cache");
        assert_eq!(config.master_wait, Duration::from_secs(5));
        assert_eq!(config.ready_wait, Duration::from_secs(3));
        assert_eq!(config.sentinel_wait, Duration::from_secs(2));
        assert_eq!(config.log_filter(), "debug");
    }

    #[test]
    fn test_config_file_overrides_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
monitor-name = "from-file"
master-wait = 7
log-level = "fatal"
log-format = "text"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::load(parse(&["-c", &path, "-m", "from-flag", "-r", "4"])).unwrap();

        assert_eq!(config.monitor_name, "from-file");
        assert_eq!(config.master_wait, Duration::from_secs(7));
        // Flags survive when the file does not mention them.
        assert_eq!(config.ready_wait, Duration::from_secs(4));
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.log_filter(), "error");
    }

    #[test]
    fn test_config_file_rejects_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "monior-name = \"typo\"").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let err = Config::load(parse(&["-c", &path])).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::load(parse(&["-c", "/nonexistent/sentinel-proxy.toml"])).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[rstest]
    #[case(&["-t", "0"], "master-wait")]
    #[case(&["-r", "0"], "ready-wait")]
    #[case(&["-w", "0"], "sentinel-wait")]
    #[case(&["-m", " "], "Monitor name")]
    #[case(&["-l", "localhost"], "Invalid listen address")]
    #[case(&["-l", "localhost:http"], "Invalid listen address")]
    #[case(&["-l", "127.0.0.1:70000"], "Invalid listen address")]
    fn test_invalid_values(#[case] args: &[&str], #[case] expected: &str) {
        let err = Config::load(parse(args)).unwrap_err();
        assert!(
            err.to_string().contains(expected),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn test_invalid_log_level_rejected_by_parser() {
        assert!(Cli::try_parse_from(["sentinel-proxy", "-L", "verbose"]).is_err());
    }

    #[rstest]
    #[case("localhost:7000", "localhost:7000")]
    #[case(":7000", "0.0.0.0:7000")]
    #[case("[::1]:7000", "[::1]:7000")]
    fn test_listen_address_accepts_host_names(#[case] flag: &str, #[case] expected: &str) {
        let config = Config::load(parse(&["-l", flag])).unwrap();
        assert_eq!(config.listen_address, expected);
    }

    #[tokio::test]
    async fn test_listener_config_resolves_host_name() {
        let config = Config::load(parse(&["-l", "localhost:7000"])).unwrap();

        let listener = config.listener_config().await.unwrap();
        assert!(listener.bind_addr.ip().is_loopback());
        assert_eq!(listener.bind_addr.port(), 7000);
    }

    #[tokio::test]
    async fn test_component_configs() {
        let config = Config::load(parse(&["-p", "pw", "-w", "3", "-r", "4"])).unwrap();

        let sentinel = config.sentinel_config();
        assert_eq!(sentinel.password.as_deref(), Some("pw"));
        assert_eq!(sentinel.read_timeout, Duration::from_secs(3));
        assert_eq!(sentinel.connect_timeout, Duration::from_secs(4));

        let watcher = config.watcher_config();
        assert_eq!(watcher.poll_interval, Duration::from_secs(3));

        let listener = config.listener_config().await.unwrap();
        assert_eq!(listener.bind_addr.to_string(), config.listen_address);
    }
}
