//! Server settings and command-line argument parsing

use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for one server instance. Fixed once the server is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSettings {
    pub bind_address: IpAddr,
    /// 0 lets the OS pick a port
    pub bind_port: u16,
    /// Connections beyond this many are closed right after accept
    pub max_connections: usize,
    /// Inactivity timeout in seconds, 0 disables it
    pub timeout: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 0,
            max_connections: 10,
            timeout: 10,
        }
    }
}

impl ServerSettings {
    /// Defaults with `overrides` applied on top
    pub fn with_overrides(overrides: &SettingsOverrides) -> Self {
        Self::default().merge(overrides)
    }

    pub fn merge(mut self, overrides: &SettingsOverrides) -> Self {
        if let Some(ip) = overrides.bind_address {
            self.bind_address = ip;
        }
        if let Some(port) = overrides.bind_port {
            self.bind_port = port;
        }
        if let Some(n) = overrides.max_connections {
            self.max_connections = n;
        }
        if let Some(t) = overrides.timeout {
            self.timeout = t;
        }
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }

    /// `None` when the timeout is disabled
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

/// Caller supplied settings, unset fields keep their defaults.
///
/// Accepts both the long names and the short `ip`/`port`/`connections` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsOverrides {
    #[serde(alias = "ip")]
    pub bind_address: Option<IpAddr>,
    #[serde(alias = "port")]
    pub bind_port: Option<u16>,
    #[serde(alias = "connections")]
    pub max_connections: Option<usize>,
    pub timeout: Option<u64>,
}

impl SettingsOverrides {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Command-line configuration for the binary
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub overrides: SettingsOverrides,
    /// Print tracks as JSON lines instead of a summary
    pub json: bool,
    /// Also print every frame that failed to decode
    pub verbose: bool,
}

impl Config {
    pub fn from_args() -> Self {
        match Self::parse(env::args().skip(1)) {
            Ok(Some(config)) => config,
            Ok(None) => {
                print_help();
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("{}", e);
                print_help();
                std::process::exit(1);
            }
        }
    }

    /// Parse arguments, `Ok(None)` means help was requested.
    pub fn parse<I>(args: I) -> Result<Option<Self>, String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Config::default();
        let mut file_overrides = None;
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--ip" => {
                    config.overrides.bind_address = Some(value(&arg, args.next())?);
                }
                "--port" => {
                    config.overrides.bind_port = Some(value(&arg, args.next())?);
                }
                "--connections" => {
                    config.overrides.max_connections = Some(value(&arg, args.next())?);
                }
                "--timeout" => {
                    config.overrides.timeout = Some(value(&arg, args.next())?);
                }
                "--config" => {
                    let path: String = value(&arg, args.next())?;
                    let text = fs::read_to_string(&path)
                        .map_err(|e| format!("Cannot read {}: {}", path, e))?;
                    let overrides = SettingsOverrides::from_json(&text)
                        .map_err(|e| format!("Invalid config {}: {}", path, e))?;
                    file_overrides = Some(overrides);
                }
                "--json" => config.json = true,
                "--verbose" => config.verbose = true,
                "--help" => return Ok(None),
                _ => return Err(format!("Unknown option: {}", arg)),
            }
        }

        // Command-line flags win over the config file
        if let Some(file) = file_overrides {
            let cli = config.overrides;
            config.overrides = SettingsOverrides {
                bind_address: cli.bind_address.or(file.bind_address),
                bind_port: cli.bind_port.or(file.bind_port),
                max_connections: cli.max_connections.or(file.max_connections),
                timeout: cli.timeout.or(file.timeout),
            };
        }

        Ok(Some(config))
    }

    pub fn settings(&self) -> ServerSettings {
        ServerSettings::with_overrides(&self.overrides)
    }
}

fn value<T: std::str::FromStr>(flag: &str, arg: Option<String>) -> Result<T, String> {
    let arg = arg.ok_or_else(|| format!("Missing value for {}", flag))?;
    arg.parse()
        .map_err(|_| format!("Invalid value for {}: {}", flag, arg))
}

fn print_help() {
    println!(
        r#"h02-rs - TK102/H02 GPS tracker server

Usage: h02-rs [OPTIONS]

Options:
  --ip <addr>            Address to listen on (default: 0.0.0.0)
  --port <port>          TCP port (default: 0, picked by the OS)
  --connections <N>      Max concurrent connections (default: 10)
  --timeout <s>          Close idle connections after <s> seconds, 0 disables (default: 10)
  --config <file>        Read settings from a JSON file
  --json                 Print tracks as JSON lines
  --verbose              Print frames that failed to decode
  --help                 Show this help
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let s = ServerSettings::default();
        assert_eq!(s.bind_addr().to_string(), "0.0.0.0:0");
        assert_eq!(s.max_connections, 10);
        assert_eq!(s.inactivity_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_overrides_merge() {
        let overrides = SettingsOverrides {
            bind_port: Some(5001),
            timeout: Some(0),
            ..Default::default()
        };
        let s = ServerSettings::with_overrides(&overrides);
        assert_eq!(s.bind_port, 5001);
        assert_eq!(s.max_connections, 10);
        assert_eq!(s.inactivity_timeout(), None);
    }

    #[test]
    fn test_overrides_from_json() {
        let o = SettingsOverrides::from_json(r#"{"ip":"127.0.0.1","port":5001,"connections":2}"#)
            .unwrap();
        assert_eq!(o.bind_address, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(o.bind_port, Some(5001));
        assert_eq!(o.max_connections, Some(2));
        assert_eq!(o.timeout, None);

        assert!(SettingsOverrides::from_json(r#"{"speed":1}"#).is_err());
    }

    #[test]
    fn test_parse_args() {
        let config = Config::parse(args(&["--port", "5001", "--timeout", "0", "--json"]))
            .unwrap()
            .unwrap();
        assert!(config.json);
        let s = config.settings();
        assert_eq!(s.bind_port, 5001);
        assert_eq!(s.timeout, 0);

        assert!(Config::parse(args(&["--help"])).unwrap().is_none());
        assert!(Config::parse(args(&["--port"])).is_err());
        assert!(Config::parse(args(&["--port", "http"])).is_err());
        assert!(Config::parse(args(&["--bogus"])).is_err());
    }
}
