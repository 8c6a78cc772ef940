// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Command-line and environment configuration of the daemon.

pub use clap::Parser;
use ipnet::Ipv4Net;
use remote::DEFAULT_PORT;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Environment override for the discovery scan interval (seconds).
pub const SCAN_INTERVAL_ENV: &str = "LATTICE_SCAN_INTERVAL";
/// Environment override for the hierarchy cache directory.
pub const CACHE_DIR_ENV: &str = "LATTICE_CACHE_DIR";
/// Environment override for the interface allow-list (comma-separated
/// CIDRs).
pub const ALLOWED_NETS_ENV: &str = "LATTICE_ALLOWED_NETS";

pub const DEFAULT_CACHE_DIR: &str = "/var/lib/lattice";
pub const DEFAULT_CONTROL_SOCKET: &str = "/var/run/lattice/control.sock";

#[derive(Parser, Debug)]
#[command(name = "latticed")]
#[command(about = "Distributed computation daemon", long_about = None)]
pub struct CmdArgs {
    /// Cluster port for peer connections.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Maximum subordinates per node in the overlay tree.
    #[arg(long, default_value_t = 2)]
    pub fanout: u64,

    /// Seconds between discovery scans.
    #[arg(long = "scan-interval", default_value_t = 30)]
    pub scan_interval: u64,

    /// Probes per candidate before moving to the next one.
    #[arg(long = "max-attempts", default_value_t = 3)]
    pub max_attempts: u32,

    /// Directory for the per-interface hierarchy caches.
    #[arg(long = "cache-dir", default_value = DEFAULT_CACHE_DIR)]
    pub cache_dir: PathBuf,

    /// Path of the control socket.
    #[arg(long = "control-socket", default_value = DEFAULT_CONTROL_SOCKET)]
    pub control_socket: PathBuf,

    /// Only manage interfaces whose address falls in one of these
    /// networks. Repeatable.
    #[arg(long = "allow")]
    pub allow: Vec<Ipv4Net>,

    /// Skip interface enumeration and serve exactly these interface
    /// addresses (CIDR notation). Repeatable.
    #[arg(long = "interface")]
    pub interface: Vec<Ipv4Net>,

    /// Worker threads of the local pipeline (0 = hardware threads).
    #[arg(long = "threads", default_value_t = 0)]
    pub threads: usize,

    /// Seconds between interface re-enumerations.
    #[arg(long = "interface-update-interval", default_value_t = 60)]
    pub interface_update_interval: u64,

    /// Exclude the local node from upstream scheduling.
    #[arg(long = "no-localhost", default_value_t = false)]
    pub no_localhost: bool,
}

/// Effective daemon configuration: flags merged with the environment.
#[derive(Debug, Clone)]
pub struct Properties {
    pub port: u16,
    pub fanout: u64,
    pub scan_interval: Duration,
    pub max_attempts: u32,
    pub cache_dir: PathBuf,
    pub control_socket: PathBuf,
    pub allowed: Vec<Ipv4Net>,
    pub interfaces: Vec<Ipv4Net>,
    pub threads: usize,
    pub interface_update_interval: Duration,
    pub use_localhost: bool,
}

#[derive(Debug)]
pub struct BadProperty {
    pub name: &'static str,
    pub value: String,
}

impl std::fmt::Display for BadProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bad value for {}: {}", self.name, self.value)
    }
}

impl std::error::Error for BadProperty {}

impl Properties {
    /// Merge parsed flags with the environment overrides.
    pub fn from_args(args: CmdArgs) -> Result<Self, BadProperty> {
        let mut props = Self {
            port: args.port,
            fanout: args.fanout.max(1),
            scan_interval: Duration::from_secs(args.scan_interval.max(1)),
            max_attempts: args.max_attempts.max(1),
            cache_dir: args.cache_dir,
            control_socket: args.control_socket,
            allowed: args.allow,
            interfaces: args.interface,
            threads: args.threads,
            interface_update_interval: Duration::from_secs(
                args.interface_update_interval.max(1),
            ),
            use_localhost: !args.no_localhost,
        };
        if let Ok(value) = std::env::var(SCAN_INTERVAL_ENV) {
            let secs: u64 = value.parse().map_err(|_| BadProperty {
                name: SCAN_INTERVAL_ENV,
                value: value.clone(),
            })?;
            debug!(secs, "scan interval from environment");
            props.scan_interval = Duration::from_secs(secs.max(1));
        }
        if let Ok(value) = std::env::var(CACHE_DIR_ENV) {
            props.cache_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var(ALLOWED_NETS_ENV) {
            let mut allowed = Vec::new();
            for part in value.split(',').filter(|p| !p.is_empty()) {
                allowed.push(part.trim().parse().map_err(|_| BadProperty {
                    name: ALLOWED_NETS_ENV,
                    value: part.to_string(),
                })?);
            }
            props.allowed = allowed;
        }
        Ok(props)
    }
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            fanout: 2,
            scan_interval: Duration::from_secs(30),
            max_attempts: 3,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            control_socket: PathBuf::from(DEFAULT_CONTROL_SOCKET),
            allowed: Vec::new(),
            interfaces: Vec::new(),
            threads: 0,
            interface_update_interval: Duration::from_secs(60),
            use_localhost: true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_the_daemon_contract() {
        let args = CmdArgs::parse_from(["latticed"]);
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.fanout, 2);
        assert_eq!(args.scan_interval, 30);
        assert!(!args.no_localhost);
    }

    #[test]
    fn flags_parse_into_properties() {
        let args = CmdArgs::parse_from([
            "latticed",
            "--port",
            "4000",
            "--fanout",
            "3",
            "--interface",
            "10.0.0.1/24",
            "--allow",
            "10.0.0.0/24",
            "--no-localhost",
        ]);
        let props = Properties::from_args(args).unwrap();
        assert_eq!(props.port, 4000);
        assert_eq!(props.fanout, 3);
        assert_eq!(props.interfaces.len(), 1);
        assert_eq!(props.allowed.len(), 1);
        assert!(!props.use_localhost);
    }
}
