//! NAT64 configuration file support.
//!
//! ```toml
//! tun_name = "nat64"
//! mtu = 1500
//! prefix = "64:ff9b::/96"
//! pool = ["100.64.0.0/10"]
//! reserved = ["100.64.0.1"]
//! binding_expiry_secs = 1800
//! install_routes = true
//! ```

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::address::{Nat64Prefix, SUPPORTED_PREFIX_LEN};
use crate::bib::{BindingTable, DEFAULT_EXPIRY};
use crate::error::{Nat64Error, Nat64Result};

/// Default TUN device name.
pub const DEFAULT_TUN_NAME: &str = "nat64";

/// Default TUN MTU.
pub const DEFAULT_MTU: u16 = 1500;

/// Smallest MTU allowed; IPv6 requires 1280 on every link.
pub const MIN_MTU: u16 = 1280;

/// Default IPv4 pool (RFC 6598 shared address space).
pub const DEFAULT_POOL: &str = "100.64.0.0/10";

/// NAT64 translator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Nat64Config {
    /// TUN device name.
    #[serde(default = "default_tun_name")]
    pub tun_name: String,

    /// MTU for the TUN device.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// NAT64 prefix. Only /96 is supported.
    #[serde(default = "default_prefix")]
    pub prefix: Ipv6Net,

    /// IPv4 networks whose host addresses are leased to IPv6 hosts.
    #[serde(default = "default_pool")]
    pub pool: Vec<Ipv4Net>,

    /// Pool addresses that are never leased (e.g. the translator's own address).
    #[serde(default)]
    pub reserved: Vec<Ipv4Addr>,

    /// Idle time after which a binding can be reclaimed.
    #[serde(default = "default_binding_expiry_secs")]
    pub binding_expiry_secs: u64,

    /// Route the prefix and the pool through the TUN device.
    #[serde(default = "default_install_routes")]
    pub install_routes: bool,
}

impl Default for Nat64Config {
    fn default() -> Self {
        Self {
            tun_name: default_tun_name(),
            mtu: DEFAULT_MTU,
            prefix: default_prefix(),
            pool: default_pool(),
            reserved: Vec::new(),
            binding_expiry_secs: default_binding_expiry_secs(),
            install_routes: true,
        }
    }
}

impl Nat64Config {
    /// Check field ranges and cross-field consistency.
    pub fn validate(&self) -> Nat64Result<()> {
        if self.tun_name.is_empty() {
            return Err(Nat64Error::config("tun_name must not be empty"));
        }
        if self.mtu < MIN_MTU {
            return Err(Nat64Error::config(format!(
                "MTU {} is out of range. Valid range: {}-65535",
                self.mtu, MIN_MTU
            )));
        }
        if self.prefix.prefix_len() != SUPPORTED_PREFIX_LEN {
            return Err(Nat64Error::UnsupportedPrefixLength(self.prefix.prefix_len()));
        }
        if self.pool.is_empty() {
            return Err(Nat64Error::config("pool must contain at least one network"));
        }
        if self.binding_expiry_secs == 0 {
            return Err(Nat64Error::config("binding_expiry_secs must be positive"));
        }
        for addr in &self.reserved {
            if !self.pool.iter().any(|net| net.contains(addr)) {
                return Err(Nat64Error::config(format!(
                    "Reserved address {} is not inside any pool network",
                    addr
                )));
            }
        }
        Ok(())
    }

    /// The configured NAT64 prefix.
    pub fn nat64_prefix(&self) -> Nat64Result<Nat64Prefix> {
        Nat64Prefix::try_from(self.prefix)
    }

    pub fn binding_expiry(&self) -> Duration {
        Duration::from_secs(self.binding_expiry_secs)
    }

    /// Build a binding table with every pool network configured and the
    /// reserved addresses removed.
    ///
    /// Overlapping pool networks fail with [`Nat64Error::RangeCollision`].
    pub fn build_binding_table(&self) -> Nat64Result<BindingTable> {
        let table = BindingTable::new(self.binding_expiry());
        for net in &self.pool {
            table.configure_pool(*net)?;
        }
        for addr in &self.reserved {
            if !table.reserve(*addr) {
                log::warn!("Reserved address {} is not leasable, ignoring", addr);
            }
        }
        log::info!(
            "NAT64 pool ready: {} address(es) in {} network(s)",
            table.free_addresses(),
            self.pool.len()
        );
        Ok(table)
    }
}

/// Expand `~` at the start of a path to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

/// Default config path (~/.config/tunnel-rs/nat64.toml).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("tunnel-rs").join("nat64.toml"))
}

/// Parse a configuration from TOML text.
pub fn parse_config(content: &str) -> Nat64Result<Nat64Config> {
    toml::from_str(content).map_err(|e| Nat64Error::config_with_source("Invalid TOML", e))
}

/// Load configuration from an explicit path, or from the default location.
///
/// Without an explicit path, a missing default file yields the built-in
/// defaults. An explicit path must exist.
pub fn load_config(path: Option<&Path>) -> Nat64Result<Nat64Config> {
    let config_path = match path {
        Some(p) => expand_tilde(p),
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => {
                log::debug!("No config file found, using defaults");
                return Ok(Nat64Config::default());
            }
        },
    };

    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        Nat64Error::config_with_source(
            format!("Failed to read config file: {}", config_path.display()),
            e,
        )
    })?;
    toml::from_str(&content).map_err(|e| {
        Nat64Error::config_with_source(
            format!("Failed to parse config file: {}", config_path.display()),
            e,
        )
    })
}

// Default value functions for serde
fn default_tun_name() -> String {
    DEFAULT_TUN_NAME.to_string()
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_prefix() -> Ipv6Net {
    Nat64Prefix::WELL_KNOWN.as_net()
}

fn default_pool() -> Vec<Ipv4Net> {
    DEFAULT_POOL.parse::<Ipv4Net>().into_iter().collect()
}

fn default_binding_expiry_secs() -> u64 {
    DEFAULT_EXPIRY.as_secs()
}

fn default_install_routes() -> bool {
    true
}
