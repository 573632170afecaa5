//! tunnel-rs-nat64
//!
//! Stateful NAT64 translator: IPv6-only hosts reach IPv4 servers through a
//! /96 prefix, each host leasing one address from an IPv4 pool.

#[cfg(not(unix))]
compile_error!("tunnel-rs-nat64 only supports Linux and macOS");

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tunnel_nat64::config::{expand_tilde, load_config, Nat64Config};
use tunnel_nat64::device::{add_routes, TunConfig, TunDevice};
use tunnel_nat64::{Dispatcher, RawEgress, Translator};

#[derive(Parser)]
#[command(name = "tunnel-rs-nat64")]
#[command(version)]
#[command(about = "Stateful NAT64 translator over a TUN device")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the translator
    Run {
        /// Path to config file (default: ~/.config/tunnel-rs/nat64.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Validate a config file and print the effective configuration
    CheckConfig {
        /// Path to config file
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Command-line values that take precedence over the config file.
#[derive(clap::Args, Debug, Default)]
struct Overrides {
    /// TUN device name
    #[arg(long)]
    tun_name: Option<String>,

    /// NAT64 prefix (only /96 is supported)
    #[arg(long)]
    prefix: Option<Ipv6Net>,

    /// IPv4 pool network (repeatable; replaces the configured pool)
    #[arg(long = "pool", value_name = "CIDR")]
    pool: Vec<Ipv4Net>,

    /// Pool address that is never leased (repeatable)
    #[arg(long = "reserved", value_name = "ADDR")]
    reserved: Vec<Ipv4Addr>,

    /// Idle seconds before a binding can be reclaimed
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    expiry_secs: Option<u64>,

    /// MTU for the TUN device (valid range: 1280-65535)
    #[arg(long, value_parser = clap::value_parser!(u16).range(1280..))]
    mtu: Option<u16>,

    /// Do not install routes for the prefix and pool
    #[arg(long)]
    no_routes: bool,
}

impl Overrides {
    fn apply(self, config: &mut Nat64Config) {
        if let Some(name) = self.tun_name {
            config.tun_name = name;
        }
        if let Some(prefix) = self.prefix {
            config.prefix = prefix;
        }
        if !self.pool.is_empty() {
            config.pool = self.pool;
        }
        if !self.reserved.is_empty() {
            config.reserved.extend(self.reserved);
        }
        if let Some(secs) = self.expiry_secs {
            config.binding_expiry_secs = secs;
        }
        if let Some(mtu) = self.mtu {
            config.mtu = mtu;
        }
        if self.no_routes {
            config.install_routes = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Command::Run { config, overrides } => {
            let mut config = load_config(config.as_deref()).context("Failed to load config")?;
            overrides.apply(&mut config);
            run_nat64(config).await
        }
        Command::CheckConfig { config } => check_config(&expand_tilde(&config)),
    }
}

/// Run the translator until Ctrl-C.
async fn run_nat64(config: Nat64Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    let prefix = config.nat64_prefix().context("Invalid NAT64 prefix")?;
    let bindings = Arc::new(
        config
            .build_binding_table()
            .context("Failed to configure the IPv4 pool")?,
    );
    let translator = Arc::new(Translator::new(prefix, bindings));

    let egress = RawEgress::open().context("Failed to open raw sockets (are you root?)")?;
    let mut device = TunDevice::create(TunConfig::new(config.mtu).with_name(&config.tun_name))
        .context("Failed to create TUN device")?;

    // Guards remove the routes again when they go out of scope.
    let (_prefix_routes, _pool_routes) = if config.install_routes {
        let prefix_routes = add_routes(device.name(), &[prefix.as_net()])
            .await
            .context("Failed to route the NAT64 prefix")?;
        let pool_routes = add_routes(device.name(), &config.pool)
            .await
            .context("Failed to route the IPv4 pool")?;
        (Some(prefix_routes), Some(pool_routes))
    } else {
        log::info!("Route installation disabled");
        (None, None)
    };

    log::info!(
        "NAT64 prefix {} with binding expiry {}s",
        prefix,
        config.binding_expiry_secs
    );

    let mut dispatcher = Dispatcher::new(translator, egress);
    let stats = dispatcher
        .run(&mut device, tokio::signal::ctrl_c())
        .await
        .context("NAT64 packet loop failed")?;

    log::info!("Stopped after {} translated packet(s)", stats.sent);
    Ok(())
}

/// Validate a config file and print it with defaults filled in.
fn check_config(path: &Path) -> Result<()> {
    let config = load_config(Some(path)).context("Failed to load config")?;
    config.validate().context("Invalid configuration")?;
    let table = config
        .build_binding_table()
        .context("Failed to configure the IPv4 pool")?;

    let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    print!("{}", text);
    println!("# {} leasable address(es)", table.free_addresses());
    Ok(())
}
