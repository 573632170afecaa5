//! TUN device creation and route management.
//!
//! The translator reads every packet for the NAT64 prefix and the IPv4 pool
//! from one TUN device; translated packets leave through raw sockets.

use crate::error::{Nat64Error, Nat64Result};
use ipnet::{Ipv4Net, Ipv6Net};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tun::{AbstractDevice, AsyncDevice, Configuration};

/// TUN device configuration.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Device name. If None, the system assigns one.
    pub name: Option<String>,
    /// MTU for the device.
    pub mtu: u16,
}

impl TunConfig {
    pub fn new(mtu: u16) -> Self {
        Self { name: None, mtu }
    }

    /// Set the device name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A managed TUN device with async reads.
pub struct TunDevice {
    device: AsyncDevice,
    name: String,
    mtu: u16,
}

impl TunDevice {
    /// Create the device and bring it up. Needs `CAP_NET_ADMIN`.
    pub fn create(config: TunConfig) -> Nat64Result<Self> {
        let mut tun_config = Configuration::default();
        tun_config.mtu(config.mtu).up();

        if let Some(ref name) = config.name {
            #[allow(deprecated)]
            tun_config.name(name);
        }

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|platform_config| {
            platform_config.ensure_root_privileges(true);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| Nat64Error::tun_device(format!("Failed to create TUN device: {}", e)))?;

        let name = device
            .tun_name()
            .map_err(|e| Nat64Error::tun_device(format!("Failed to get TUN name: {}", e)))?;

        log::info!("Created TUN device: {} (mtu {})", name, config.mtu);

        Ok(Self {
            device,
            name,
            mtu: config.mtu,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Buffer size for reading packets (MTU + packet info header).
    pub fn buffer_size(&self) -> usize {
        self.mtu as usize + tun::PACKET_INFORMATION_LENGTH
    }

    /// Read one packet.
    pub async fn read(&mut self, buf: &mut [u8]) -> Nat64Result<usize> {
        Ok(self.device.read(buf).await?)
    }
}

/// Check if an error message indicates that a resource already exists.
///
/// - Linux iproute2: "RTNETLINK answers: File exists"
/// - macOS route: "route: writing to routing socket: File exists"
fn is_already_exists_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("file exists") || lower.contains("eexist")
}

/// A route entry that can be installed through the TUN device.
pub trait Route: std::fmt::Display + Copy {
    /// Label for log messages.
    const LABEL: &'static str;

    /// Arguments for `route` on macOS.
    fn macos_args(&self, verb: &str, tun_name: &str) -> Vec<String>;

    /// Arguments for `ip` on Linux.
    fn linux_args(&self, verb: &str, tun_name: &str) -> Vec<String>;
}

impl Route for Ipv4Net {
    const LABEL: &'static str = "IPv4 pool route";

    fn macos_args(&self, verb: &str, tun_name: &str) -> Vec<String> {
        vec![
            verb.into(),
            "-net".into(),
            self.network().to_string(),
            "-netmask".into(),
            self.netmask().to_string(),
            "-interface".into(),
            tun_name.into(),
        ]
    }

    fn linux_args(&self, verb: &str, tun_name: &str) -> Vec<String> {
        vec![
            "route".into(),
            verb.into(),
            self.to_string(),
            "dev".into(),
            tun_name.into(),
        ]
    }
}

impl Route for Ipv6Net {
    const LABEL: &'static str = "NAT64 prefix route";

    fn macos_args(&self, verb: &str, tun_name: &str) -> Vec<String> {
        vec![
            verb.into(),
            "-inet6".into(),
            self.to_string(),
            "-interface".into(),
            tun_name.into(),
        ]
    }

    fn linux_args(&self, verb: &str, tun_name: &str) -> Vec<String> {
        vec![
            "-6".into(),
            "route".into(),
            verb.into(),
            self.to_string(),
            "dev".into(),
            tun_name.into(),
        ]
    }
}

#[cfg(target_os = "macos")]
fn route_command<R: Route>(route: &R, add: bool, tun_name: &str) -> (&'static str, Vec<String>) {
    ("route", route.macos_args(if add { "add" } else { "delete" }, tun_name))
}

#[cfg(not(target_os = "macos"))]
fn route_command<R: Route>(route: &R, add: bool, tun_name: &str) -> (&'static str, Vec<String>) {
    ("ip", route.linux_args(if add { "add" } else { "del" }, tun_name))
}

/// Add one route. An existing identical route counts as success.
async fn add_route<R: Route>(tun_name: &str, route: &R) -> Nat64Result<()> {
    if !cfg!(any(target_os = "macos", target_os = "linux")) {
        return Err(Nat64Error::tun_device(
            "Route management not supported on this platform",
        ));
    }

    let (program, args) = route_command(route, true, tun_name);
    let output = Command::new(program)
        .args(&args)
        .output()
        .await
        .map_err(|e| {
            Nat64Error::tun_device_with_source(format!("Failed to execute {}", program), e)
        })?;

    if output.status.success() {
        log::info!("Added {} {} via {}", R::LABEL, route, tun_name);
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr_trimmed = stderr.trim();
    if is_already_exists_error(&stderr) {
        log::warn!(
            "{} {} already exists (treating as success): {}",
            R::LABEL,
            route,
            stderr_trimmed
        );
        Ok(())
    } else {
        Err(Nat64Error::tun_device(format!(
            "Failed to add {} {}: {}",
            R::LABEL,
            route,
            stderr_trimmed
        )))
    }
}

/// Remove one route, best effort. Blocking, so it can run from `Drop`.
fn remove_route_sync<R: Route>(tun_name: &str, route: &R) {
    if !cfg!(any(target_os = "macos", target_os = "linux")) {
        return;
    }

    let (program, args) = route_command(route, false, tun_name);
    match std::process::Command::new(program).args(&args).output() {
        Ok(output) if output.status.success() => {
            log::info!("Removed {} {} via {}", R::LABEL, route, tun_name);
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::warn!("Failed to remove {} {}: {}", R::LABEL, route, stderr.trim());
        }
        Err(e) => {
            log::warn!("Failed to execute {} for route removal: {}", program, e);
        }
    }
}

/// Add routes through the TUN device.
///
/// Returns a guard that removes them when dropped. If any route fails,
/// the ones already added are rolled back.
pub async fn add_routes<R: Route>(tun_name: &str, routes: &[R]) -> Nat64Result<RouteGuard<R>> {
    let mut guard = RouteGuard::new(tun_name.to_string());

    for route in routes {
        if let Err(e) = add_route(tun_name, route).await {
            log::warn!(
                "Failed to add {} {}, rolling back {} route(s)",
                R::LABEL,
                route,
                guard.routes.len()
            );
            // Dropping the guard removes what was added.
            return Err(e);
        }
        guard.routes.push(*route);
    }
    Ok(guard)
}

/// Removes its routes when dropped, including on early exit.
pub struct RouteGuard<R: Route> {
    tun_name: String,
    routes: Vec<R>,
}

impl<R: Route> RouteGuard<R> {
    fn new(tun_name: String) -> Self {
        Self {
            tun_name,
            routes: Vec::new(),
        }
    }

    /// Routes managed by this guard.
    pub fn routes(&self) -> &[R] {
        &self.routes
    }
}

impl<R: Route> Drop for RouteGuard<R> {
    fn drop(&mut self) {
        if self.routes.is_empty() {
            return;
        }
        log::info!(
            "Cleaning up {} {}(s) via {}",
            self.routes.len(),
            R::LABEL,
            self.tun_name
        );
        for route in self.routes.iter().rev() {
            remove_route_sync(&self.tun_name, route);
        }
    }
}
