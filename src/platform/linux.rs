//! Linux-specific VPN platform
//!
//! The tunnel is a kernel TUN device created with the `tun` crate. Tunnel
//! routes go into a dedicated routing table selected by a policy rule that
//! skips packets carrying our firewall mark; protected sockets get that mark
//! via `SO_MARK`, so they keep using the main table.
//!
//! Linux has no per-process network binding, per-app exclusion or default
//! network callbacks in the Android sense; those report `Unsupported`.

use super::{
    CallbackRegistration, DefaultNetworkCallback, NetworkCapabilities, NetworkId, PlatformError,
    TunnelBuilder, TunnelDevice, VpnPlatform,
};
use nix::sys::socket::{setsockopt, sockopt};
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tun::AbstractDevice;

/// Firewall mark put on protected sockets
pub const DEFAULT_FWMARK: u32 = 0x2023;
/// Routing table holding the tunnel routes
pub const DEFAULT_ROUTE_TABLE: u32 = 2023;
const RULE_PRIORITY: &str = "9000";
const MAX_IFNAME_LEN: usize = 15;

pub struct LinuxPlatform {
    fwmark: u32,
    table: u32,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        Self {
            fwmark: DEFAULT_FWMARK,
            table: DEFAULT_ROUTE_TABLE,
        }
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl VpnPlatform for LinuxPlatform {
    fn tunnel_builder(&self) -> Box<dyn TunnelBuilder> {
        Box::new(LinuxTunnelBuilder::new(self.fwmark, self.table))
    }

    fn protect(&self, fd: i32) -> Result<(), PlatformError> {
        if fd < 0 {
            return Err(PlatformError::InvalidValue {
                what: "socket descriptor",
                value: fd.to_string(),
            });
        }
        // SAFETY: the engine owns `fd` and keeps it open for the duration of this call.
        let socket = unsafe { BorrowedFd::borrow_raw(fd) };
        setsockopt(&socket, sockopt::Mark, &self.fwmark)
            .map_err(|e| PlatformError::Io(e.into()))?;
        debug!("Marked socket {} with {:#x}", fd, self.fwmark);
        Ok(())
    }

    fn bind_process_to_network(&self, network: Option<NetworkId>) -> Result<(), PlatformError> {
        match network {
            None => Ok(()),
            Some(_) => Err(PlatformError::Unsupported("process network binding")),
        }
    }

    fn set_underlying_networks(&self, networks: Option<&[NetworkId]>) -> Result<(), PlatformError> {
        match networks {
            None => Ok(()),
            Some(_) => Err(PlatformError::Unsupported("underlying network selection")),
        }
    }

    fn active_network(&self) -> Option<NetworkId> {
        None
    }

    fn network_capabilities(&self, _network: NetworkId) -> Option<NetworkCapabilities> {
        None
    }

    fn register_default_network_callback(
        &self,
        _callback: Arc<dyn DefaultNetworkCallback>,
    ) -> Result<CallbackRegistration, PlatformError> {
        Err(PlatformError::Unsupported("default network callbacks"))
    }

    fn unregister_network_callback(&self, _registration: CallbackRegistration) -> Result<(), PlatformError> {
        Ok(())
    }
}

struct LinuxTunnelBuilder {
    fwmark: u32,
    table: u32,
    session: String,
    mtu: u32,
    address: Option<(Ipv4Addr, u8)>,
    routes: Vec<(IpAddr, u8)>,
    dns: Vec<IpAddr>,
}

impl LinuxTunnelBuilder {
    fn new(fwmark: u32, table: u32) -> Self {
        Self {
            fwmark,
            table,
            session: String::new(),
            mtu: 1500,
            address: None,
            routes: Vec::new(),
            dns: Vec::new(),
        }
    }
}

impl TunnelBuilder for LinuxTunnelBuilder {
    fn set_session(&mut self, session: &str) {
        self.session = session.to_string();
    }

    fn set_mtu(&mut self, mtu: u32) {
        self.mtu = mtu;
    }

    fn add_address(&mut self, address: IpAddr, prefix: u8) -> Result<(), PlatformError> {
        check_prefix(address, prefix)?;
        let IpAddr::V4(v4) = address else {
            return Err(PlatformError::Unsupported("IPv6 tunnel address"));
        };
        if self.address.is_some() {
            return Err(PlatformError::Unsupported("more than one tunnel address"));
        }
        self.address = Some((v4, prefix));
        Ok(())
    }

    fn add_route(&mut self, address: IpAddr, prefix: u8) -> Result<(), PlatformError> {
        check_prefix(address, prefix)?;
        self.routes.push((address, prefix));
        Ok(())
    }

    fn add_dns_server(&mut self, server: IpAddr) -> Result<(), PlatformError> {
        self.dns.push(server);
        Ok(())
    }

    fn exclude_self(&mut self) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported("per-app exclusion"))
    }

    fn establish(self: Box<Self>) -> Result<Box<dyn TunnelDevice>, PlatformError> {
        let mtu = u16::try_from(self.mtu).map_err(|_| PlatformError::InvalidValue {
            what: "mtu",
            value: self.mtu.to_string(),
        })?;

        let mut config = tun::Configuration::default();
        config.mtu(mtu).up();
        if let Some(name) = interface_name(&self.session) {
            config.tun_name(&name);
        }
        if let Some((address, prefix)) = self.address {
            config.address(address).netmask(prefix_to_netmask(prefix));
        }

        let device = tun::create(&config).map_err(|e| PlatformError::Device(e.to_string()))?;
        let name = device
            .tun_name()
            .map_err(|e| PlatformError::Device(e.to_string()))?;
        let fd = device.as_raw_fd();
        info!("TUN device {} created (fd={}, mtu={})", name, fd, mtu);

        let mut tunnel = LinuxTunnel {
            device: Some(device),
            name,
            fd,
            fwmark: self.fwmark,
            table: self.table,
            rules: Vec::new(),
        };
        tunnel.apply_routes(&self.routes);
        tunnel.apply_dns(&self.dns);
        Ok(Box::new(tunnel))
    }
}

struct LinuxTunnel {
    device: Option<tun::Device>,
    name: String,
    fd: i32,
    fwmark: u32,
    table: u32,
    /// Address families for which a policy rule was installed
    rules: Vec<&'static str>,
}

impl LinuxTunnel {
    fn apply_routes(&mut self, routes: &[(IpAddr, u8)]) {
        let table = self.table.to_string();
        for (address, prefix) in routes {
            let family = family_flag(*address);
            let destination = format!("{}/{}", address, prefix);
            let args = [
                family,
                "route",
                "replace",
                destination.as_str(),
                "dev",
                self.name.as_str(),
                "table",
                table.as_str(),
            ];
            match run_command("ip", &args) {
                Ok(()) => debug!("Added route {} via {}", destination, self.name),
                Err(e) => warn!("Failed to add route {}: {} (continuing)", destination, e),
            }
            if !self.rules.contains(&family) {
                self.add_rule(family);
            }
        }
    }

    fn add_rule(&mut self, family: &'static str) {
        let mark = self.fwmark.to_string();
        let table = self.table.to_string();
        let args = [
            family,
            "rule",
            "add",
            "not",
            "fwmark",
            mark.as_str(),
            "table",
            table.as_str(),
            "priority",
            RULE_PRIORITY,
        ];
        match run_command("ip", &args) {
            Ok(()) => self.rules.push(family),
            Err(e) => warn!("Failed to add {} policy rule: {}", family, e),
        }
    }

    fn apply_dns(&self, servers: &[IpAddr]) {
        if servers.is_empty() {
            return;
        }
        let servers: Vec<String> = servers.iter().map(IpAddr::to_string).collect();
        let mut args = vec!["dns", self.name.as_str()];
        args.extend(servers.iter().map(String::as_str));
        if let Err(e) = run_command("resolvectl", &args) {
            warn!("Failed to set DNS servers {:?}: {}", servers, e);
            return;
        }
        if let Err(e) = run_command("resolvectl", &["domain", self.name.as_str(), "~."]) {
            warn!("Failed to set DNS routing domain: {}", e);
        }
    }
}

impl TunnelDevice for LinuxTunnel {
    fn fd(&self) -> i32 {
        self.fd
    }

    fn close(&mut self) -> Result<(), PlatformError> {
        if self.device.is_none() {
            return Ok(());
        }

        let mark = self.fwmark.to_string();
        let table = self.table.to_string();
        for family in self.rules.drain(..) {
            let args = [
                family,
                "rule",
                "del",
                "not",
                "fwmark",
                mark.as_str(),
                "table",
                table.as_str(),
                "priority",
                RULE_PRIORITY,
            ];
            if let Err(e) = run_command("ip", &args) {
                warn!("Failed to remove {} policy rule: {} (continuing)", family, e);
            }
        }

        // routes in the tunnel table disappear with the device
        self.device = None;
        info!("TUN device {} closed", self.name);
        Ok(())
    }
}

impl Drop for LinuxTunnel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn run_command(program: &str, args: &[&str]) -> Result<(), PlatformError> {
    let command = format!("{} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| PlatformError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlatformError::Command {
            command,
            message: stderr.trim().to_string(),
        });
    }

    Ok(())
}

fn family_flag(address: IpAddr) -> &'static str {
    match address {
        IpAddr::V4(_) => "-4",
        IpAddr::V6(_) => "-6",
    }
}

fn check_prefix(address: IpAddr, prefix: u8) -> Result<(), PlatformError> {
    let max = match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return Err(PlatformError::InvalidValue {
            what: "prefix length",
            value: format!("{}/{}", address, prefix),
        });
    }
    Ok(())
}

fn prefix_to_netmask(prefix: u8) -> Ipv4Addr {
    let bits = match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - u32::from(p)),
    };
    Ipv4Addr::from(bits)
}

/// Kernel interface name derived from the session name.
fn interface_name(session: &str) -> Option<String> {
    let name: String = session
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_IFNAME_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_to_netmask() {
        assert_eq!(prefix_to_netmask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(prefix_to_netmask(8), Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(prefix_to_netmask(30), Ipv4Addr::new(255, 255, 255, 252));
        assert_eq!(prefix_to_netmask(32), Ipv4Addr::new(255, 255, 255, 255));
    }

    #[test]
    fn test_interface_name() {
        assert_eq!(interface_name("OnionVPN").as_deref(), Some("onionvpn"));
        assert_eq!(interface_name("Sing-Box VPN").as_deref(), Some("sing-boxvpn"));
        assert_eq!(
            interface_name("a-very-long-session-name").as_deref(),
            Some("a-very-long-ses")
        );
        assert_eq!(interface_name("  "), None);
    }

    #[test]
    fn test_builder_rejects_out_of_range_prefix() {
        let mut builder = LinuxTunnelBuilder::new(DEFAULT_FWMARK, DEFAULT_ROUTE_TABLE);
        let v4: IpAddr = "10.0.0.0".parse().unwrap();
        let v6: IpAddr = "2001:db8::".parse().unwrap();

        assert!(builder.add_route(v4, 8).is_ok());
        assert!(builder.add_route(v4, 33).is_err());
        assert!(builder.add_route(v6, 64).is_ok());
        assert!(builder.add_route(v6, 129).is_err());
        assert_eq!(builder.routes.len(), 2);
    }

    #[test]
    fn test_builder_address_rules() {
        let mut builder = LinuxTunnelBuilder::new(DEFAULT_FWMARK, DEFAULT_ROUTE_TABLE);

        let v6: IpAddr = "fdfe:dcba:9876::1".parse().unwrap();
        assert!(matches!(
            builder.add_address(v6, 126),
            Err(PlatformError::Unsupported(_))
        ));

        let v4: IpAddr = "172.19.0.2".parse().unwrap();
        assert!(builder.add_address(v4, 30).is_ok());
        assert!(builder.add_address(v4, 30).is_err());
        assert_eq!(builder.address, Some((Ipv4Addr::new(172, 19, 0, 2), 30)));
    }

    #[test]
    fn test_builder_exclude_self_unsupported() {
        let mut builder = LinuxTunnelBuilder::new(DEFAULT_FWMARK, DEFAULT_ROUTE_TABLE);
        assert!(matches!(
            builder.exclude_self(),
            Err(PlatformError::Unsupported(_))
        ));
    }

    #[test]
    fn test_protect_rejects_negative_fd() {
        let platform = LinuxPlatform::new();
        assert!(matches!(
            platform.protect(-1),
            Err(PlatformError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_network_binding() {
        let platform = LinuxPlatform::default();
        assert!(platform.bind_process_to_network(None).is_ok());
        assert!(platform.bind_process_to_network(Some(NetworkId(1))).is_err());
        assert!(platform.set_underlying_networks(None).is_ok());
        assert!(platform.active_network().is_none());
    }
}
