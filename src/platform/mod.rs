//! Platform-specific implementations
//!
//! The controller reaches the operating system only through [`VpnPlatform`]:
//! building the tunnel device, keeping sockets out of it, binding the process
//! to a network and watching the default network.

#[cfg(target_os = "linux")]
pub mod linux;

use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Operation not supported on this platform: {0}")]
    Unsupported(&'static str),
    #[error("Invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: String },
    #[error("Tunnel device error: {0}")]
    Device(String),
    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque reference to an OS network object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkId(pub u64);

/// The two link attributes the engine cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkCapabilities {
    pub not_metered: bool,
    pub not_congested: bool,
}

/// Token returned by a default-network callback registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackRegistration(pub u64);

/// Step-by-step tunnel device description, consumed by `establish`.
///
/// Each `add_*` call may be rejected on its own; the caller decides whether
/// a rejection is fatal.
pub trait TunnelBuilder: Send {
    fn set_session(&mut self, session: &str);
    fn set_mtu(&mut self, mtu: u32);
    fn add_address(&mut self, address: IpAddr, prefix: u8) -> Result<(), PlatformError>;
    fn add_route(&mut self, address: IpAddr, prefix: u8) -> Result<(), PlatformError>;
    fn add_dns_server(&mut self, server: IpAddr) -> Result<(), PlatformError>;
    /// Keep the calling process's own traffic out of the tunnel
    fn exclude_self(&mut self) -> Result<(), PlatformError>;
    fn establish(self: Box<Self>) -> Result<Box<dyn TunnelDevice>, PlatformError>;
}

/// A live tunnel device.
pub trait TunnelDevice: Send {
    fn fd(&self) -> i32;
    fn close(&mut self) -> Result<(), PlatformError>;
}

/// Receiver of OS default-network changes.
pub trait DefaultNetworkCallback: Send + Sync {
    fn on_available(&self, network: NetworkId);
    fn on_lost(&self, network: NetworkId);
    fn on_capabilities_changed(&self, network: NetworkId, capabilities: NetworkCapabilities);
}

/// Platform-agnostic VPN interface
pub trait VpnPlatform: Send + Sync {
    fn tunnel_builder(&self) -> Box<dyn TunnelBuilder>;

    /// Exclude a socket from the tunnel
    fn protect(&self, fd: i32) -> Result<(), PlatformError>;

    /// Route this process's traffic through `network`, or the system default when `None`
    fn bind_process_to_network(&self, network: Option<NetworkId>) -> Result<(), PlatformError>;

    /// Tell the tunnel device which networks carry its traffic
    fn set_underlying_networks(&self, networks: Option<&[NetworkId]>) -> Result<(), PlatformError>;

    fn active_network(&self) -> Option<NetworkId>;

    fn network_capabilities(&self, network: NetworkId) -> Option<NetworkCapabilities>;

    fn register_default_network_callback(
        &self,
        callback: Arc<dyn DefaultNetworkCallback>,
    ) -> Result<CallbackRegistration, PlatformError>;

    fn unregister_network_callback(&self, registration: CallbackRegistration) -> Result<(), PlatformError>;
}

/// Get the VPN platform for the current OS
pub fn get_platform() -> Result<Arc<dyn VpnPlatform>, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxPlatform::new()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(PlatformError::Unsupported("no VPN platform backend for this OS"))
    }
}
