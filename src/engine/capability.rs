//! Capability surface the engine calls into
//!
//! [`PlatformCapability`] carries a default for every method, so the inert
//! variant is just an empty impl. [`VpnCapability`] overrides the handful of
//! methods backed by the tunnel: socket protection, descriptor handoff and
//! interface monitoring. Nothing here returns an error to the engine; the
//! empty or negative value for each type is the answer for "unsupported".

use crate::config::InterfaceControl;
use crate::engine::EngineError;
use crate::platform::VpnPlatform;
use crate::vpn::tunnel::{TunnelController, NO_TUNNEL_FD};
use crate::vpn::watcher::NetworkWatcher;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receiver of default-interface updates inside the engine
pub trait InterfaceUpdateListener: Send + Sync {
    fn update_default_interface(
        &self,
        interface_name: &str,
        interface_index: i32,
        is_expensive: bool,
        is_constrained: bool,
    ) -> Result<(), EngineError>;
}

/// Connection whose owning process the engine wants to identify
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOwnerQuery {
    pub protocol: i32,
    pub source_address: String,
    pub source_port: u16,
    pub destination_address: String,
    pub destination_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub index: i32,
    pub mtu: u32,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiState {
    pub ssid: String,
    pub bssid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineNotification {
    pub identifier: String,
    pub title: String,
    pub body: String,
}

/// Replacement DNS transport offered to the engine
pub trait LocalDnsTransport: Send + Sync {
    fn raw(&self) -> bool;
}

/// Everything the engine may ask of the platform.
pub trait PlatformCapability: Send + Sync {
    /// When false the engine calls [`protect_socket`](Self::protect_socket)
    /// before every outbound connection.
    fn use_auto_detect_interface_control(&self) -> bool {
        false
    }

    fn protect_socket(&self, _fd: i32) {}

    /// Live tunnel descriptor, or -1 when none exists yet
    fn supply_tunnel_fd(&self) -> i32 {
        NO_TUNNEL_FD
    }

    fn start_interface_monitor(&self, _listener: Arc<dyn InterfaceUpdateListener>) {}

    fn stop_interface_monitor(&self, _listener: Arc<dyn InterfaceUpdateListener>) {}

    fn find_connection_owner(&self, _query: &ConnectionOwnerQuery) -> i32 {
        -1
    }

    fn package_name_by_uid(&self, _uid: i32) -> Option<String> {
        None
    }

    fn uid_by_package_name(&self, _package_name: &str) -> i32 {
        -1
    }

    fn local_dns_transport(&self) -> Option<Arc<dyn LocalDnsTransport>> {
        None
    }

    fn system_certificates(&self) -> Vec<String> {
        Vec::new()
    }

    fn interfaces(&self) -> Vec<NetworkInterface> {
        Vec::new()
    }

    fn read_wifi_state(&self) -> Option<WifiState> {
        None
    }

    fn send_notification(&self, notification: &EngineNotification) {
        debug!("Dropping engine notification {}", notification.identifier);
    }

    fn include_all_networks(&self) -> bool {
        false
    }

    fn use_proc_fs(&self) -> bool {
        false
    }

    fn under_network_extension(&self) -> bool {
        false
    }

    fn clear_dns_cache(&self) {}

    fn write_log(&self, message: &str) {
        info!(target: "engine", "{}", message);
    }
}

/// Capability with nothing behind it
#[derive(Debug, Default, Clone, Copy)]
pub struct InertCapability;

impl PlatformCapability for InertCapability {}

/// Capability backed by the live tunnel and network watcher
pub struct VpnCapability {
    platform: Arc<dyn VpnPlatform>,
    tunnel: Arc<TunnelController>,
    watcher: Arc<NetworkWatcher>,
    interface_control: InterfaceControl,
}

impl VpnCapability {
    pub fn new(
        platform: Arc<dyn VpnPlatform>,
        tunnel: Arc<TunnelController>,
        watcher: Arc<NetworkWatcher>,
        interface_control: InterfaceControl,
    ) -> Self {
        Self {
            platform,
            tunnel,
            watcher,
            interface_control,
        }
    }
}

impl PlatformCapability for VpnCapability {
    fn use_auto_detect_interface_control(&self) -> bool {
        self.interface_control == InterfaceControl::AutoDetect
    }

    fn protect_socket(&self, fd: i32) {
        if let Err(e) = self.platform.protect(fd) {
            warn!("protect({}) failed: {}", fd, e);
        }
    }

    fn supply_tunnel_fd(&self) -> i32 {
        let fd = self.tunnel.current_fd();
        if fd == NO_TUNNEL_FD {
            debug!("Engine asked for tunnel fd before establish");
        }
        fd
    }

    fn start_interface_monitor(&self, listener: Arc<dyn InterfaceUpdateListener>) {
        self.watcher.start(listener);
    }

    fn stop_interface_monitor(&self, listener: Arc<dyn InterfaceUpdateListener>) {
        self.watcher.stop_for(&listener);
    }
}
