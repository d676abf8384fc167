//! Tunnel device lifecycle
//!
//! Owns the single live tunnel device. Establishing always closes the
//! previous device first, so two devices never coexist. The live descriptor
//! is mirrored in an atomic that the engine-facing capability reads from any
//! thread without touching the handle lock.

use crate::config::TunnelConfig;
use crate::platform::{NetworkId, PlatformError, TunnelDevice, VpnPlatform};
use crate::vpn::routing::parse_route;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Descriptor value meaning "no tunnel"
pub const NO_TUNNEL_FD: i32 = -1;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Tunnel establish failed: {0}")]
    EstablishFailed(#[from] PlatformError),
    #[error("Invalid MTU: {0}")]
    InvalidMtu(u32),
}

/// Ownership of the live OS tunnel device
pub struct TunnelHandle {
    device: Box<dyn TunnelDevice>,
    session: String,
    fd: i32,
}

impl TunnelHandle {
    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn close(mut self) -> Result<(), PlatformError> {
        self.device.close()
    }
}

pub struct TunnelController {
    platform: Arc<dyn VpnPlatform>,
    exclude_self: bool,
    handle: Mutex<Option<TunnelHandle>>,
    live_fd: AtomicI32,
}

impl TunnelController {
    pub fn new(platform: Arc<dyn VpnPlatform>, exclude_self: bool) -> Self {
        Self {
            platform,
            exclude_self,
            handle: Mutex::new(None),
            live_fd: AtomicI32::new(NO_TUNNEL_FD),
        }
    }

    pub fn is_established(&self) -> bool {
        self.current_fd() >= 0
    }

    /// Live tunnel descriptor, or [`NO_TUNNEL_FD`]
    pub fn current_fd(&self) -> i32 {
        self.live_fd.load(Ordering::Acquire)
    }

    /// Create the tunnel device described by `config`, replacing any live one.
    ///
    /// Address, route, DNS and exclusion failures are logged and skipped.
    /// Only a refusal to create the device itself is an error, in which case
    /// no handle exists afterwards.
    pub fn establish(&self, config: &TunnelConfig) -> Result<i32, TunnelError> {
        if config.mtu == 0 {
            return Err(TunnelError::InvalidMtu(config.mtu));
        }

        let mut slot = self.lock_handle();
        if let Some(previous) = slot.take() {
            self.close_handle(previous);
        }

        info!(
            "Establishing tunnel: session={}, mtu={}, address={}/{}",
            config.session, config.mtu, config.address, config.prefix
        );
        let mut builder = self.platform.tunnel_builder();
        builder.set_session(&config.session);
        builder.set_mtu(config.mtu);

        match config.address.trim().parse::<IpAddr>() {
            Ok(address) => {
                if let Err(e) = builder.add_address(address, config.prefix) {
                    error!(
                        "addAddress failed for {}/{}: {}",
                        config.address, config.prefix, e
                    );
                }
            }
            Err(_) => error!(
                "addAddress skipped, not an IP literal: {}/{}",
                config.address, config.prefix
            ),
        }

        for route in &config.routes {
            match parse_route(route) {
                Ok(parsed) => {
                    if let Err(e) = builder.add_route(parsed.address, parsed.prefix) {
                        warn!("addRoute failed for {}: {}", route, e);
                    }
                }
                Err(e) => warn!("Skipping route {}: {}", route, e),
            }
        }

        for dns in &config.dns {
            match dns.trim().parse::<IpAddr>() {
                Ok(server) => {
                    if let Err(e) = builder.add_dns_server(server) {
                        warn!("addDnsServer failed for {}: {}", dns, e);
                    }
                }
                Err(_) => warn!("Skipping DNS server {}: not an IP literal", dns),
            }
        }

        if self.exclude_self {
            if let Err(e) = builder.exclude_self() {
                warn!("Excluding own process from tunnel failed: {}", e);
            }
        }

        let device = builder.establish().map_err(|e| {
            error!("Failed to establish tunnel device: {}", e);
            TunnelError::EstablishFailed(e)
        })?;

        let fd = device.fd();
        *slot = Some(TunnelHandle {
            device,
            session: config.session.clone(),
            fd,
        });
        self.live_fd.store(fd, Ordering::Release);
        info!("Tunnel established with fd={}", fd);
        Ok(fd)
    }

    /// Route the controller's own traffic through `network` and report it as
    /// the tunnel's underlying network.
    ///
    /// The two steps are independent; either may fail without blocking the
    /// other. The underlying-network step needs a live tunnel and is skipped
    /// otherwise.
    pub fn rebind_to(&self, network: Option<NetworkId>) {
        match self.platform.bind_process_to_network(network) {
            Ok(()) => debug!("Process bound to {:?}", network),
            Err(e) => warn!("bindProcessToNetwork({:?}) failed: {}", network, e),
        }

        if !self.is_established() {
            debug!("No live tunnel, skipping underlying network update");
            return;
        }

        let networks = network.map(|n| vec![n]);
        if let Err(e) = self.platform.set_underlying_networks(networks.as_deref()) {
            warn!("setUnderlyingNetworks({:?}) failed: {}", network, e);
        }
    }

    /// Rebind to whatever the platform currently reports as active
    pub fn rebind_to_active(&self) {
        let active = self.platform.active_network();
        self.rebind_to(active);
    }

    /// Close the live tunnel, if any.
    pub fn teardown(&self) {
        let mut slot = self.lock_handle();
        match slot.take() {
            Some(handle) => {
                info!("Tearing down tunnel {}", handle.session());
                self.close_handle(handle);
            }
            None => debug!("Teardown requested with no live tunnel"),
        }
    }

    fn close_handle(&self, handle: TunnelHandle) {
        self.live_fd.store(NO_TUNNEL_FD, Ordering::Release);
        let fd = handle.fd();
        if let Err(e) = handle.close() {
            warn!("Closing tunnel fd={} failed: {} (continuing)", fd, e);
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<TunnelHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
