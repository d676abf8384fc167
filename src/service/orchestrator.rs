//! Top-level service state machine
//!
//! Sequence: adapt the document at creation, wait for a start command
//! carrying a tunnel config, establish the tunnel, then start the engine.
//! Later start commands re-establish and resync only. Revoke and destroy
//! tear everything down.
//!
//! Commands are handled one at a time, so there is never more than one
//! create or destroy sequence in flight.

use crate::config::{Config, TunnelConfig};
use crate::document::{AdaptError, AdaptedConfig, ConfigAdapter};
use crate::engine::capability::{PlatformCapability, VpnCapability};
use crate::engine::session::{EngineSession, SessionError};
use crate::engine::{EngineFactory, EnginePaths};
use crate::platform::{
    CallbackRegistration, DefaultNetworkCallback, NetworkCapabilities, NetworkId, VpnPlatform,
};
use crate::service::host::{ServiceHost, ServiceStatus};
use crate::service::signal::ServiceCommand;
use crate::vpn::tunnel::{TunnelController, TunnelError};
use crate::vpn::watcher::{NetworkResync, NetworkWatcher};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Malformed engine document: {0}")]
    Document(#[from] AdaptError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Service command channel closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Created, no tunnel requested yet
    AwaitingTunnel,
    Running,
    Failed,
    Stopped,
}

pub struct ServiceOrchestrator {
    adapted: AdaptedConfig,
    platform: Arc<dyn VpnPlatform>,
    tunnel: Arc<TunnelController>,
    watcher: Arc<NetworkWatcher>,
    session: Arc<EngineSession>,
    host: Arc<dyn ServiceHost>,
    /// Service-level network callback, independent of the engine's monitor
    fallback: Option<CallbackRegistration>,
    state: ServiceState,
}

/// Resyncs the engine on every default-network gain or loss, whether or
/// not the engine ever started its own interface monitor.
struct FallbackResync {
    session: Weak<EngineSession>,
}

impl DefaultNetworkCallback for FallbackResync {
    fn on_available(&self, network: NetworkId) {
        if let Some(session) = self.session.upgrade() {
            debug!("Fallback resync, network available: {:?}", network);
            session.resync();
        }
    }

    fn on_lost(&self, network: NetworkId) {
        if let Some(session) = self.session.upgrade() {
            debug!("Fallback resync, network lost: {:?}", network);
            session.resync();
        }
    }

    fn on_capabilities_changed(&self, _network: NetworkId, _capabilities: NetworkCapabilities) {}
}

impl ServiceOrchestrator {
    /// Prepare the engine environment, adapt the document and wire the
    /// components together.
    ///
    /// A malformed document is reported to the host as a failure and the
    /// host is asked to stop; nothing else is created.
    pub fn create(
        config: &Config,
        raw_document: &str,
        platform: Arc<dyn VpnPlatform>,
        factory: Arc<dyn EngineFactory>,
        host: Arc<dyn ServiceHost>,
    ) -> Result<Self, ServiceError> {
        let paths = EnginePaths::under(&config.service.data_dir);
        paths.create_dirs();
        if let Err(e) = factory.setup(&paths) {
            warn!("Engine setup failed: {} (continuing)", e);
        }

        let adapter = ConfigAdapter::new(config.adapter.clone());
        let adapted = match adapter.adapt(raw_document, &paths.work_dir) {
            Ok(adapted) => adapted,
            Err(e) => {
                error!("Cannot adapt engine document: {}", e);
                host.report(&ServiceStatus::Failed(e.to_string()));
                host.stop_self();
                return Err(e.into());
            }
        };
        debug!(
            "Document adapted, caching={} path={:?}",
            adapted.caching_enabled(),
            adapted.cache_path()
        );

        let tunnel = Arc::new(TunnelController::new(
            platform.clone(),
            config.service.exclude_self,
        ));
        let watcher = Arc::new(NetworkWatcher::new(platform.clone(), tunnel.clone()));
        let capability: Arc<dyn PlatformCapability> = Arc::new(VpnCapability::new(
            platform.clone(),
            tunnel.clone(),
            watcher.clone(),
            config.adapter.interface_control,
        ));
        let session = Arc::new(EngineSession::new(factory, capability));
        let resync: Arc<dyn NetworkResync> = session.clone();
        watcher.attach_resync(Arc::downgrade(&resync));

        Ok(Self {
            adapted,
            platform,
            tunnel,
            watcher,
            session,
            host,
            fallback: None,
            state: ServiceState::AwaitingTunnel,
        })
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn adapted(&self) -> &AdaptedConfig {
        &self.adapted
    }

    pub fn tunnel(&self) -> &Arc<TunnelController> {
        &self.tunnel
    }

    pub fn session(&self) -> &Arc<EngineSession> {
        &self.session
    }

    /// Apply one command. Returns false once the service has ended.
    pub fn handle(&mut self, command: ServiceCommand) -> bool {
        if matches!(self.state, ServiceState::Failed | ServiceState::Stopped) {
            debug!("Ignoring {:?}, service already ended", command);
            return false;
        }

        match command {
            ServiceCommand::Start(config) => {
                if let Err(e) = self.handle_start(config) {
                    self.fail(&e);
                }
            }
            ServiceCommand::Revoke => {
                info!("VPN permission revoked");
                self.shutdown();
                self.host.stop_self();
            }
            ServiceCommand::Destroy => {
                info!("Service destroyed");
                self.shutdown();
            }
        }

        !matches!(self.state, ServiceState::Failed | ServiceState::Stopped)
    }

    /// Process commands until the service ends or every handle is dropped.
    ///
    /// Each command runs to completion before the next is received; the
    /// platform and engine calls it makes are bounded.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ServiceCommand>) -> ServiceState {
        while let Some(command) = commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }

        if !matches!(self.state, ServiceState::Failed | ServiceState::Stopped) {
            info!("Command channel closed, shutting down");
            self.shutdown();
        }
        self.state
    }

    fn handle_start(&mut self, config: Option<TunnelConfig>) -> Result<(), ServiceError> {
        let Some(config) = config else {
            info!("Start request without tunnel config, nothing to establish");
            return Ok(());
        };

        self.tunnel.establish(&config)?;
        self.tunnel.rebind_to_active();

        if self.session.is_running() {
            debug!("Engine already running, resyncing against the new tunnel");
            self.session.resync();
            return Ok(());
        }

        self.session.start(&self.adapted)?;
        self.register_fallback();
        self.state = ServiceState::Running;
        self.host.report(&ServiceStatus::Running);
        Ok(())
    }

    fn fail(&mut self, error: &ServiceError) {
        error!("Service failed: {}", error);
        self.host.report(&ServiceStatus::Failed(error.to_string()));
        self.teardown();
        self.state = ServiceState::Failed;
        self.host.stop_self();
    }

    fn shutdown(&mut self) {
        self.teardown();
        self.state = ServiceState::Stopped;
        self.host.report(&ServiceStatus::Stopped);
    }

    fn register_fallback(&mut self) {
        if self.fallback.is_some() {
            return;
        }
        let callback = Arc::new(FallbackResync {
            session: Arc::downgrade(&self.session),
        });
        match self.platform.register_default_network_callback(callback) {
            Ok(registration) => self.fallback = Some(registration),
            Err(e) => warn!("Fallback network callback not registered: {}", e),
        }
    }

    /// Every step runs regardless of how the previous one went.
    fn teardown(&mut self) {
        if let Some(registration) = self.fallback.take() {
            if let Err(e) = self.platform.unregister_network_callback(registration) {
                warn!("unregisterNetworkCallback({:?}) failed: {}", registration, e);
            }
        }
        self.watcher.stop();
        self.tunnel.rebind_to(None);
        self.session.stop();
        self.tunnel.teardown();
    }
}
