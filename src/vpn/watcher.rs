//! Default-network monitoring
//!
//! While monitoring, every OS default-network event is turned into the
//! ordered sequence rebind, forward the interface attributes, resync. The
//! watcher holds the engine's resync hook weakly; it never owns the session.
//!
//! Callbacks carry the generation they were registered under. Events that
//! arrive after `stop()` or from an older registration are dropped.

use crate::engine::capability::InterfaceUpdateListener;
use crate::platform::{
    CallbackRegistration, DefaultNetworkCallback, NetworkCapabilities, NetworkId, VpnPlatform,
};
use crate::vpn::tunnel::TunnelController;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};

/// Something that re-evaluates the engine's view of the network
pub trait NetworkResync: Send + Sync {
    fn resync(&self);
}

/// Attributes forwarded to the engine for one event. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkObservation {
    pub interface_index: i32,
    pub is_expensive: bool,
    pub is_constrained: bool,
}

impl NetworkObservation {
    /// "No interface yet"
    pub const NONE: NetworkObservation = NetworkObservation {
        interface_index: 0,
        is_expensive: false,
        is_constrained: false,
    };

    pub fn from_capabilities(capabilities: Option<NetworkCapabilities>) -> Self {
        match capabilities {
            Some(caps) => Self {
                interface_index: 0,
                is_expensive: !caps.not_metered,
                is_constrained: !caps.not_congested,
            },
            None => Self::NONE,
        }
    }

    /// Interface name is always reported empty and index 0, so the engine
    /// never looks up a stale or renamed interface.
    pub fn forward(&self, listener: &dyn InterfaceUpdateListener) {
        if let Err(e) =
            listener.update_default_interface("", 0, self.is_expensive, self.is_constrained)
        {
            warn!(
                "updateDefaultInterface(expensive={}, constrained={}) failed: {}",
                self.is_expensive, self.is_constrained, e
            );
        }
    }
}

enum WatcherState {
    Unmonitored,
    Monitoring {
        generation: u64,
        listener: Arc<dyn InterfaceUpdateListener>,
        registration: Option<CallbackRegistration>,
    },
}

struct WatcherInner {
    platform: Arc<dyn VpnPlatform>,
    tunnel: Arc<TunnelController>,
    resync: RwLock<Option<Weak<dyn NetworkResync>>>,
    state: Mutex<WatcherState>,
    next_generation: AtomicU64,
}

pub struct NetworkWatcher {
    inner: Arc<WatcherInner>,
}

impl NetworkWatcher {
    pub fn new(platform: Arc<dyn VpnPlatform>, tunnel: Arc<TunnelController>) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                platform,
                tunnel,
                resync: RwLock::new(None),
                state: Mutex::new(WatcherState::Unmonitored),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Hook the engine session in. Held weakly.
    pub fn attach_resync(&self, resync: Weak<dyn NetworkResync>) {
        let mut slot = self
            .inner
            .resync
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(resync);
    }

    pub fn is_monitoring(&self) -> bool {
        matches!(*self.inner.lock_state(), WatcherState::Monitoring { .. })
    }

    /// Begin monitoring on behalf of `listener`.
    ///
    /// The listener receives a synthetic "no interface" notification before
    /// the OS callback is registered. Starting again replaces the previous
    /// registration.
    pub fn start(&self, listener: Arc<dyn InterfaceUpdateListener>) {
        self.stop();

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.lock_state();
            *state = WatcherState::Monitoring {
                generation,
                listener: listener.clone(),
                registration: None,
            };
        }

        NetworkObservation::NONE.forward(listener.as_ref());

        let callback = Arc::new(WatcherCallback {
            inner: Arc::downgrade(&self.inner),
            generation,
        });
        match self.inner.platform.register_default_network_callback(callback) {
            Ok(registration) => {
                let stored = {
                    let mut state = self.inner.lock_state();
                    match &mut *state {
                        WatcherState::Monitoring {
                            generation: current,
                            registration: slot,
                            ..
                        } if *current == generation => {
                            *slot = Some(registration);
                            true
                        }
                        _ => false,
                    }
                };
                if stored {
                    info!("Default network monitoring started");
                } else {
                    debug!("Monitoring stopped during registration, unregistering");
                    self.inner.unregister(registration);
                }
            }
            Err(e) => warn!("registerDefaultNetworkCallback failed: {}", e),
        }
    }

    /// Stop monitoring. Safe to call when not monitoring.
    pub fn stop(&self) {
        let previous = {
            let mut state = self.inner.lock_state();
            std::mem::replace(&mut *state, WatcherState::Unmonitored)
        };
        self.inner.release(previous);
    }

    /// Stop monitoring only if `listener` is the one currently served.
    ///
    /// Returns whether monitoring was stopped. A listener from an earlier
    /// `start` leaves the current registration alone.
    pub fn stop_for(&self, listener: &Arc<dyn InterfaceUpdateListener>) -> bool {
        let previous = {
            let mut state = self.inner.lock_state();
            let is_current = match &*state {
                WatcherState::Monitoring {
                    listener: current, ..
                } => same_listener(current, listener),
                WatcherState::Unmonitored => return false,
            };
            if !is_current {
                debug!("Stop requested by a stale listener, keeping monitor");
                return false;
            }
            std::mem::replace(&mut *state, WatcherState::Unmonitored)
        };
        self.inner.release(previous);
        true
    }
}

fn same_listener(a: &Arc<dyn InterfaceUpdateListener>, b: &Arc<dyn InterfaceUpdateListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Drop for NetworkWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WatcherInner {
    fn lock_state(&self) -> MutexGuard<'_, WatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, previous: WatcherState) {
        match previous {
            WatcherState::Monitoring {
                registration: Some(registration),
                ..
            } => {
                self.unregister(registration);
                info!("Default network monitoring stopped");
            }
            WatcherState::Monitoring {
                registration: None, ..
            } => debug!("Monitoring stopped with no OS registration"),
            WatcherState::Unmonitored => debug!("Watcher already stopped"),
        }
    }

    fn unregister(&self, registration: CallbackRegistration) {
        if let Err(e) = self.platform.unregister_network_callback(registration) {
            warn!("unregisterNetworkCallback({:?}) failed: {}", registration, e);
        }
    }

    /// Listener for `generation`, if that registration is still current
    fn current_listener(&self, generation: u64) -> Option<Arc<dyn InterfaceUpdateListener>> {
        match &*self.lock_state() {
            WatcherState::Monitoring {
                generation: current,
                listener,
                ..
            } if *current == generation => Some(listener.clone()),
            _ => None,
        }
    }

    fn resync_engine(&self) {
        let resync = self
            .resync
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        match resync {
            Some(target) => target.resync(),
            None => debug!("No engine session attached, skipping resync"),
        }
    }

    fn network_available(&self, generation: u64, network: NetworkId) {
        let Some(listener) = self.current_listener(generation) else {
            debug!("Ignoring stale available event for {:?}", network);
            return;
        };
        debug!("Default network available: {:?}", network);
        self.tunnel.rebind_to(Some(network));
        let capabilities = self.platform.network_capabilities(network);
        NetworkObservation::from_capabilities(capabilities).forward(listener.as_ref());
        self.resync_engine();
    }

    fn network_lost(&self, generation: u64, network: NetworkId) {
        let Some(listener) = self.current_listener(generation) else {
            debug!("Ignoring stale lost event for {:?}", network);
            return;
        };
        debug!("Default network lost: {:?}", network);
        self.tunnel.rebind_to(None);
        NetworkObservation::NONE.forward(listener.as_ref());
        self.resync_engine();
    }

    fn capabilities_changed(&self, generation: u64, capabilities: NetworkCapabilities) {
        let Some(listener) = self.current_listener(generation) else {
            return;
        };
        NetworkObservation::from_capabilities(Some(capabilities)).forward(listener.as_ref());
    }
}

struct WatcherCallback {
    inner: Weak<WatcherInner>,
    generation: u64,
}

impl DefaultNetworkCallback for WatcherCallback {
    fn on_available(&self, network: NetworkId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.network_available(self.generation, network);
        }
    }

    fn on_lost(&self, network: NetworkId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.network_lost(self.generation, network);
        }
    }

    fn on_capabilities_changed(&self, _network: NetworkId, capabilities: NetworkCapabilities) {
        if let Some(inner) = self.inner.upgrade() {
            inner.capabilities_changed(self.generation, capabilities);
        }
    }
}
