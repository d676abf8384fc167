//! Engine session lifecycle
//!
//! Starts the engine once against an adapted document, with a single
//! degraded retry when the failure looks cache-related. After start the
//! session only resyncs; stopping pauses then closes the engine.

use crate::document::{classify, AdaptedConfig, FailureKind};
use crate::engine::capability::PlatformCapability;
use crate::engine::{Engine, EngineError, EngineFactory};
use crate::vpn::watcher::NetworkResync;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    FailedToStart,
    Stopped,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Engine start failed: {message}")]
    StartFailed { cache_related: bool, message: String },
    #[error("Engine session already started")]
    AlreadyStarted,
    #[error("No tunnel descriptor available, establish the tunnel first")]
    TunnelNotReady,
    #[error("Engine session cannot start from state {0:?}")]
    NotStartable(SessionState),
}

pub struct EngineSession {
    factory: Arc<dyn EngineFactory>,
    capability: Arc<dyn PlatformCapability>,
    engine: RwLock<Option<Arc<dyn Engine>>>,
    state: Mutex<SessionState>,
}

impl EngineSession {
    pub fn new(factory: Arc<dyn EngineFactory>, capability: Arc<dyn PlatformCapability>) -> Self {
        Self {
            factory,
            capability,
            engine: RwLock::new(None),
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Start the engine against `adapted`.
    ///
    /// The tunnel descriptor must already be obtainable through the
    /// capability. A cache-related failure is retried once with the
    /// degraded document; any other failure, or a second failure, leaves the
    /// session in [`SessionState::FailedToStart`].
    pub fn start(&self, adapted: &AdaptedConfig) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Idle => {}
            SessionState::Running => return Err(SessionError::AlreadyStarted),
            other => return Err(SessionError::NotStartable(other)),
        }

        if self.capability.supply_tunnel_fd() < 0 {
            return Err(SessionError::TunnelNotReady);
        }

        let engine = match self.attempt(adapted) {
            Ok(engine) => engine,
            Err(message) => match classify(&message) {
                FailureKind::CacheRelated => {
                    warn!("Engine start failed with cache error, retrying without cache: {}", message);
                    let degraded = adapted.degrade();
                    match self.attempt(&degraded) {
                        Ok(engine) => engine,
                        Err(retry_message) => {
                            return Err(self.fail(true, retry_message));
                        }
                    }
                }
                FailureKind::Other => return Err(self.fail(false, message)),
            },
        };

        {
            let mut slot = self.engine.write().unwrap_or_else(PoisonError::into_inner);
            *slot = Some(engine);
        }
        *self.lock_state() = SessionState::Running;
        info!("Engine started");

        self.resync();
        Ok(())
    }

    /// Reset the engine's network view, plus wireless state when asked for.
    pub fn resync(&self) {
        if !self.is_running() {
            debug!("Engine not running, skipping resync");
            return;
        }
        let Some(engine) = self.current_engine() else {
            return;
        };

        if let Err(e) = engine.reset_network() {
            warn!("resetNetwork failed: {}", e);
        }
        if engine.needs_wifi_state() {
            if let Err(e) = engine.update_wifi_state() {
                warn!("updateWIFIState failed: {}", e);
            }
        }
    }

    /// Pause and close the engine. Both steps are always attempted.
    pub fn stop(&self) {
        let engine = self
            .engine
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(engine) = engine else {
            let mut state = self.lock_state();
            if *state != SessionState::FailedToStart {
                *state = SessionState::Stopped;
            }
            debug!("No engine to stop");
            return;
        };
        *self.lock_state() = SessionState::Stopped;

        if let Err(e) = engine.pause() {
            warn!("Engine pause failed: {} (continuing)", e);
        }
        if let Err(e) = engine.close() {
            warn!("Engine close failed: {}", e);
        }
        info!("Engine stopped");
    }

    /// One validate, construct, start sequence. The error is the full
    /// failure text including the engine's side-channel error.
    fn attempt(&self, adapted: &AdaptedConfig) -> Result<Arc<dyn Engine>, String> {
        let document = adapted.to_json();
        self.try_start(&document)
            .map_err(|e| self.failure_text(&e))
    }

    fn try_start(&self, document: &str) -> Result<Arc<dyn Engine>, EngineError> {
        self.factory.validate(document)?;
        let engine: Arc<dyn Engine> = self
            .factory
            .new_session(document, self.capability.clone())?
            .into();
        if let Err(e) = engine.start() {
            if let Err(close_err) = engine.close() {
                debug!("Closing engine after failed start: {}", close_err);
            }
            return Err(e);
        }
        Ok(engine)
    }

    fn failure_text(&self, error: &EngineError) -> String {
        match self.factory.last_service_error() {
            Some(extra) if !extra.trim().is_empty() => format!("{}\n{}", error, extra),
            _ => error.to_string(),
        }
    }

    fn fail(&self, cache_related: bool, message: String) -> SessionError {
        error!("Engine failed to start: {}", message);
        self.factory.clear_service_error();
        *self.lock_state() = SessionState::FailedToStart;
        SessionError::StartFailed {
            cache_related,
            message,
        }
    }

    fn current_engine(&self) -> Option<Arc<dyn Engine>> {
        self.engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NetworkResync for EngineSession {
    fn resync(&self) {
        EngineSession::resync(self);
    }
}
