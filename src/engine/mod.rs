//! Packet engine seam
//!
//! The engine itself is external. This module defines the handle the
//! controller drives ([`Engine`]), the factory that validates documents and
//! constructs sessions ([`EngineFactory`]), and the capability surface the
//! engine calls back into ([`capability`]).

pub mod capability;
pub mod session;

pub use capability::{
    InertCapability, InterfaceUpdateListener, PlatformCapability, VpnCapability,
};
pub use session::{EngineSession, SessionError, SessionState};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Opaque failure reported by the engine. Only the text is meaningful.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A constructed engine instance
pub trait Engine: Send + Sync {
    fn start(&self) -> Result<(), EngineError>;
    fn pause(&self) -> Result<(), EngineError>;
    fn close(&self) -> Result<(), EngineError>;
    fn reset_network(&self) -> Result<(), EngineError>;
    fn needs_wifi_state(&self) -> bool;
    fn update_wifi_state(&self) -> Result<(), EngineError>;
}

/// Entry points of the engine library that exist before any session does
pub trait EngineFactory: Send + Sync {
    /// One-time environment setup
    fn setup(&self, _paths: &EnginePaths) -> Result<(), EngineError> {
        Ok(())
    }

    fn validate(&self, document: &str) -> Result<(), EngineError>;

    fn new_session(
        &self,
        document: &str,
        capability: Arc<dyn PlatformCapability>,
    ) -> Result<Box<dyn Engine>, EngineError>;

    /// Error text the engine keeps outside of its return values
    fn last_service_error(&self) -> Option<String> {
        None
    }

    fn clear_service_error(&self) {}
}

/// Directories handed to the engine at setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePaths {
    pub base_dir: PathBuf,
    pub work_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub stderr_log: PathBuf,
}

impl EnginePaths {
    pub fn under(data_dir: &Path) -> Self {
        let work_dir = data_dir.join("engine");
        Self {
            base_dir: data_dir.to_path_buf(),
            stderr_log: work_dir.join("engine_stderr.log"),
            temp_dir: data_dir.join("engine_tmp"),
            work_dir,
        }
    }

    /// Create the work and temp directories, logging whatever fails
    pub fn create_dirs(&self) {
        for dir in [&self.work_dir, &self.temp_dir] {
            match std::fs::create_dir_all(dir) {
                Ok(()) => debug!("Engine directory ready: {}", dir.display()),
                Err(e) => warn!(
                    "Failed to create engine directory {}: {} (continuing)",
                    dir.display(),
                    e
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_engine_paths_layout() {
        let paths = EnginePaths::under(Path::new("/data/vpn-bridge"));
        assert_eq!(paths.base_dir, PathBuf::from("/data/vpn-bridge"));
        assert_eq!(paths.work_dir, PathBuf::from("/data/vpn-bridge/engine"));
        assert_eq!(paths.temp_dir, PathBuf::from("/data/vpn-bridge/engine_tmp"));
        assert_eq!(
            paths.stderr_log,
            PathBuf::from("/data/vpn-bridge/engine/engine_stderr.log")
        );
    }

    #[test]
    fn test_create_dirs() {
        let dir = TempDir::new().unwrap();
        let paths = EnginePaths::under(dir.path());
        paths.create_dirs();
        assert!(paths.work_dir.is_dir());
        assert!(paths.temp_dir.is_dir());
        // Second call is harmless
        paths.create_dirs();
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::new("failed to chown cache.db: permission denied");
        assert_eq!(err.to_string(), "failed to chown cache.db: permission denied");
    }
}
