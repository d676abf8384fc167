//! vpn-bridge - Tunnel lifecycle and network adaptation for a packet engine
//!
//! This crate sits between an operating-system tunnel device and an external
//! packet-processing engine. It creates and replaces the tunnel, adapts the
//! engine's configuration document, answers the engine's platform calls and
//! keeps the engine in step with default-network changes.
//!
//! # Architecture
//!
//! - `config`: Settings file handling (TOML) and the tunnel description
//! - `document`: Engine document adaptation and start-failure classification
//! - `platform`: OS seam (tunnel device, socket protection, network binding)
//! - `vpn`: Tunnel controller, route parsing and default-network watcher
//! - `engine`: Engine handle, capability surface and session lifecycle
//! - `service`: Command queue and the top-level service state machine
//!
//! # Usage
//!
//! ```ignore
//! let (handle, commands) = vpn_bridge::service::channel();
//! let service = ServiceOrchestrator::create(&config, &document, platform, engine, host)?;
//! tokio::spawn(service.run(commands));
//! handle.start(Some(config.tunnel.clone())).await?;
//! ```

pub mod config;
pub mod document;
pub mod engine;
pub mod platform;
pub mod service;
pub mod vpn;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Config, TunnelConfig};
pub use document::{AdaptedConfig, ConfigAdapter};
pub use service::{ServiceCommand, ServiceHandle, ServiceOrchestrator};
