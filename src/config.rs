//! Configuration handling for the VPN bridge
//!
//! Settings live in a TOML file with three sections: the tunnel device
//! description, the document adapter options and the service options.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid tunnel config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub adapter: AdapterOptions,
    #[serde(default)]
    pub service: ServiceOptions,
}

/// Desired tunnel device.
///
/// Immutable once handed to the controller; a reconfiguration supplies a new
/// value instead of mutating the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub session: String,
    pub mtu: u32,
    /// Local IPv4 or IPv6 literal
    pub address: String,
    pub prefix: u8,
    /// CIDR strings such as "0.0.0.0/0" or "2001:db8::/32"
    pub routes: Vec<String>,
    /// DNS server literals
    pub dns: Vec<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            session: "OnionVPN".to_string(),
            mtu: 1400,
            address: "172.19.0.2".to_string(),
            prefix: 30,
            routes: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            dns: vec!["1.1.1.1".to_string(), "2606:4700:4700::1111".to_string()],
        }
    }
}

impl TunnelConfig {
    /// Check the invariants that make a config unusable as a whole.
    ///
    /// Individual routes and DNS entries are not checked here; they are
    /// skipped one by one at establish time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu == 0 {
            return Err(ConfigError::Invalid("mtu must be greater than 0".into()));
        }
        if self.prefix > 128 {
            return Err(ConfigError::Invalid(format!(
                "prefix {} is out of range 0..=128",
                self.prefix
            )));
        }
        Ok(())
    }
}

/// How the engine keeps its own sockets out of the tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterfaceControl {
    /// The engine hands every outbound socket to the platform for protection
    #[default]
    Protect,
    /// The engine detects the outbound interface itself
    AutoDetect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterOptions {
    /// Name of the canonical selector outbound
    pub selector: String,
    /// DNS server addresses with this scheme never get a detour
    pub no_resolve_prefix: String,
    pub interface_control: InterfaceControl,
    /// When false, `route.final` is only replaced if it pins "direct"
    pub force_final: bool,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            selector: "Select".to_string(),
            no_resolve_prefix: "rcode://".to_string(),
            interface_control: InterfaceControl::Protect,
            force_final: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Keep the controller's own process out of the tunnel
    pub exclude_self: bool,
    /// Root for the engine working, temp and cache files
    pub data_dir: PathBuf,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("vpn-bridge");
        Self {
            exclude_self: true,
            data_dir,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.tunnel.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Find a config file in the usual places, falling back to defaults.
    ///
    /// Search order: `./vpn-bridge.toml`, then `~/.vpn-bridge/config.toml`.
    pub fn discover() -> Result<Self, ConfigError> {
        let local = PathBuf::from("vpn-bridge.toml");
        if local.exists() {
            return Self::load(&local);
        }

        if let Some(home) = dirs::home_dir() {
            let home_config = home.join(".vpn-bridge").join("config.toml");
            if home_config.exists() {
                return Self::load(&home_config);
            }
        }

        Ok(Self::default())
    }
}
