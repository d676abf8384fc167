//! Engine configuration document adaptation
//!
//! The engine consumes a JSON document. Before it is handed over we:
//!
//! 1. Enable the cache file with a private absolute path and drop any caller
//!    supplied cache id
//! 2. Send every resolving DNS server through the canonical selector
//! 3. Point `route.final` at the canonical selector
//! 4. Remove explicit `"outbound": "direct"` pins from DNS and route rules
//! 5. Set the interface-control route flags for the configured mode
//!
//! Every other field passes through untouched.

use crate::config::{AdapterOptions, InterfaceControl};
use crate::document::failure::is_cache_failure_signature;
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// File name of the engine cache inside the working directory
pub const CACHE_FILE_NAME: &str = "cache.db";

const DIRECT_OUTBOUND: &str = "direct";

#[derive(Error, Debug)]
pub enum AdaptError {
    #[error("Malformed configuration document: {0}")]
    Malformed(String),
}

/// Adapted document, ready for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptedConfig {
    document: Value,
}

impl AdaptedConfig {
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Serialized form handed to the engine
    pub fn to_json(&self) -> String {
        self.document.to_string()
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.document).unwrap_or_else(|_| self.to_json())
    }

    pub fn caching_enabled(&self) -> bool {
        self.cache_file()
            .and_then(|cache| cache.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn cache_path(&self) -> Option<&str> {
        self.cache_file()
            .and_then(|cache| cache.get("path"))
            .and_then(Value::as_str)
    }

    /// Whether an engine error text points at the cache file.
    pub fn has_cache_failure_signature(&self, error_text: &str) -> bool {
        is_cache_failure_signature(error_text)
    }

    /// Same document with the caching section removed entirely.
    pub fn degrade(&self) -> AdaptedConfig {
        let mut document = self.document.clone();
        if let Some(root) = document.as_object_mut() {
            let now_empty = match root.get_mut("experimental").and_then(Value::as_object_mut) {
                Some(experimental) => {
                    experimental.remove("cache_file");
                    experimental.remove("cache_id");
                    experimental.is_empty()
                }
                None => false,
            };
            if now_empty {
                root.remove("experimental");
            }
        }
        AdaptedConfig { document }
    }

    fn cache_file(&self) -> Option<&Map<String, Value>> {
        self.document
            .get("experimental")?
            .get("cache_file")?
            .as_object()
    }
}

/// Free-function form of [`AdaptedConfig::degrade`].
pub fn degrade(adapted: &AdaptedConfig) -> AdaptedConfig {
    adapted.degrade()
}

pub struct ConfigAdapter {
    options: AdapterOptions,
}

impl ConfigAdapter {
    pub fn new(options: AdapterOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &AdapterOptions {
        &self.options
    }

    /// Parse and adapt a raw document.
    ///
    /// Fails only when the text is not a JSON object; missing sections are
    /// created as needed.
    pub fn adapt(&self, raw: &str, work_dir: &Path) -> Result<AdaptedConfig, AdaptError> {
        if raw.trim().is_empty() {
            return Err(AdaptError::Malformed("document is blank".to_string()));
        }
        let document: Value =
            serde_json::from_str(raw).map_err(|e| AdaptError::Malformed(e.to_string()))?;
        self.adapt_value(document, work_dir)
    }

    /// Adapt an already parsed document.
    pub fn adapt_value(&self, document: Value, work_dir: &Path) -> Result<AdaptedConfig, AdaptError> {
        let mut document = document;
        let root = document
            .as_object_mut()
            .ok_or_else(|| AdaptError::Malformed("top level is not an object".to_string()))?;

        self.enable_cache(root, work_dir);
        self.detour_dns_servers(root);
        strip_direct_pins(root, "dns");
        strip_direct_pins(root, "route");
        self.finalize_route(root);

        debug!(
            "Adapted document: selector={}, control={:?}",
            self.options.selector, self.options.interface_control
        );
        Ok(AdaptedConfig { document })
    }

    fn enable_cache(&self, root: &mut Map<String, Value>, work_dir: &Path) {
        let joined = work_dir.join(CACHE_FILE_NAME);
        let cache_path = std::path::absolute(&joined).unwrap_or(joined);

        let experimental = object_entry(root, "experimental");
        experimental.remove("cache_id");
        let cache = object_entry(experimental, "cache_file");
        cache.insert("enabled".to_string(), Value::Bool(true));
        cache.insert(
            "path".to_string(),
            Value::String(cache_path.to_string_lossy().into_owned()),
        );
        cache.remove("cache_id");
    }

    fn detour_dns_servers(&self, root: &mut Map<String, Value>) {
        let Some(servers) = root
            .get_mut("dns")
            .and_then(|dns| dns.get_mut("servers"))
            .and_then(Value::as_array_mut)
        else {
            return;
        };

        for server in servers.iter_mut().filter_map(Value::as_object_mut) {
            let address = server.get("address").and_then(Value::as_str).unwrap_or("");
            if !address.starts_with(&self.options.no_resolve_prefix) {
                server.insert(
                    "detour".to_string(),
                    Value::String(self.options.selector.clone()),
                );
            }
        }
    }

    fn finalize_route(&self, root: &mut Map<String, Value>) {
        let route = object_entry(root, "route");

        let pins_direct = route.get("final").and_then(Value::as_str) == Some(DIRECT_OUTBOUND);
        if self.options.force_final || pins_direct {
            route.insert(
                "final".to_string(),
                Value::String(self.options.selector.clone()),
            );
        }

        match self.options.interface_control {
            InterfaceControl::Protect => {
                route.insert("auto_detect_interface".to_string(), Value::Bool(false));
            }
            InterfaceControl::AutoDetect => {
                route.insert("auto_detect_interface".to_string(), Value::Bool(true));
                route.insert("override_android_vpn".to_string(), Value::Bool(true));
            }
        }
    }
}

/// Drop `"outbound": "direct"` from every rule in `<section>.rules`.
fn strip_direct_pins(root: &mut Map<String, Value>, section: &str) {
    let Some(rules) = root
        .get_mut(section)
        .and_then(|s| s.get_mut("rules"))
        .and_then(Value::as_array_mut)
    else {
        return;
    };

    for rule in rules.iter_mut().filter_map(Value::as_object_mut) {
        if rule.get("outbound").and_then(Value::as_str) == Some(DIRECT_OUTBOUND) {
            rule.remove("outbound");
        }
    }
}

/// Get `parent[key]` as an object, replacing a missing or non-object value.
fn object_entry<'a>(parent: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let slot = parent
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("slot was just replaced with an object"),
    }
}
