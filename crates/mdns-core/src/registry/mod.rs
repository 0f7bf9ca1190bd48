//! Plugin-based transport registry
//!
//! The registry allows transports to be registered dynamically at runtime,
//! avoiding hardcoded if-else chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mdns_core::registry::TransportRegistry;
//! use mdns_core::config::TransportConfig;
//!
//! // Create a registry
//! let registry = TransportRegistry::new();
//!
//! // Register transports
//! mdns_transport_udp::register(&registry);
//!
//! // Create transport from config
//! let config = TransportConfig::Udp { interfaces: vec![], port: 5353 };
//! let transport = registry.create_transport(&config)?;
//! ```
//!
//! ## Registration
//!
//! Implementations should register themselves during initialization:
//!
//! ```rust,ignore
//! # use mdns_core::registry::TransportRegistry;
//!
//! // In mdns-transport-udp crate
//! pub fn register(registry: &TransportRegistry) {
//!     registry.register_transport("udp", Box::new(UdpTransportFactory));
//! }
//! ```

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::traits::{Transport, TransportFactory};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Transport registry for plugin-based transport creation
///
/// The registry maintains a map of transport type names to factory objects,
/// allowing dynamic instantiation of transports based on configuration.
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct TransportRegistry {
    /// Registered transport factories
    transports: RwLock<HashMap<String, Box<dyn TransportFactory>>>,
}

impl TransportRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport factory
    ///
    /// # Parameters
    ///
    /// - `name`: Transport type name (e.g., "udp", "memory")
    /// - `factory`: Factory object for creating transport instances
    ///
    /// Registering a name twice replaces the earlier factory.
    pub fn register_transport(&self, name: impl Into<String>, factory: Box<dyn TransportFactory>) {
        let name = name.into();
        let mut transports = self
            .transports
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        transports.insert(name, factory);
    }

    /// Create a transport from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn Transport>)`: Created transport instance
    /// - `Err(Error)`: If the transport type is not registered or creation fails
    pub fn create_transport(&self, config: &TransportConfig) -> Result<Box<dyn Transport>> {
        let transport_type = config.type_name();
        let transports = self
            .transports
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let factory = transports
            .get(transport_type)
            .ok_or_else(|| Error::config(format!("Unknown transport type: {}", transport_type)))?;

        factory.create(config)
    }

    /// List all registered transport types
    pub fn list_transports(&self) -> Vec<String> {
        let transports = self
            .transports
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        transports.keys().cloned().collect()
    }

    /// Check if a transport type is registered
    pub fn has_transport(&self, name: &str) -> bool {
        let transports = self
            .transports
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        transports.contains_key(name)
    }
}
