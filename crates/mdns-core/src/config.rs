//! Configuration types for the responder
//!
//! This module defines all configuration structures used throughout the crate.

use crate::conflict::ProbeTiming;
use crate::traits::{AccessPolicy, AllowAll, PrincipalAllowList, RequireCapability};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main responder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    /// Host label used for service targets (`<hostname>.local.`)
    pub hostname: String,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Client access policy
    #[serde(default)]
    pub access: AccessConfig,

    /// Services registered at startup by the daemon
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl ResponderConfig {
    /// Create a new configuration with defaults
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            transport: TransportConfig::default(),
            access: AccessConfig::default(),
            services: Vec::new(),
            engine: EngineConfig::default(),
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, crate::Error> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.hostname.is_empty() {
            return Err(crate::Error::config("Hostname cannot be empty"));
        }
        if self.hostname.len() > crate::wire::name::MAX_LABEL_LEN {
            return Err(crate::Error::config(format!(
                "Hostname '{}' exceeds 63 octets",
                self.hostname
            )));
        }
        if self.hostname.contains('.') {
            return Err(crate::Error::config(format!(
                "Hostname '{}' must be a single label",
                self.hostname
            )));
        }

        self.transport.validate()?;
        self.engine.validate()?;
        for service in &self.services {
            service.validate()?;
        }

        Ok(())
    }
}

/// Transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-process simulated link
    #[default]
    Memory,

    /// Multicast UDP on 224.0.0.251
    Udp {
        /// Interface names to use; empty means every multicast-capable interface
        #[serde(default)]
        interfaces: Vec<String>,
        /// UDP port
        #[serde(default = "default_mdns_port")]
        port: u16,
    },

    /// Custom transport
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl TransportConfig {
    /// Validate the transport configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            TransportConfig::Udp { port, .. } => {
                if *port == 0 {
                    return Err(crate::Error::config("UDP transport port must be > 0"));
                }
                Ok(())
            }
            TransportConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom transport factory cannot be empty",
                    ));
                }
                if config.is_null() {
                    return Err(crate::Error::config(
                        "Custom transport config cannot be null",
                    ));
                }
                Ok(())
            }
            TransportConfig::Memory => Ok(()),
        }
    }

    /// Get the transport type name
    pub fn type_name(&self) -> &str {
        match self {
            TransportConfig::Memory => "memory",
            TransportConfig::Udp { .. } => "udp",
            TransportConfig::Custom { factory, .. } => factory,
        }
    }
}

fn default_mdns_port() -> u16 {
    crate::wire::MDNS_PORT
}

/// Client access policy configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AccessConfig {
    /// Every client may register
    #[default]
    AllowAll,

    /// Clients must present the service discovery capability
    RequireCapability,

    /// Capability plus a listed principal
    AllowList {
        /// Allowed principals
        principals: Vec<String>,
    },
}

impl AccessConfig {
    /// Build the policy this configuration describes
    pub fn build(&self) -> Box<dyn AccessPolicy> {
        match self {
            AccessConfig::AllowAll => Box::new(AllowAll),
            AccessConfig::RequireCapability => Box::new(RequireCapability::default()),
            AccessConfig::AllowList { principals } => {
                Box::new(PrincipalAllowList::new(principals.iter().cloned()))
            }
        }
    }
}

/// A service to register at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Instance name; empty uses the hostname
    #[serde(default)]
    pub name: String,

    /// Service type, e.g. `_http._tcp`
    pub service_type: String,

    /// Domain
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Port
    pub port: u16,

    /// TXT entries (`key=value`)
    #[serde(default)]
    pub txt: Vec<String>,

    /// Interface index; 0 registers on every interface
    #[serde(default)]
    pub interface: u32,

    /// Fail on conflict instead of renaming
    #[serde(default)]
    pub no_auto_rename: bool,
}

impl ServiceConfig {
    /// Create a service configuration with defaults
    pub fn new(service_type: impl Into<String>, port: u16) -> Self {
        Self {
            name: String::new(),
            service_type: service_type.into(),
            domain: default_domain(),
            port,
            txt: Vec::new(),
            interface: 0,
            no_auto_rename: false,
        }
    }

    /// Set the instance name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Validate the service configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.service_type.is_empty() {
            return Err(crate::Error::config("Service type cannot be empty"));
        }
        if self.txt.iter().any(|entry| entry.len() > 255) {
            return Err(crate::Error::config(format!(
                "TXT entry for {} exceeds 255 bytes",
                self.service_type
            )));
        }
        Ok(())
    }
}

fn default_domain() -> String {
    "local.".to_string()
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Probe queries sent before a unique record is claimed
    #[serde(default = "default_probe_count")]
    pub probe_count: u8,

    /// Delay between probes (in milliseconds)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Unsolicited announcements after verification
    #[serde(default = "default_announce_count")]
    pub announce_count: u8,

    /// Delay between announcements (in milliseconds)
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,

    /// Goodbye packets sent on withdrawal
    #[serde(default = "default_goodbye_count")]
    pub goodbye_count: u8,

    /// Delay between goodbyes (in milliseconds)
    #[serde(default = "default_goodbye_interval_ms")]
    pub goodbye_interval_ms: u64,

    /// Upper bound of the random delay before the first probe (in milliseconds)
    ///
    /// Set to 0 to probe immediately.
    #[serde(default = "default_max_initial_delay_ms")]
    pub max_initial_delay_ms: u64,

    /// Consecutive probes that reached no interface before a registration fails
    #[serde(default = "default_max_send_failures")]
    pub max_send_failures: u32,

    /// Capacity of the engine event channel
    ///
    /// When full, new events are dropped (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.probe_count == 0 {
            return Err(crate::Error::config("probe_count must be > 0"));
        }
        if self.probe_interval_ms == 0 {
            return Err(crate::Error::config("probe_interval_ms must be > 0"));
        }
        if self.announce_count == 0 {
            return Err(crate::Error::config("announce_count must be > 0"));
        }
        if self.goodbye_count == 0 {
            return Err(crate::Error::config("goodbye_count must be > 0"));
        }
        if self.max_send_failures == 0 {
            return Err(crate::Error::config("max_send_failures must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("event_channel_capacity must be > 0"));
        }
        Ok(())
    }

    /// Protocol timing derived from these settings
    pub fn timing(&self) -> ProbeTiming {
        ProbeTiming {
            probe_count: self.probe_count,
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            announce_count: self.announce_count,
            announce_interval: Duration::from_millis(self.announce_interval_ms),
            goodbye_count: self.goodbye_count,
            goodbye_interval: Duration::from_millis(self.goodbye_interval_ms),
            max_initial_delay: Duration::from_millis(self.max_initial_delay_ms),
            max_send_failures: self.max_send_failures,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            probe_count: default_probe_count(),
            probe_interval_ms: default_probe_interval_ms(),
            announce_count: default_announce_count(),
            announce_interval_ms: default_announce_interval_ms(),
            goodbye_count: default_goodbye_count(),
            goodbye_interval_ms: default_goodbye_interval_ms(),
            max_initial_delay_ms: default_max_initial_delay_ms(),
            max_send_failures: default_max_send_failures(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_probe_count() -> u8 {
    3
}

fn default_probe_interval_ms() -> u64 {
    250
}

fn default_announce_count() -> u8 {
    2
}

fn default_announce_interval_ms() -> u64 {
    1000
}

fn default_goodbye_count() -> u8 {
    2
}

fn default_goodbye_interval_ms() -> u64 {
    250
}

fn default_max_initial_delay_ms() -> u64 {
    250
}

fn default_max_send_failures() -> u32 {
    5
}

fn default_event_channel_capacity() -> usize {
    1000
}
