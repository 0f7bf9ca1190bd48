// # mdns-core
//
// Core library for the multicast DNS record registration engine.
//
// ## Architecture Overview
//
// This library registers DNS records on the local link and keeps them
// correct for their lifetime:
// - **Transport**: Trait for sending and receiving mDNS packets per interface
// - **AccessPolicy**: Trait deciding which clients may register records
// - **Responder**: Engine that probes, announces, defends and withdraws records
// - **Client / RecordRegistrar / Registration**: The caller-facing registration API
// - **TransportRegistry**: Plugin-based registry for transports
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Protocol state is separate from sockets
// 2. **Event-Driven**: Timers, packets and client calls feed one engine loop
// 3. **Plugin-Based**: Transports are registered dynamically, no hard-coded if-else
// 4. **Library-First**: All core functionality can be used as a library
// 5. **No Silent Drops**: Every registration ends with an event for its caller

pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod record;
pub mod registry;
pub mod store;
pub mod traits;
pub mod transport;
pub mod wire;

// Re-export core types for convenience
pub use config::{AccessConfig, EngineConfig, ResponderConfig, ServiceConfig, TransportConfig};
pub use engine::{
    Client, EngineEvent, RecordRegistrar, Registration, RegistrationEvent, RegistrationEvents,
    RegistrationInfo, RegistrationKind, Responder, ServiceSpec,
};
pub use error::{Error, Result};
pub use record::{InterfaceIndex, RecordFlags, RecordKind, ResourceRecord, rrclass, rrtype};
pub use registry::TransportRegistry;
pub use store::{RecordHandle, RegistrationId};
pub use traits::{AccessPolicy, Capability, Credentials, Transport, TransportFactory};
pub use wire::DomainName;
