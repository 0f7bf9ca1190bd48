//! Core traits for the responder
//!
//! This module defines the abstract interfaces at the responder's seams.
//!
//! - [`Transport`]: Send and receive multicast DNS packets
//! - [`AccessPolicy`]: Decide which clients may register records

pub mod access;
pub mod transport;

pub use access::{
    AccessPolicy, AllowAll, Capability, Credentials, PrincipalAllowList, RequireCapability,
};
pub use transport::{
    InboundPacket, InterfaceInfo, SendReport, Transport, TransportEvent, TransportFactory,
};
