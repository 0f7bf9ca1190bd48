//! mDNS wire format
//!
//! RFC 1035 message layout as used by multicast DNS (RFC 6762).

pub mod message;
pub mod name;
mod reader;

pub use message::{Message, Question, WireRecord};
pub use name::DomainName;

/// IPv4 multicast group for mDNS
pub const MDNS_IPV4_GROUP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(224, 0, 0, 251);

/// mDNS UDP port
pub const MDNS_PORT: u16 = 5353;
