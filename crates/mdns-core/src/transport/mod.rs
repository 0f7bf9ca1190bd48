//! Built-in transports
//!
//! Real sockets live in the `mdns-transport-udp` crate.

pub mod memory;

pub use memory::{MemoryNetwork, MemoryTransport, MemoryTransportFactory, SentPacket};
