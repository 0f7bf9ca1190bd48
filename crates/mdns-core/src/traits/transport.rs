// # Transport Trait
//
// Defines the interface for sending and receiving multicast DNS packets.
//
// ## Implementations
//
// - In-memory link: `mdns_core::transport::MemoryTransport` (tests, embedding)
// - Multicast UDP: `mdns-transport-udp` crate
//
// ## Usage
//
// ```rust,ignore
// use mdns_core::{InterfaceIndex, Transport};
// use tokio_stream::StreamExt;
//
// async fn pump(transport: &dyn Transport, probe: Vec<u8>) -> mdns_core::Result<()> {
//     // Fan a packet out to every active interface
//     let report = transport.send(InterfaceIndex::ANY, &probe).await?;
//     println!("delivered on {} interfaces", report.delivered.len());
//
//     // Merged receive stream across all interfaces
//     let mut events = transport.watch();
//     while let Some(event) = events.next().await {
//         println!("{:?}", event);
//     }
//     Ok(())
// }
// ```

use crate::record::InterfaceIndex;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use tokio_stream::Stream;

/// A multicast-capable interface known to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub index: InterfaceIndex,
    pub name: String,
    /// Addresses advertised for the host on this interface
    pub addresses: Vec<IpAddr>,
}

impl InterfaceInfo {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index: InterfaceIndex(index),
            name: name.into(),
            addresses: Vec::new(),
        }
    }

    pub fn with_address(mut self, addr: IpAddr) -> Self {
        if !self.addresses.contains(&addr) {
            self.addresses.push(addr);
        }
        self
    }
}

/// A packet received on one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub interface: InterfaceIndex,
    pub source: SocketAddr,
    pub data: Vec<u8>,
}

/// Events produced by a transport's watch stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A DNS packet arrived
    Packet(InboundPacket),
    /// An interface became usable
    InterfaceUp(InterfaceInfo),
    /// An interface went away
    InterfaceDown(InterfaceIndex),
}

/// Per-interface outcome of a send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    pub delivered: Vec<InterfaceIndex>,
    pub failed: Vec<(InterfaceIndex, String)>,
}

impl SendReport {
    /// At least one interface took the packet
    pub fn any_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }
}

/// Trait for packet transports
///
/// A transport owns one socket (or simulated endpoint) per interface. It
/// does not parse packets and makes no protocol decisions; the engine owns
/// probing, timers and retries.
///
/// # Trust Level: Semi-Trusted
///
/// ## Allowed Capabilities
/// - ✅ Open and hold one socket per interface
/// - ✅ Spawn one receive task per socket
/// - ✅ Report per-interface send failures in [`SendReport`]
///
/// ## Forbidden Capabilities
/// - ❌ Retry sends or sleep between attempts (owned by the engine)
/// - ❌ Inspect or rewrite DNS payloads
///
/// Receive tasks must stop when the transport is dropped.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Interfaces currently usable for multicast
    async fn interfaces(&self) -> crate::Result<Vec<InterfaceInfo>>;

    /// Send one packet
    ///
    /// [`InterfaceIndex::ANY`] fans the packet out to every active interface.
    /// A failure on one interface is recorded in the report and does not stop
    /// delivery to the others. An error is returned only when the target
    /// interface does not exist.
    async fn send(&self, interface: InterfaceIndex, packet: &[u8]) -> crate::Result<SendReport>;

    /// Stream of received packets and interface changes, merged across interfaces
    ///
    /// The stream ends when the transport shuts down.
    fn watch(&self) -> Pin<Box<dyn Stream<Item = TransportEvent> + Send + 'static>>;

    /// Transport name, for logs
    fn transport_name(&self) -> &'static str;
}

/// Helper trait for constructing transports from configuration
pub trait TransportFactory: Send + Sync {
    /// Create a transport instance from configuration
    fn create(
        &self,
        config: &crate::config::TransportConfig,
    ) -> Result<Box<dyn Transport>, crate::Error>;
}
