//! In-memory multicast link
//!
//! A [`MemoryNetwork`] simulates one multicast segment per interface index.
//! Every [`MemoryTransport`] attached to the network sees the packets the
//! others send on the links it shares with them. Its own packets come back
//! only on a network built with [`MemoryNetwork::with_loopback`], the way a
//! multicast socket with loopback enabled sees them. Links can be taken
//! down to simulate send failures, and interface events can be injected to
//! exercise the engine's up/down handling.

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::record::InterfaceIndex;
use crate::traits::{
    InboundPacket, InterfaceInfo, SendReport, Transport, TransportEvent, TransportFactory,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

const FRAME_CAPACITY: usize = 1024;

/// Endpoint id used for packets injected from outside any transport
const FOREIGN_ENDPOINT: u64 = u64::MAX;

#[derive(Debug, Clone)]
struct Frame {
    from: u64,
    link: u32,
    data: Arc<Vec<u8>>,
}

struct NetworkInner {
    frames: broadcast::Sender<Frame>,
    next_endpoint: AtomicU64,
    down_links: Mutex<HashSet<u32>>,
    loopback: bool,
}

/// A simulated multicast network shared by several transports
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A network that also hands every packet back to its sender
    pub fn with_loopback() -> Self {
        Self::build(true)
    }

    fn build(loopback: bool) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CAPACITY);
        Self {
            inner: Arc::new(NetworkInner {
                frames,
                next_endpoint: AtomicU64::new(1),
                down_links: Mutex::new(HashSet::new()),
                loopback,
            }),
        }
    }

    /// Attach a new transport with the given interfaces
    pub fn endpoint(&self, interfaces: Vec<InterfaceInfo>) -> MemoryTransport {
        let id = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let (control, _) = broadcast::channel(FRAME_CAPACITY);
        MemoryTransport {
            id,
            network: self.clone(),
            interfaces: Arc::new(Mutex::new(interfaces)),
            control,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Attach a transport with a single interface (index 1, "mem0")
    pub fn single_link_endpoint(&self) -> MemoryTransport {
        self.endpoint(vec![InterfaceInfo::new(1, "mem0")])
    }

    /// Take a link down or bring it back; sends on a down link fail
    pub fn set_link_down(&self, link: u32, down: bool) {
        let mut links = self
            .inner
            .down_links
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if down {
            links.insert(link);
        } else {
            links.remove(&link);
        }
    }

    fn is_link_down(&self, link: u32) -> bool {
        self.inner
            .down_links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&link)
    }

    /// Deliver a packet from a host outside every attached transport
    pub fn inject(&self, link: u32, data: Vec<u8>) {
        self.publish(FOREIGN_ENDPOINT, link, data);
    }

    fn publish(&self, from: u64, link: u32, data: Vec<u8>) {
        // No receivers is not an error on a multicast link
        let _ = self.inner.frames.send(Frame {
            from,
            link,
            data: Arc::new(data),
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.inner.frames.subscribe()
    }
}

/// A packet recorded by [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub interface: InterfaceIndex,
    pub data: Vec<u8>,
}

/// Transport attached to a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    id: u64,
    network: MemoryNetwork,
    interfaces: Arc<Mutex<Vec<InterfaceInfo>>>,
    control: broadcast::Sender<TransportEvent>,
    sent: Arc<Mutex<Vec<SentPacket>>>,
}

impl MemoryTransport {
    fn active(&self) -> Vec<InterfaceInfo> {
        self.interfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every packet successfully sent so far, in order
    pub fn sent_packets(&self) -> Vec<SentPacket> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the sent-packet log
    pub fn clear_sent(&self) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Add an interface and notify watchers
    pub fn interface_up(&self, info: InterfaceInfo) {
        {
            let mut interfaces = self.interfaces.lock().unwrap_or_else(PoisonError::into_inner);
            interfaces.retain(|i| i.index != info.index);
            interfaces.push(info.clone());
        }
        let _ = self.control.send(TransportEvent::InterfaceUp(info));
    }

    /// Remove an interface and notify watchers
    pub fn interface_down(&self, index: InterfaceIndex) {
        self.interfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|i| i.index != index);
        let _ = self.control.send(TransportEvent::InterfaceDown(index));
    }

    fn source_addr(from: u64) -> SocketAddr {
        let host = (from % 0xFFFF) as u16;
        let ip = Ipv4Addr::new(169, 254, (host >> 8) as u8, host as u8);
        SocketAddr::new(IpAddr::V4(ip), crate::wire::MDNS_PORT)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        Ok(self.active())
    }

    async fn send(&self, interface: InterfaceIndex, packet: &[u8]) -> Result<SendReport> {
        let active = self.active();
        let targets: Vec<InterfaceIndex> = if interface.is_any() {
            active.iter().map(|i| i.index).collect()
        } else if active.iter().any(|i| i.index == interface) {
            vec![interface]
        } else {
            return Err(Error::network_unavailable(format!(
                "interface {} is not active",
                interface
            )));
        };

        let mut report = SendReport::default();
        for target in targets {
            if self.network.is_link_down(target.0) {
                debug!("memory link {} is down, dropping packet", target);
                report.failed.push((target, "link down".to_string()));
                continue;
            }
            self.network.publish(self.id, target.0, packet.to_vec());
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(SentPacket {
                    interface: target,
                    data: packet.to_vec(),
                });
            report.delivered.push(target);
        }
        Ok(report)
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = TransportEvent> + Send + 'static>> {
        let id = self.id;
        let interfaces = self.interfaces.clone();
        let network = self.network.clone();

        let packets = BroadcastStream::new(self.network.subscribe()).filter_map(move |frame| {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("memory transport lagging: {}", e);
                    return None;
                }
            };
            let own = frame.from == id && !network.inner.loopback;
            if own || network.is_link_down(frame.link) {
                return None;
            }
            let attached = interfaces
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .any(|i| i.index.0 == frame.link);
            if !attached {
                return None;
            }
            Some(TransportEvent::Packet(InboundPacket {
                interface: InterfaceIndex(frame.link),
                source: MemoryTransport::source_addr(frame.from),
                data: frame.data.as_ref().clone(),
            }))
        });

        let control = BroadcastStream::new(self.control.subscribe()).filter_map(|event| event.ok());

        Box::pin(packets.merge(control))
    }

    fn transport_name(&self) -> &'static str {
        "memory"
    }
}

/// Factory handing out endpoints on one shared network
pub struct MemoryTransportFactory {
    network: MemoryNetwork,
    interfaces: Vec<InterfaceInfo>,
}

impl MemoryTransportFactory {
    pub fn new(network: MemoryNetwork, interfaces: Vec<InterfaceInfo>) -> Self {
        Self {
            network,
            interfaces,
        }
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, config: &TransportConfig) -> Result<Box<dyn Transport>> {
        match config {
            TransportConfig::Memory => Ok(Box::new(self.network.endpoint(self.interfaces.clone()))),
            other => Err(Error::config(format!(
                "memory factory cannot build a '{}' transport",
                other.type_name()
            ))),
        }
    }
}

/// Register the in-memory transport under the name "memory"
pub fn register(registry: &crate::registry::TransportRegistry, network: MemoryNetwork) {
    registry.register_transport(
        "memory",
        Box::new(MemoryTransportFactory::new(
            network,
            vec![InterfaceInfo::new(1, "mem0")],
        )),
    );
}
