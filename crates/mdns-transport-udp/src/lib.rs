// # Multicast UDP Transport
//
// This crate sends and receives mDNS packets over IPv4 multicast
// (224.0.0.251:5353).
//
// ## Sockets
//
// One socket per interface, each bound to 0.0.0.0:<port> with
// SO_REUSEADDR/SO_REUSEPORT so other responders on the host can share the
// port. Every socket joins the group on its interface address and sends
// with IP_MULTICAST_IF set to that address and a multicast TTL of 255.
// Multicast loopback stays on: another responder on this host must hear
// our probes, and the engine recognises its own records when they echo.
//
// A socket bound to the wildcard address receives group traffic from every
// interface. On Linux each socket is tied to its device with
// SO_BINDTODEVICE; everywhere, a packet is only accepted when its source is
// on the socket's subnet or link-local, so an interface tag is never
// attached to traffic from another link.
//
// ## Interfaces
//
// Interfaces are enumerated with `if-addrs`. Loopback interfaces and
// interfaces without an IPv4 address are skipped; an optional allow-list
// restricts the set further. A socket that fails to bind is logged and
// skipped, and creation only fails when no interface could be bound.
// Interface indices are assigned per name on first sight and stay stable
// for the life of the transport.
//
// ## Events
//
// Each socket has a receive task feeding one channel. A periodic rescan
// (`UdpTransport::refresh`) opens sockets for new interfaces and closes
// those that disappeared, emitting InterfaceUp/InterfaceDown events.

use async_trait::async_trait;
use mdns_core::config::TransportConfig;
use mdns_core::registry::TransportRegistry;
use mdns_core::traits::{
    InboundPacket, InterfaceInfo, SendReport, Transport, TransportEvent, TransportFactory,
};
use mdns_core::wire::MDNS_IPV4_GROUP;
use mdns_core::{Error, InterfaceIndex, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Largest datagram we accept
const RECV_BUFFER_LEN: usize = 9000;

/// How often interfaces are rescanned
const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

struct Endpoint {
    info: InterfaceInfo,
    subnet: Subnet,
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

/// An interface's IPv4 address and netmask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Subnet {
    addr: Ipv4Addr,
    netmask: Ipv4Addr,
}

impl Subnet {
    /// Whether a packet from `source` can have arrived on this interface
    fn accepts(&self, source: &SocketAddr) -> bool {
        let IpAddr::V4(source) = source.ip() else {
            return false;
        };
        let mask = u32::from(self.netmask);
        source.is_link_local() || u32::from(source) & mask == u32::from(self.addr) & mask
    }
}

/// A usable interface found by the scan
struct Candidate {
    name: String,
    subnet: Subnet,
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[derive(Default)]
struct Sockets {
    endpoints: BTreeMap<InterfaceIndex, Endpoint>,
    indices: HashMap<String, u32>,
}

impl Sockets {
    fn index_for(&mut self, name: &str) -> InterfaceIndex {
        let next = self.indices.len() as u32 + 1;
        InterfaceIndex(*self.indices.entry(name.to_string()).or_insert(next))
    }
}

struct Inner {
    port: u16,
    allow: Vec<String>,
    sockets: Mutex<Sockets>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl Inner {
    fn sockets(&self) -> MutexGuard<'_, Sockets> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// IPv4 multicast transport
pub struct UdpTransport {
    inner: Arc<Inner>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Open sockets on every usable interface
    ///
    /// # Parameters
    ///
    /// - `interfaces`: Interface names to use; empty uses all of them
    /// - `port`: UDP port, normally 5353
    ///
    /// # Errors
    ///
    /// - `NetworkUnavailable` if no interface could be bound
    pub fn new(interfaces: Vec<String>, port: u16) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(Inner {
                port,
                allow: interfaces,
                sockets: Mutex::new(Sockets::default()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
            refresher: Mutex::new(None),
        };

        // The engine learns the initial set from interfaces(), not from events
        let (up, _) = refresh(&transport.inner, false)?;
        if up == 0 {
            return Err(Error::network_unavailable(format!(
                "no multicast-capable IPv4 interface could be bound on port {}",
                port
            )));
        }
        Ok(transport)
    }

    /// Rescan interfaces now
    ///
    /// Returns the number of interfaces that came up and went down.
    pub fn refresh(&self) -> Result<(usize, usize)> {
        refresh(&self.inner, true)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if let Some(task) = self
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Interfaces eligible for mDNS: first IPv4 address of each non-loopback interface
fn candidates(allow: &[String]) -> io::Result<Vec<Candidate>> {
    let mut found: Vec<Candidate> = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        let if_addrs::IfAddr::V4(v4) = &iface.addr else {
            continue;
        };
        if !allow.is_empty() && !allow.iter().any(|name| *name == iface.name) {
            continue;
        }
        if found.iter().any(|c| c.name == iface.name) {
            continue;
        }
        found.push(Candidate {
            name: iface.name.clone(),
            subnet: Subnet {
                addr: v4.ip,
                netmask: v4.netmask,
            },
        });
    }
    Ok(found)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_to_device(socket: &Socket, name: &str) {
    // Needs CAP_NET_RAW on older kernels; the subnet check still applies
    if let Err(e) = socket.bind_device(Some(name.as_bytes())) {
        warn!("Cannot bind mDNS socket to device {}: {}", name, e);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_to_device(_socket: &Socket, _name: &str) {}

fn open_socket(name: &str, addr: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    bind_to_device(&socket, name);
    socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into())?;
    socket.join_multicast_v4(&MDNS_IPV4_GROUP, &addr)?;
    socket.set_multicast_if_v4(&addr)?;
    socket.set_multicast_ttl_v4(255)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn spawn_reader(
    interface: InterfaceIndex,
    subnet: Subnet,
    socket: Arc<UdpSocket>,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((_, source)) if !subnet.accepts(&source) => {
                    debug!("Dropping packet from {} on {}: off-link", source, interface);
                }
                Ok((len, source)) => {
                    let packet = InboundPacket {
                        interface,
                        source,
                        data: buf[..len].to_vec(),
                    };
                    if events.send(TransportEvent::Packet(packet)).is_err() {
                        debug!("Receiver for {} closed, stopping", interface);
                        break;
                    }
                }
                Err(e) => {
                    warn!("Receive on {} failed: {}", interface, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}

/// Bring the socket set in line with the current interfaces
fn refresh(inner: &Inner, notify: bool) -> Result<(usize, usize)> {
    let found = candidates(&inner.allow)?;
    let mut sockets = inner.sockets();

    let mut down = Vec::new();
    for (index, endpoint) in &sockets.endpoints {
        let still_there = found
            .iter()
            .any(|c| c.name == endpoint.info.name && c.subnet == endpoint.subnet);
        if !still_there {
            down.push(*index);
        }
    }
    for index in &down {
        if let Some(endpoint) = sockets.endpoints.remove(index) {
            info!(
                "Interface {} ({}) went away",
                endpoint.info.name, endpoint.subnet.addr
            );
            if notify {
                let _ = inner.events_tx.send(TransportEvent::InterfaceDown(*index));
            }
        }
    }

    let mut up = 0;
    for Candidate { name, subnet } in found {
        let index = sockets.index_for(&name);
        if sockets.endpoints.contains_key(&index) {
            continue;
        }
        let addr = subnet.addr;
        match open_socket(&name, addr, inner.port) {
            Ok(socket) => {
                let socket = Arc::new(socket);
                let info =
                    InterfaceInfo::new(index.0, name.clone()).with_address(IpAddr::V4(addr));
                let reader =
                    spawn_reader(index, subnet, socket.clone(), inner.events_tx.clone());
                info!("Listening for mDNS on {} ({}) as {}", name, addr, index);
                sockets.endpoints.insert(
                    index,
                    Endpoint {
                        info: info.clone(),
                        subnet,
                        socket,
                        reader,
                    },
                );
                if notify {
                    let _ = inner.events_tx.send(TransportEvent::InterfaceUp(info));
                }
                up += 1;
            }
            Err(e) => warn!("Cannot bind mDNS socket on {} ({}): {}", name, addr, e),
        }
    }

    Ok((up, down.len()))
}

#[async_trait]
impl Transport for UdpTransport {
    async fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        Ok(self
            .inner
            .sockets()
            .endpoints
            .values()
            .map(|e| e.info.clone())
            .collect())
    }

    async fn send(&self, interface: InterfaceIndex, packet: &[u8]) -> Result<SendReport> {
        let targets: Vec<(InterfaceIndex, Arc<UdpSocket>)> = {
            let sockets = self.inner.sockets();
            if interface.is_any() {
                sockets
                    .endpoints
                    .iter()
                    .map(|(index, e)| (*index, e.socket.clone()))
                    .collect()
            } else {
                let endpoint = sockets.endpoints.get(&interface).ok_or_else(|| {
                    Error::network_unavailable(format!("interface {} is not bound", interface))
                })?;
                vec![(interface, endpoint.socket.clone())]
            }
        };

        let group = SocketAddr::new(IpAddr::V4(MDNS_IPV4_GROUP), self.inner.port);
        let mut report = SendReport::default();
        for (index, socket) in targets {
            match socket.send_to(packet, group).await {
                Ok(_) => report.delivered.push(index),
                Err(e) => {
                    debug!("Send on {} failed: {}", index, e);
                    report.failed.push((index, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = TransportEvent> + Send + 'static>> {
        let rx = self
            .inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(rx) = rx else {
            warn!("UDP transport is already being watched");
            let (_tx, rx) = mpsc::unbounded_channel();
            return Box::pin(UnboundedReceiverStream::new(rx));
        };

        // Rescan in the background for as long as the transport lives
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if let Err(e) = refresh(&inner, true) {
                    warn!("Interface rescan failed: {}", e);
                }
            }
        });
        *self
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        Box::pin(UnboundedReceiverStream::new(rx))
    }

    fn transport_name(&self) -> &'static str {
        "udp"
    }
}

/// Factory for creating UDP transports
pub struct UdpTransportFactory;

impl TransportFactory for UdpTransportFactory {
    fn create(&self, config: &TransportConfig) -> Result<Box<dyn Transport>> {
        match config {
            TransportConfig::Udp { interfaces, port } => {
                Ok(Box::new(UdpTransport::new(interfaces.clone(), *port)?))
            }
            _ => Err(Error::config("Invalid config for UDP transport")),
        }
    }
}

/// Register the UDP transport with a registry
pub fn register(registry: &TransportRegistry) {
    registry.register_transport("udp", Box::new(UdpTransportFactory));
}
