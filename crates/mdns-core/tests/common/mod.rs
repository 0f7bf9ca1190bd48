//! Test harness and common utilities for responder contract tests
//!
//! Every responder runs on a shared in-memory network, so several of them
//! can talk to each other. Tests use a paused clock; timers fire as soon as
//! all tasks are idle.

#![allow(dead_code)]

use mdns_core::config::{EngineConfig, ResponderConfig};
use mdns_core::transport::{MemoryNetwork, MemoryTransport};
use mdns_core::wire::{Message, WireRecord};
use mdns_core::traits::{AllowAll, InterfaceInfo};
use mdns_core::{
    Capability, Client, Credentials, DomainName, EngineEvent, RegistrationEvent,
    RegistrationEvents, Responder, rrclass,
};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Engine settings used by every test: no random start delay
pub fn test_config(hostname: &str) -> ResponderConfig {
    let mut config = ResponderConfig::new(hostname);
    config.engine = EngineConfig {
        max_initial_delay_ms: 0,
        ..EngineConfig::default()
    };
    config
}

pub fn credentials() -> Credentials {
    Credentials::new("test").with_capability(Capability::ServiceDiscovery)
}

/// A responder running in the background
pub struct RunningResponder {
    pub transport: MemoryTransport,
    pub client: Client,
    pub events: mpsc::Receiver<EngineEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<mdns_core::Result<()>>>,
}

impl RunningResponder {
    pub async fn start(network: &MemoryNetwork, hostname: &str) -> Self {
        Self::start_with(network, test_config(hostname)).await
    }

    pub async fn start_with(network: &MemoryNetwork, config: ResponderConfig) -> Self {
        Self::start_on(network, config, vec![InterfaceInfo::new(1, "mem0")]).await
    }

    pub async fn start_on(
        network: &MemoryNetwork,
        config: ResponderConfig,
        interfaces: Vec<InterfaceInfo>,
    ) -> Self {
        let transport = network.endpoint(interfaces);
        let (responder, events) =
            Responder::new(Box::new(transport.clone()), Box::new(AllowAll), config)
                .await
                .expect("responder construction succeeds");
        let client = responder.connect(&credentials()).expect("client connects");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle =
            tokio::spawn(async move { responder.run_with_shutdown(Some(shutdown_rx)).await });

        // Let the engine subscribe to the network before anyone sends
        tokio::time::sleep(Duration::from_millis(1)).await;

        Self {
            transport,
            client,
            events,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Trigger shutdown and wait for the engine to finish withdrawing
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let result = tokio::time::timeout(Duration::from_secs(30), handle)
                .await
                .expect("engine stops in time")
                .expect("engine task does not panic");
            assert!(result.is_ok(), "engine should shut down cleanly: {:?}", result);
        }
    }

    /// Every packet this responder sent, decoded
    pub fn sent_messages(&self) -> Vec<Message> {
        self.transport
            .sent_packets()
            .iter()
            .map(|p| Message::decode(&p.data).expect("sent packets decode"))
            .collect()
    }

    /// Drain the engine events received so far
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Link 1 with an address, so the responder advertises its host name
pub fn addressed_link(last_octet: u8) -> InterfaceInfo {
    let addr = Ipv4Addr::new(192, 168, 1, last_octet);
    InterfaceInfo::new(1, "mem0").with_address(IpAddr::V4(addr))
}

/// An encoded response from another host claiming `name`
pub fn foreign_answer(name: &str, rrtype: u16, rdata: &[u8]) -> Vec<u8> {
    let mut response = Message::response();
    response.answers.push(WireRecord {
        name: DomainName::parse(name).expect("valid name"),
        rrtype,
        rrclass: rrclass::IN,
        cache_flush: true,
        ttl: 120,
        rdata: rdata.to_vec(),
    });
    response.encode().expect("response encodes")
}

/// Wait for the next registration outcome
pub async fn next_outcome(listener: &mut RegistrationEvents) -> RegistrationEvent {
    tokio::time::timeout(Duration::from_secs(30), listener.recv())
        .await
        .expect("an outcome arrives in time")
        .expect("listener stays open")
}

/// Let the paused clock run forward
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Probe queries (questions plus proposed records) among `messages`
pub fn probes(messages: &[Message]) -> Vec<&Message> {
    messages.iter().filter(|m| m.is_probe()).collect()
}

/// Answers of response messages, in send order
pub fn answers(messages: &[Message]) -> Vec<&WireRecord> {
    messages
        .iter()
        .filter(|m| m.is_response())
        .flat_map(|m| m.answers.iter())
        .collect()
}
