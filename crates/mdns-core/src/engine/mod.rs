//! Core responder engine
//!
//! The Responder is responsible for:
//! - Probing unique records until they are verified
//! - Announcing verified and shared records
//! - Answering queries and defending records against conflicting answers
//! - Withdrawing records with goodbye packets
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   register/update/remove   ┌──────────────────┐
//! │   Clients    │ ─────────────────────────► │  ResponderState  │
//! └──────────────┘                            └──────────────────┘
//!        ▲                                        │  poll / packets
//!        │ RegistrationEvent                      ▼
//!        │                                 ┌──────────────┐
//!        └──────────────────────────────── │  Responder   │ ◄── Transport::watch()
//!                                          └──────────────┘
//!                                                 │
//!                                                 ▼
//!                                          Transport::send()
//! ```
//!
//! ## Event Flow
//!
//! 1. A client call mutates the state and wakes the engine loop
//! 2. The loop advances every record whose deadline has passed
//! 3. Queued packets are sent outside the state lock
//! 4. Probe delivery results feed back into the state
//! 5. Engine events are emitted for monitoring/logging

pub mod client;
mod state;

pub use client::{
    Client, RecordRegistrar, Registration, RegistrationEvent, RegistrationEvents, ServiceSpec,
};
pub use state::{RegistrationInfo, RegistrationKind};

use crate::config::ResponderConfig;
use crate::error::{Error, Result};
use crate::store::RegistrationId;
use crate::traits::{AccessPolicy, Credentials, Transport, TransportEvent};
use crate::record::InterfaceIndex;
use state::{Outbound, ResponderState};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Events emitted by the Responder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Engine started
    Started {
        interfaces: usize,
    },

    /// A registration was accepted and begins probing or announcing
    RegistrationStarted {
        registration: RegistrationId,
        name: String,
    },

    /// A registration's records are verified and announced
    Registered {
        registration: RegistrationId,
        name: String,
    },

    /// A registration lost its name and was not renamed
    Conflict {
        registration: RegistrationId,
        name: String,
    },

    /// A registration was renamed after a conflict
    Renamed {
        registration: RegistrationId,
        from: String,
        to: String,
    },

    /// The host name lost a conflict; address records and SRV targets moved
    HostRenamed {
        from: String,
        to: String,
    },

    /// A verified record saw a conflicting answer and is probing again
    Reprobing {
        registration: RegistrationId,
        name: String,
    },

    /// A record's data changed
    RecordUpdated {
        registration: RegistrationId,
        name: String,
    },

    /// A registration ended because the network could not be reached
    RegistrationFailed {
        registration: RegistrationId,
        error: String,
    },

    /// A registration's records were withdrawn
    Withdrawn {
        registration: RegistrationId,
        name: String,
        records: usize,
    },

    /// A packet could not be sent on an interface
    SendFailed {
        interface: InterfaceIndex,
        error: String,
    },

    /// An interface became usable
    InterfaceUp {
        index: InterfaceIndex,
    },

    /// An interface went away
    InterfaceDown {
        index: InterfaceIndex,
    },

    /// Engine stopped
    Stopped {
        reason: String,
    },
}

pub(crate) struct Shared {
    state: Mutex<ResponderState>,
    wake: Notify,
    access: Box<dyn AccessPolicy>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ResponderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a client operation and wake the engine loop
    pub(crate) fn mutate<T>(&self, op: impl FnOnce(&mut ResponderState, Instant) -> T) -> T {
        let result = {
            let mut state = self.lock();
            op(&mut state, Instant::now())
        };
        self.wake.notify_one();
        result
    }
}

/// Multicast DNS responder
///
/// The responder owns every registered record and drives the probe,
/// announce and goodbye protocol for them on the transport's interfaces.
///
/// ## Lifecycle
///
/// 1. Create with [`Responder::new()`]
/// 2. Hand out clients with [`Responder::connect()`]
/// 3. Run with [`Responder::run()`] until a shutdown signal is received
/// 4. On shutdown every announced record is withdrawn with goodbyes
///
/// ## Threading
///
/// All protocol work happens on the task that runs the engine. Clients
/// only touch the shared state under a short-lived lock, so they may be
/// used from any task.
pub struct Responder {
    shared: Arc<Shared>,

    /// Transport for sending and receiving packets
    transport: Box<dyn Transport>,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<EngineEvent>,
}

impl Responder {
    /// Create a new responder
    ///
    /// # Parameters
    ///
    /// - `transport`: Transport implementation
    /// - `access`: Policy deciding which clients may connect
    /// - `config`: Responder configuration
    ///
    /// # Returns
    ///
    /// A tuple of (responder, event_receiver) where event_receiver yields engine events
    ///
    /// # Errors
    ///
    /// - `NetworkUnavailable` if the transport reports no interfaces
    pub async fn new(
        transport: Box<dyn Transport>,
        access: Box<dyn AccessPolicy>,
        config: ResponderConfig,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let interfaces = transport.interfaces().await?;
        if interfaces.is_empty() {
            return Err(Error::network_unavailable(format!(
                "transport {} has no usable interfaces",
                transport.transport_name()
            )));
        }

        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);
        let state = ResponderState::new(&config, interfaces)?;

        let responder = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                wake: Notify::new(),
                access,
            }),
            transport,
            event_tx: tx,
        };

        Ok((responder, rx))
    }

    /// Open a client session
    ///
    /// # Errors
    ///
    /// - `PermissionDenied` if the access policy rejects `credentials`
    pub fn connect(&self, credentials: &Credentials) -> Result<Client> {
        self.shared.access.authorize(credentials)?;
        debug!("client {} connected", credentials.principal);
        Ok(Client::new(self.shared.clone()))
    }

    /// Snapshot of every live registration
    pub fn registrations(&self) -> Vec<RegistrationInfo> {
        self.shared.lock().snapshot()
    }

    /// Run the responder
    ///
    /// This method starts the event loop.
    /// It will run continuously until a shutdown signal is received.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: Fatal error
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run with a controlled shutdown signal
    ///
    /// The daemon passes a receiver wired to SIGTERM/SIGINT; tests pass one
    /// they trigger themselves. `None` waits for Ctrl-C.
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        let interfaces = self.shared.lock().interface_count();
        info!(
            "Responder started on {} interface(s) via {}",
            interfaces,
            self.transport.transport_name()
        );
        self.emit_event(EngineEvent::Started { interfaces });

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        let mut packets = self.transport.watch();
        let mut transport_open = true;

        loop {
            self.flush().await;

            let deadline = self.shared.lock().next_deadline();
            let sleep = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }

                event = packets.next(), if transport_open => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        warn!(
                            "Transport {} closed its event stream",
                            self.transport.transport_name()
                        );
                        transport_open = false;
                    }
                },

                _ = sleep => {}

                _ = self.shared.wake.notified() => {}
            }
        }

        self.shutdown().await;
        self.emit_event(EngineEvent::Stopped {
            reason: "Shutdown signal".to_string(),
        });
        Ok(())
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        let now = Instant::now();
        let mut state = self.shared.lock();
        match event {
            TransportEvent::Packet(packet) => state.handle_packet(&packet, now),
            TransportEvent::InterfaceUp(info) => state.interface_up(info, now),
            TransportEvent::InterfaceDown(index) => state.interface_down(index, now),
        }
    }

    /// Advance due records, then send and report everything queued
    async fn flush(&self) {
        let (outbound, events) = {
            let mut state = self.shared.lock();
            state.poll(Instant::now());
            (state.take_pending(), state.take_events())
        };
        for event in events {
            self.emit_event(event);
        }
        self.send_all(outbound).await;
    }

    async fn send_all(&self, outbound: Vec<Outbound>) {
        for out in outbound {
            let delivered = self.send(&out).await;
            if !out.probes.is_empty() {
                let events = {
                    let mut state = self.shared.lock();
                    state.probe_delivery(&out.probes, delivered, Instant::now());
                    state.take_events()
                };
                for event in events {
                    self.emit_event(event);
                }
            }
        }
    }

    /// Send one packet; returns whether any interface accepted it
    async fn send(&self, out: &Outbound) -> bool {
        let packet = match out.message.encode() {
            Ok(packet) => packet,
            Err(e) => {
                error!("Failed to encode packet for {}: {}", out.interface, e);
                return false;
            }
        };

        match self.transport.send(out.interface, &packet).await {
            Ok(report) => {
                for (interface, error) in &report.failed {
                    warn!("Send on {} failed: {}", interface, error);
                    self.emit_event(EngineEvent::SendFailed {
                        interface: *interface,
                        error: error.clone(),
                    });
                }
                report.any_delivered()
            }
            Err(e) => {
                warn!("Send on {} failed: {}", out.interface, e);
                self.emit_event(EngineEvent::SendFailed {
                    interface: out.interface,
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Withdraw everything and send the goodbyes, including the delayed repeats
    async fn shutdown(&self) {
        let (outbound, events) = {
            let mut state = self.shared.lock();
            state.withdraw_all(Instant::now());
            (state.take_pending(), state.take_events())
        };
        for event in events {
            self.emit_event(event);
        }
        self.send_all(outbound).await;

        loop {
            let next = self.shared.lock().next_scheduled();
            let Some(at) = next else { break };
            tokio::time::sleep_until(at).await;
            let outbound = {
                let mut state = self.shared.lock();
                state.release_scheduled(Instant::now());
                state.take_pending()
            };
            self.send_all(outbound).await;
        }
        info!("All records withdrawn, responder stopped");
    }

    /// Emit an engine event
    ///
    /// # Parameters
    ///
    /// - `event`: The event to emit
    fn emit_event(&self, event: EngineEvent) {
        // Send event, logging warning if channel is full (backpressure)
        if self.event_tx.try_send(event).is_err() {
            warn!(
                "Event channel full, dropping event. Consider increasing event_channel_capacity."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_event_clone_eq() {
        let event = EngineEvent::Renamed {
            registration: RegistrationId(1),
            from: "printer._ipp._tcp.local.".to_string(),
            to: "printer (2)._ipp._tcp.local.".to_string(),
        };

        assert_eq!(event.clone(), event);
    }
}
