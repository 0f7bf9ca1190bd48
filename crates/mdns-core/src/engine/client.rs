//! Client-facing registration API
//!
//! A [`Client`] is obtained from [`Responder::connect`](super::Responder::connect)
//! once the access policy has accepted the caller. Every call validates its
//! input synchronously and returns at once; protocol outcomes arrive later on
//! the listener channel handed back with each registrar or registration.

use super::Shared;
use super::state::{RegistrarId, RegistrationInfo};
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::record::{InterfaceIndex, RecordFlags};
use crate::store::{RecordHandle, RegistrationId};
use crate::wire::DomainName;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Asynchronous outcome of a registration
///
/// Each registration request receives exactly one terminal event, except
/// that a renamed service reports `Registered` again under its new name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// Probing succeeded and the records are announced
    Registered { handle: RecordHandle, name: DomainName },

    /// Probing lost and no rename applies; the registration is gone
    Conflict { handle: RecordHandle, name: DomainName },

    /// The registration ended for another reason
    Failed {
        handle: RecordHandle,
        /// DNS-SD error code
        code: i32,
        message: String,
    },
}

impl RegistrationEvent {
    pub fn handle(&self) -> RecordHandle {
        match self {
            Self::Registered { handle, .. }
            | Self::Conflict { handle, .. }
            | Self::Failed { handle, .. } => *handle,
        }
    }
}

/// Listener channel for registration outcomes
pub type RegistrationEvents = mpsc::UnboundedReceiver<RegistrationEvent>;

/// A connected, authorized client session
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Create a registrar for standalone records
    pub fn create_record_registrar(&self) -> Result<(RecordRegistrar, RegistrationEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.mutate(|state, _| state.create_registrar(tx))?;
        Ok((
            RecordRegistrar {
                shared: self.shared.clone(),
                id,
            },
            rx,
        ))
    }

    /// Register a DNS-SD service (PTR, SRV and TXT records)
    pub fn register_service(
        &self,
        spec: ServiceSpec,
    ) -> Result<(Registration, RegistrationEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (id, name) = self
            .shared
            .mutate(|state, now| state.register_service(&spec, tx, now))?;
        Ok((
            Registration {
                shared: self.shared.clone(),
                id,
                name,
            },
            rx,
        ))
    }

    /// Snapshot of every live registration
    pub fn registrations(&self) -> Vec<RegistrationInfo> {
        self.shared.lock().snapshot()
    }
}

/// Registers standalone records, each in its own registration
pub struct RecordRegistrar {
    shared: Arc<Shared>,
    id: RegistrarId,
}

impl RecordRegistrar {
    /// Register one record
    ///
    /// `flags` must carry exactly one of SHARED or UNIQUE. A `ttl` of zero
    /// selects the default for `rrtype`. Unique records probe first; the
    /// outcome arrives on the registrar's listener.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for bad flags, name, type, class or ttl
    /// - `InvalidState` once the registrar is stopped
    #[allow(clippy::too_many_arguments)]
    pub fn register_record(
        &self,
        flags: RecordFlags,
        interface: InterfaceIndex,
        fullname: &str,
        rrtype: u16,
        rrclass: u16,
        rdata: &[u8],
        ttl: u32,
    ) -> Result<RecordHandle> {
        self.shared.mutate(|state, now| {
            state.register_record(
                self.id,
                flags,
                interface,
                fullname,
                rrtype,
                rrclass,
                rdata.to_vec(),
                ttl,
                now,
            )
        })
    }

    /// Replace the data of a record this registrar owns and re-announce it
    ///
    /// `flags` is reserved. A `ttl` of zero keeps the current TTL.
    pub fn update_record(
        &self,
        handle: &RecordHandle,
        _flags: RecordFlags,
        rdata: &[u8],
        ttl: u32,
    ) -> Result<()> {
        self.shared
            .mutate(|state, now| state.update_standalone(self.id, handle, rdata.to_vec(), ttl, now))
    }

    /// Withdraw a record with goodbyes; the handle is invalid afterwards
    pub fn remove_record(&self, handle: &RecordHandle, _flags: RecordFlags) -> Result<()> {
        self.shared
            .mutate(|state, now| state.remove_standalone(self.id, handle, now))
    }

    /// Withdraw every record of this registrar
    pub fn stop(&self) {
        self.shared.mutate(|state, now| state.stop_registrar(self.id, now));
    }
}

impl Drop for RecordRegistrar {
    fn drop(&mut self) {
        self.shared.mutate(|state, now| {
            state.stop_registrar(self.id, now);
            state.release_registrar(self.id);
        });
    }
}

/// A service registration
pub struct Registration {
    shared: Arc<Shared>,
    id: RegistrationId,
    name: DomainName,
}

impl Registration {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// Current instance name; changes when a conflict forces a rename
    pub fn name(&self) -> DomainName {
        self.shared
            .lock()
            .registration_name(self.id)
            .unwrap_or_else(|_| self.name.clone())
    }

    /// Add a record under the service instance name
    ///
    /// Without SHARED or UNIQUE in `flags` the record is unique. It is
    /// announced once the service's name is verified.
    pub fn add_record(
        &self,
        flags: RecordFlags,
        rrtype: u16,
        rdata: &[u8],
        ttl: u32,
    ) -> Result<RecordHandle> {
        self.shared
            .mutate(|state, now| state.add_record(self.id, flags, rrtype, rdata.to_vec(), ttl, now))
    }

    /// Replace a record's data; `None` targets the TXT record
    pub fn update_record(
        &self,
        handle: Option<&RecordHandle>,
        _flags: RecordFlags,
        rdata: &[u8],
        ttl: u32,
    ) -> Result<()> {
        self.shared
            .mutate(|state, now| state.update_record(self.id, handle, rdata.to_vec(), ttl, now))
    }

    /// Withdraw a record added with [`Registration::add_record`]
    pub fn remove_record(&self, handle: &RecordHandle, _flags: RecordFlags) -> Result<()> {
        self.shared
            .mutate(|state, now| state.remove_record(self.id, handle, now))
    }

    /// Withdraw every record of the service; idempotent
    pub fn stop(&self) {
        let _ = self
            .shared
            .mutate(|state, now| state.stop_registration(self.id, now));
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shared.mutate(|state, now| {
            let _ = state.stop_registration(self.id, now);
            state.release_registration(self.id);
        });
    }
}

/// What to advertise for a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Instance label; empty uses the host label
    pub name: String,
    /// `_service._proto`
    pub service_type: String,
    pub domain: String,
    /// SRV target; `None` uses `<hostname>.local.`
    pub host: Option<String>,
    pub port: u16,
    pub txt: Vec<Vec<u8>>,
    pub interface: InterfaceIndex,
    pub flags: RecordFlags,
}

impl ServiceSpec {
    pub fn new(service_type: impl Into<String>, port: u16) -> Self {
        Self {
            name: String::new(),
            service_type: service_type.into(),
            domain: "local.".to_string(),
            host: None,
            port,
            txt: Vec::new(),
            interface: InterfaceIndex::ANY,
            flags: RecordFlags::NONE,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn txt(mut self, entry: impl Into<Vec<u8>>) -> Self {
        self.txt.push(entry.into());
        self
    }

    pub fn interface(mut self, interface: InterfaceIndex) -> Self {
        self.interface = interface;
        self
    }

    /// Fail with a conflict instead of renaming
    pub fn no_auto_rename(mut self) -> Self {
        self.flags = self.flags | RecordFlags::NO_AUTO_RENAME;
        self
    }
}

impl From<&ServiceConfig> for ServiceSpec {
    fn from(config: &ServiceConfig) -> Self {
        let mut spec = ServiceSpec::new(config.service_type.clone(), config.port)
            .name(config.name.clone())
            .domain(config.domain.clone())
            .interface(InterfaceIndex(config.interface));
        spec.txt = config.txt.iter().map(|entry| entry.clone().into_bytes()).collect();
        if config.no_auto_rename {
            spec = spec.no_auto_rename();
        }
        spec
    }
}
