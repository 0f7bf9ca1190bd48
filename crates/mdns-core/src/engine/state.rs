//! Responder state
//!
//! Everything the engine knows lives in [`ResponderState`]: the record
//! store, the live registrations, the active interfaces and the queue of
//! packets waiting to be sent. It is plain synchronous data behind one
//! mutex; client calls and the engine loop take turns mutating it, so a
//! stopped registration can never be revived by a timer that was already
//! due.
//!
//! Besides client registrations the state advertises the host itself: an
//! address record per interface address plus its reverse-mapping PTR. A
//! host name that loses a conflict moves to `name-2` and takes the SRV
//! records that target it along.

use super::EngineEvent;
use super::client::{RegistrationEvent, ServiceSpec};
use crate::config::ResponderConfig;
use crate::conflict::{
    ProbeKey, ProbeState, ProbeTiming, Step, TieBreak, increment_host_label,
    increment_label_suffix, is_conflicting_answer, tie_break,
};
use crate::error::{Error, Result, codes};
use crate::record::{
    HOST_RECORD_TTL, InterfaceIndex, RecordFlags, RecordKind, ResourceRecord, normalize_rdata,
    rdata, rrclass, rrtype, validate_ttl,
};
use crate::store::{RecordHandle, RecordStore, RegistrationId, StoredRecord};
use crate::traits::{InboundPacket, InterfaceInfo};
use crate::wire::{DomainName, Message, Question, WireRecord};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identifies one record registrar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RegistrarId(pub u64);

/// A packet ready for the transport
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    pub interface: InterfaceIndex,
    pub message: Message,
    /// Records whose probe this message carries
    pub probes: Vec<RecordHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Registrar(RegistrarId),
    Service,
    /// Address records of the host on one interface
    Host(InterfaceIndex),
}

struct RegistrationEntry {
    owner: Owner,
    name: DomainName,
    /// Record whose verification releases the dependent records
    anchor: RecordHandle,
    /// Record targeted by a null-handle update
    primary: RecordHandle,
    /// Service PTR, rewritten on rename
    pointer: Option<RecordHandle>,
    auto_rename: bool,
    /// SRV target is the host name and moves with it
    follows_host: bool,
    reported: bool,
    listener: Option<mpsc::UnboundedSender<RegistrationEvent>>,
    registered_at: DateTime<Utc>,
}

impl RegistrationEntry {
    fn is_core_record(&self, handle: &RecordHandle) -> bool {
        *handle == self.anchor || *handle == self.primary || Some(*handle) == self.pointer
    }

    fn notify(&self, event: RegistrationEvent) {
        let Some(listener) = &self.listener else {
            return;
        };
        if listener.send(event).is_err() {
            debug!("listener for {} is gone", self.name);
        }
    }
}

/// Snapshot of one live registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationInfo {
    pub id: RegistrationId,
    pub name: String,
    pub kind: RegistrationKind,
    pub records: usize,
    pub verified: bool,
    pub registered_at: DateTime<Utc>,
}

/// What created a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationKind {
    Service,
    Record,
    Host,
}

enum Terminal {
    Conflict,
    Failed(Error),
}

pub(crate) struct ResponderState {
    store: RecordStore,
    registrations: HashMap<RegistrationId, RegistrationEntry>,
    /// Service registrations that ended while their handle is still alive;
    /// operations on them are InvalidState
    tombstones: HashSet<RegistrationId>,
    registrars: HashMap<RegistrarId, mpsc::UnboundedSender<RegistrationEvent>>,
    stopped_registrars: HashSet<RegistrarId>,
    next_registration: u64,
    next_registrar: u64,
    host: DomainName,
    interfaces: Vec<InterfaceInfo>,
    timing: ProbeTiming,
    pending: Vec<Outbound>,
    scheduled: Vec<(Instant, Outbound)>,
    events: Vec<EngineEvent>,
    rng: StdRng,
    closed: bool,
}

impl ResponderState {
    pub(crate) fn new(config: &ResponderConfig, interfaces: Vec<InterfaceInfo>) -> Result<Self> {
        let host = DomainName::from_labels([config.hostname.as_bytes(), b"local".as_slice()])
            .map_err(|e| Error::config(format!("invalid hostname: {}", e)))?;

        let mut state = Self {
            store: RecordStore::new(),
            registrations: HashMap::new(),
            tombstones: HashSet::new(),
            registrars: HashMap::new(),
            stopped_registrars: HashSet::new(),
            next_registration: 1,
            next_registrar: 1,
            host,
            interfaces: Vec::new(),
            timing: config.engine.timing(),
            pending: Vec::new(),
            scheduled: Vec::new(),
            events: Vec::new(),
            rng: StdRng::from_os_rng(),
            closed: false,
        };
        let now = Instant::now();
        for info in interfaces {
            state.advertise_host(&info, now);
            state.interfaces.push(info);
        }
        Ok(state)
    }


    pub(crate) fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state("responder has shut down"));
        }
        Ok(())
    }

    fn initial_delay(&mut self) -> Duration {
        let max = self.timing.max_initial_delay.as_millis() as u64;
        if max == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.random_range(0..=max))
        }
    }

    fn allocate_registration(&mut self) -> RegistrationId {
        let id = RegistrationId(self.next_registration);
        self.next_registration += 1;
        id
    }

    fn live(&self, registration: RegistrationId) -> Result<&RegistrationEntry> {
        if self.tombstones.contains(&registration) {
            return Err(Error::invalid_state(format!(
                "registration {} has been stopped",
                registration
            )));
        }
        self.registrations
            .get(&registration)
            .ok_or_else(|| Error::not_found(format!("registration {}", registration)))
    }

    // ---------------------------------------------------------------------
    // Client operations
    // ---------------------------------------------------------------------

    pub(crate) fn create_registrar(
        &mut self,
        listener: mpsc::UnboundedSender<RegistrationEvent>,
    ) -> Result<RegistrarId> {
        self.ensure_open()?;
        let id = RegistrarId(self.next_registrar);
        self.next_registrar += 1;
        self.registrars.insert(id, listener);
        Ok(id)
    }

    fn check_registrar(&self, registrar: RegistrarId) -> Result<()> {
        self.ensure_open()?;
        if self.stopped_registrars.contains(&registrar) {
            return Err(Error::invalid_state("record registrar has been stopped"));
        }
        if !self.registrars.contains_key(&registrar) {
            return Err(Error::not_found("unknown record registrar"));
        }
        Ok(())
    }

    /// Resolve a standalone record handle owned by `registrar`
    fn owned_by_registrar(&self, registrar: RegistrarId, handle: &RecordHandle) -> Result<()> {
        self.check_registrar(registrar)?;
        self.store.get(handle)?;
        match self.registrations.get(&handle.registration()) {
            Some(entry) if entry.owner == Owner::Registrar(registrar) => Ok(()),
            _ => Err(Error::not_found(format!(
                "record {} does not belong to this registrar",
                handle
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn register_record(
        &mut self,
        registrar: RegistrarId,
        flags: RecordFlags,
        interface: InterfaceIndex,
        fullname: &str,
        rrtype: u16,
        rrclass: u16,
        rdata: Vec<u8>,
        ttl: u32,
        now: Instant,
    ) -> Result<RecordHandle> {
        self.check_registrar(registrar)?;
        let kind = flags.kind()?;
        let name = DomainName::parse(fullname)?;
        let record =
            ResourceRecord::new(name.clone(), rrtype, rrclass, rdata, ttl, kind, interface)?;

        let listener = self
            .registrars
            .get(&registrar)
            .cloned()
            .ok_or_else(|| Error::not_found("unknown record registrar"))?;

        let probe = match kind {
            RecordKind::Unique => {
                let delay = self.initial_delay();
                ProbeState::unique(now + delay)
            }
            RecordKind::Shared => ProbeState::shared(now, &self.timing),
        };

        let id = self.allocate_registration();
        let handle = self.store.put(StoredRecord::new(id, record, probe));
        self.registrations.insert(
            id,
            RegistrationEntry {
                owner: Owner::Registrar(registrar),
                name: name.clone(),
                anchor: handle,
                primary: handle,
                pointer: None,
                auto_rename: false,
                follows_host: false,
                reported: false,
                listener: Some(listener),
                registered_at: Utc::now(),
            },
        );

        debug!(
            "registered {:?} record {} type {} as {}",
            kind, name, rrtype, handle
        );
        self.events.push(EngineEvent::RegistrationStarted {
            registration: id,
            name: name.to_string(),
        });
        Ok(handle)
    }

    pub(crate) fn update_standalone(
        &mut self,
        registrar: RegistrarId,
        handle: &RecordHandle,
        rdata: Vec<u8>,
        ttl: u32,
        now: Instant,
    ) -> Result<()> {
        self.owned_by_registrar(registrar, handle)?;
        self.update_record(handle.registration(), Some(handle), rdata, ttl, now)
    }

    pub(crate) fn remove_standalone(
        &mut self,
        registrar: RegistrarId,
        handle: &RecordHandle,
        now: Instant,
    ) -> Result<()> {
        self.owned_by_registrar(registrar, handle)?;
        // A standalone registration owns exactly this record
        self.stop_registration(handle.registration(), now)
    }

    pub(crate) fn stop_registrar(&mut self, registrar: RegistrarId, now: Instant) {
        if !self.stopped_registrars.insert(registrar) {
            return;
        }
        self.registrars.remove(&registrar);
        let owned: Vec<RegistrationId> = self
            .registrations
            .iter()
            .filter(|(_, e)| e.owner == Owner::Registrar(registrar))
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            let _ = self.stop_registration(id, now);
        }
    }

    pub(crate) fn register_service(
        &mut self,
        spec: &ServiceSpec,
        listener: mpsc::UnboundedSender<RegistrationEvent>,
        now: Instant,
    ) -> Result<(RegistrationId, DomainName)> {
        self.ensure_open()?;

        let service_type = DomainName::parse(&format!(
            "{}.{}",
            spec.service_type.trim_end_matches('.'),
            spec.domain
        ))?;
        if !service_type
            .first_label()
            .is_some_and(|label| label.starts_with(b"_"))
        {
            return Err(Error::invalid_argument(format!(
                "service type '{}' must start with an underscore label",
                spec.service_type
            )));
        }

        let label = if spec.name.is_empty() {
            self.host.first_label().map(<[u8]>::to_vec).unwrap_or_default()
        } else {
            spec.name.as_bytes().to_vec()
        };
        let instance = service_type.prepend(label)?;
        let target = match &spec.host {
            Some(host) => DomainName::parse(host)?,
            None => self.host.clone(),
        };

        let pointer = ResourceRecord::new(
            service_type.clone(),
            rrtype::PTR,
            rrclass::IN,
            rdata::ptr(&instance),
            0,
            RecordKind::Shared,
            spec.interface,
        )?;
        let service = ResourceRecord::new(
            instance.clone(),
            rrtype::SRV,
            rrclass::IN,
            rdata::srv(0, 0, spec.port, &target),
            0,
            RecordKind::Unique,
            spec.interface,
        )?;
        let text = ResourceRecord::new(
            instance.clone(),
            rrtype::TXT,
            rrclass::IN,
            rdata::txt(&spec.txt)?,
            0,
            RecordKind::Unique,
            spec.interface,
        )?;

        let id = self.allocate_registration();
        let delay = self.initial_delay();
        let anchor = self
            .store
            .put(StoredRecord::new(id, service, ProbeState::unique(now + delay)));
        let primary = self
            .store
            .put(StoredRecord::new(id, text, ProbeState::awaiting_anchor()).dependent());
        let pointer = self
            .store
            .put(StoredRecord::new(id, pointer, ProbeState::awaiting_anchor()).dependent());

        self.registrations.insert(
            id,
            RegistrationEntry {
                owner: Owner::Service,
                name: instance.clone(),
                anchor,
                primary,
                pointer: Some(pointer),
                auto_rename: !spec.flags.contains(RecordFlags::NO_AUTO_RENAME),
                follows_host: spec.host.is_none(),
                reported: false,
                listener: Some(listener),
                registered_at: Utc::now(),
            },
        );

        info!("registering service {} on {}", instance, spec.interface);
        self.events.push(EngineEvent::RegistrationStarted {
            registration: id,
            name: instance.to_string(),
        });
        Ok((id, instance))
    }

    pub(crate) fn add_record(
        &mut self,
        registration: RegistrationId,
        flags: RecordFlags,
        rrtype: u16,
        rdata: Vec<u8>,
        ttl: u32,
        now: Instant,
    ) -> Result<RecordHandle> {
        self.ensure_open()?;
        let entry = self.live(registration)?;
        let kind = flags.kind_or(RecordKind::Unique)?;
        let anchor = self.store.get(&entry.anchor)?;
        let record = ResourceRecord::new(
            entry.name.clone(),
            rrtype,
            rrclass::IN,
            rdata,
            ttl,
            kind,
            anchor.record.interface,
        )?;

        let probe = if anchor.probe.is_verified() {
            ProbeState::shared(now, &self.timing)
        } else {
            ProbeState::awaiting_anchor()
        };
        let handle = self
            .store
            .put(StoredRecord::new(registration, record, probe).dependent());
        debug!("added record type {} to {} as {}", rrtype, registration, handle);
        Ok(handle)
    }

    pub(crate) fn update_record(
        &mut self,
        registration: RegistrationId,
        handle: Option<&RecordHandle>,
        rdata: Vec<u8>,
        ttl: u32,
        now: Instant,
    ) -> Result<()> {
        self.ensure_open()?;
        let entry = self.live(registration)?;
        let handle = handle.copied().unwrap_or(entry.primary);
        if handle.registration() != registration {
            return Err(Error::not_found(format!(
                "record {} does not belong to {}",
                handle, registration
            )));
        }
        validate_ttl(ttl)?;

        let timing = self.timing.clone();
        let stored = self.store.get_mut(&handle)?;
        let rdata = normalize_rdata(stored.record.rrtype, rdata)?;
        let previous = stored.record.clone();

        stored.record.rdata = rdata;
        if ttl != 0 {
            stored.record.ttl = ttl;
        }
        if stored.probe.is_verified() {
            stored.probe.start_announcing(now, &timing);
        }
        let withdraw_old = stored.announced
            && !previous.is_unique()
            && previous.rdata != stored.record.rdata;

        if withdraw_old {
            self.queue_goodbyes(vec![previous], now);
        }
        let name = self.registration_name(registration)?.to_string();
        self.events.push(EngineEvent::RecordUpdated { registration, name });
        Ok(())
    }

    pub(crate) fn remove_record(
        &mut self,
        registration: RegistrationId,
        handle: &RecordHandle,
        now: Instant,
    ) -> Result<()> {
        self.ensure_open()?;
        let entry = self.live(registration)?;
        if handle.registration() != registration {
            return Err(Error::not_found(format!(
                "record {} does not belong to {}",
                handle, registration
            )));
        }
        if entry.is_core_record(handle) {
            return Err(Error::invalid_argument(
                "the service's own records cannot be removed; stop the registration instead",
            ));
        }

        let removed = self.store.remove(handle)?;
        if removed.announced {
            self.queue_goodbyes(vec![removed.record], now);
        }
        debug!("removed record {}", handle);
        Ok(())
    }

    /// Withdraw every record of a registration and invalidate its handles
    ///
    /// Stopping a service twice is a no-op. A stopped standalone record is
    /// simply gone; its handle fails the store's generation check.
    pub(crate) fn stop_registration(
        &mut self,
        registration: RegistrationId,
        now: Instant,
    ) -> Result<()> {
        if self.tombstones.contains(&registration) {
            return Ok(());
        }
        let entry = self
            .withdraw(registration, true, now)
            .ok_or_else(|| Error::not_found(format!("registration {}", registration)))?;
        if entry.owner == Owner::Service {
            self.tombstones.insert(registration);
        }
        Ok(())
    }

    /// Forget a service registration whose handle is gone
    pub(crate) fn release_registration(&mut self, registration: RegistrationId) {
        self.tombstones.remove(&registration);
    }

    /// Forget a record registrar whose handle is gone
    pub(crate) fn release_registrar(&mut self, registrar: RegistrarId) {
        self.stopped_registrars.remove(&registrar);
    }

    fn withdraw(
        &mut self,
        registration: RegistrationId,
        send_goodbyes: bool,
        now: Instant,
    ) -> Option<RegistrationEntry> {
        let entry = self.registrations.remove(&registration)?;

        let mut goodbyes = Vec::new();
        let handles = self.store.list_by_registration(registration);
        let count = handles.len();
        for handle in handles {
            if let Ok(removed) = self.store.remove(&handle) {
                if removed.announced && send_goodbyes {
                    goodbyes.push(removed.record);
                }
            }
        }
        self.queue_goodbyes(goodbyes, now);

        info!("withdrew {} ({} records)", entry.name, count);
        self.events.push(EngineEvent::Withdrawn {
            registration,
            name: entry.name.to_string(),
            records: count,
        });
        Some(entry)
    }

    pub(crate) fn registration_name(&self, registration: RegistrationId) -> Result<DomainName> {
        Ok(self.live(registration)?.name.clone())
    }

    pub(crate) fn snapshot(&self) -> Vec<RegistrationInfo> {
        let mut infos: Vec<RegistrationInfo> = self
            .registrations
            .iter()
            .map(|(id, entry)| RegistrationInfo {
                id: *id,
                name: entry.name.to_string(),
                kind: match entry.owner {
                    Owner::Service => RegistrationKind::Service,
                    Owner::Registrar(_) => RegistrationKind::Record,
                    Owner::Host(_) => RegistrationKind::Host,
                },
                records: self.store.list_by_registration(*id).len(),
                verified: self
                    .store
                    .get(&entry.anchor)
                    .map(|s| s.probe.is_verified())
                    .unwrap_or(false),
                registered_at: entry.registered_at,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    // ---------------------------------------------------------------------
    // Host address records
    // ---------------------------------------------------------------------

    fn advertise_host(&mut self, info: &InterfaceInfo, now: Instant) {
        if info.addresses.is_empty() || self.closed {
            return;
        }
        if let Err(e) = self.register_host(info, now) {
            warn!("cannot advertise {} on {}: {}", self.host, info.name, e);
        }
    }

    /// One registration per interface: the first address record is probed,
    /// the other addresses and every reverse-mapping PTR follow it
    fn register_host(&mut self, info: &InterfaceInfo, now: Instant) -> Result<()> {
        let mut records = Vec::with_capacity(info.addresses.len() * 2);
        for addr in &info.addresses {
            let (kind, data) = rdata::address(*addr);
            records.push(ResourceRecord::new(
                self.host.clone(),
                kind,
                rrclass::IN,
                data,
                HOST_RECORD_TTL,
                RecordKind::Unique,
                info.index,
            )?);
        }
        for addr in &info.addresses {
            records.push(ResourceRecord::new(
                DomainName::reverse_lookup(*addr),
                rrtype::PTR,
                rrclass::IN,
                rdata::ptr(&self.host),
                HOST_RECORD_TTL,
                RecordKind::Unique,
                info.index,
            )?);
        }

        let id = self.allocate_registration();
        let delay = self.initial_delay();
        let mut records = records.into_iter();
        let Some(first) = records.next() else {
            return Ok(());
        };
        let anchor = self
            .store
            .put(StoredRecord::new(id, first, ProbeState::unique(now + delay)));
        for record in records {
            self.store
                .put(StoredRecord::new(id, record, ProbeState::awaiting_anchor()).dependent());
        }

        self.registrations.insert(
            id,
            RegistrationEntry {
                owner: Owner::Host(info.index),
                name: self.host.clone(),
                anchor,
                primary: anchor,
                pointer: None,
                auto_rename: true,
                follows_host: false,
                reported: false,
                listener: None,
                registered_at: Utc::now(),
            },
        );
        debug!(
            "advertising {} on {} ({} addresses)",
            self.host,
            info.name,
            info.addresses.len()
        );
        self.events.push(EngineEvent::RegistrationStarted {
            registration: id,
            name: self.host.to_string(),
        });
        Ok(())
    }

    fn host_registrations(&self, index: Option<InterfaceIndex>) -> Vec<RegistrationId> {
        self.registrations
            .iter()
            .filter(|(_, e)| match e.owner {
                Owner::Host(on) => index.is_none_or(|index| index == on),
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Move every host record, and every SRV that targets the host, to the
    /// next host name
    fn rename_host(&mut self, now: Instant) -> Result<()> {
        let old = self.host.clone();
        let label = old
            .first_label()
            .ok_or_else(|| Error::invalid_argument("host name is the root"))?;
        let renamed = old.with_first_label(increment_host_label(label, &mut self.rng))?;
        self.host = renamed.clone();

        for id in self.host_registrations(None) {
            self.withdraw(id, true, now);
        }
        for info in self.interfaces.clone() {
            self.advertise_host(&info, now);
        }

        let followers: Vec<RecordHandle> = self
            .registrations
            .values()
            .filter(|e| e.follows_host)
            .map(|e| e.anchor)
            .collect();
        for handle in followers {
            let Ok(stored) = self.store.get_mut(&handle) else {
                continue;
            };
            let Some(fixed) = stored.record.rdata.get(..6) else {
                continue;
            };
            let priority = u16::from_be_bytes([fixed[0], fixed[1]]);
            let weight = u16::from_be_bytes([fixed[2], fixed[3]]);
            let port = u16::from_be_bytes([fixed[4], fixed[5]]);
            stored.record.rdata = rdata::srv(priority, weight, port, &renamed);
            if stored.probe.is_verified() {
                stored.probe.start_announcing(now, &self.timing);
            }
        }

        warn!("host name conflict: renamed {} to {}", old, renamed);
        self.events.push(EngineEvent::HostRenamed {
            from: old.to_string(),
            to: renamed.to_string(),
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    /// Earliest instant at which [`ResponderState::poll`] has work to do
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let records = self.store.iter().filter_map(|(_, e)| e.probe.next_at);
        let sends = self.scheduled.iter().map(|(at, _)| *at);
        records.chain(sends).min()
    }

    pub(crate) fn next_scheduled(&self) -> Option<Instant> {
        self.scheduled.iter().map(|(at, _)| *at).min()
    }

    /// Move delayed sends that are due into the pending queue
    pub(crate) fn release_scheduled(&mut self, now: Instant) {
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.scheduled)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.scheduled = later;
        self.pending.extend(due.into_iter().map(|(_, out)| out));
    }

    /// Advance every record whose deadline has passed
    pub(crate) fn poll(&mut self, now: Instant) {
        self.release_scheduled(now);

        let mut probes: Vec<(RecordHandle, bool)> = Vec::new();
        let mut announcements: Vec<RecordHandle> = Vec::new();

        // A second pass picks up dependents released by a verification
        for _ in 0..2 {
            let due: Vec<RecordHandle> = self
                .store
                .iter()
                .filter(|(_, e)| e.probe.is_due(now))
                .map(|(h, _)| h)
                .collect();
            if due.is_empty() {
                break;
            }

            for handle in due {
                let step = match self.store.get_mut(&handle) {
                    Ok(stored) => stored.probe.advance(now, &self.timing),
                    // Ended by an earlier conflict in this pass
                    Err(_) => continue,
                };
                match step {
                    Step::Probe { first } => {
                        if first && self.held_locally(&handle) {
                            debug!("{} is already claimed locally", handle);
                            self.conflict(handle.registration(), now);
                            continue;
                        }
                        probes.push((handle, first));
                    }
                    Step::Verified => {
                        announcements.push(handle);
                        self.release_dependents(&handle, now);
                    }
                    Step::Announce => announcements.push(handle),
                    Step::Idle => {}
                }
            }
        }

        self.build_probes(&probes);
        self.build_announcements(&announcements);
        for handle in &announcements {
            self.report_registered(handle);
        }
    }

    /// Another live registration already probes or owns this record's name
    /// with different data
    fn held_locally(&self, handle: &RecordHandle) -> bool {
        let Ok(ours) = self.store.get(handle) else {
            return false;
        };
        if !ours.record.is_unique() {
            return false;
        }
        self.store.iter().any(|(other, theirs)| {
            other.registration() != handle.registration()
                && theirs.record.name == ours.record.name
                && theirs.record.rrtype == ours.record.rrtype
                && theirs.record.rrclass == ours.record.rrclass
                && theirs.record.interface.covers(ours.record.interface)
                && theirs.record.rdata != ours.record.rdata
                && matches!(
                    theirs.probe.phase,
                    crate::conflict::Phase::Probing | crate::conflict::Phase::Announced
                )
        })
    }

    fn release_dependents(&mut self, anchor: &RecordHandle, now: Instant) {
        let registration = anchor.registration();
        match self.registrations.get(&registration) {
            Some(entry) if entry.anchor == *anchor => {}
            _ => return,
        }
        for handle in self.store.list_by_registration(registration) {
            if let Ok(stored) = self.store.get_mut(&handle) {
                if stored.dependent && stored.probe.is_probing() && stored.probe.next_at.is_none() {
                    stored.probe.start_announcing(now, &self.timing);
                }
            }
        }
    }

    fn report_registered(&mut self, handle: &RecordHandle) {
        let registration = handle.registration();
        let Some(entry) = self.registrations.get_mut(&registration) else {
            return;
        };
        if entry.anchor != *handle || entry.reported {
            return;
        }
        entry.reported = true;
        info!("registered {}", entry.name);
        entry.notify(RegistrationEvent::Registered {
            handle: entry.primary,
            name: entry.name.clone(),
        });
        self.events.push(EngineEvent::Registered {
            registration,
            name: entry.name.to_string(),
        });
    }

    fn build_probes(&mut self, probes: &[(RecordHandle, bool)]) {
        let mut groups: BTreeMap<(InterfaceIndex, DomainName), (bool, Vec<RecordHandle>)> =
            BTreeMap::new();
        for (handle, first) in probes {
            let Ok(stored) = self.store.get(handle) else {
                continue;
            };
            let key = (stored.record.interface, stored.record.name.clone());
            let group = groups.entry(key).or_insert((false, Vec::new()));
            group.0 |= *first;
            group.1.push(*handle);
        }

        for ((interface, name), (first, handles)) in groups {
            let mut message = Message::query();
            let mut question = Question::new(name, rrtype::ANY, rrclass::IN);
            question.unicast_response = first;
            message.questions.push(question);
            for handle in &handles {
                if let Ok(stored) = self.store.get(handle) {
                    let mut proposed = stored.record.to_wire(stored.record.ttl);
                    proposed.cache_flush = false;
                    message.authorities.push(proposed);
                }
            }
            self.pending.push(Outbound {
                interface,
                message,
                probes: handles,
            });
        }
    }

    fn build_announcements(&mut self, handles: &[RecordHandle]) {
        let mut groups: BTreeMap<InterfaceIndex, Vec<WireRecord>> = BTreeMap::new();
        for handle in handles {
            let Ok(stored) = self.store.get_mut(handle) else {
                continue;
            };
            stored.announced = true;
            let wire = stored.record.to_wire(stored.record.ttl);
            groups.entry(stored.record.interface).or_default().push(wire);
        }
        for (interface, answers) in groups {
            let mut message = Message::response();
            message.answers = answers;
            self.pending.push(Outbound {
                interface,
                message,
                probes: Vec::new(),
            });
        }
    }

    /// Queue goodbyes (ttl 0): one now, the rest spaced by the goodbye interval
    fn queue_goodbyes(&mut self, records: Vec<ResourceRecord>, now: Instant) {
        if records.is_empty() {
            return;
        }
        let mut groups: BTreeMap<InterfaceIndex, Vec<WireRecord>> = BTreeMap::new();
        for record in &records {
            groups
                .entry(record.interface)
                .or_default()
                .push(record.to_wire(0));
        }
        for (interface, answers) in groups {
            let mut message = Message::response();
            message.answers = answers;
            let outbound = Outbound {
                interface,
                message,
                probes: Vec::new(),
            };
            for i in 1..self.timing.goodbye_count {
                let at = now + self.timing.goodbye_interval * i as u32;
                self.scheduled.push((at, outbound.clone()));
            }
            self.pending.push(outbound);
        }
    }

    /// Record the transport's verdict on a probe
    pub(crate) fn probe_delivery(
        &mut self,
        handles: &[RecordHandle],
        delivered: bool,
        now: Instant,
    ) {
        let mut exhausted = Vec::new();
        for handle in handles {
            let Ok(stored) = self.store.get_mut(handle) else {
                continue;
            };
            if delivered {
                stored.probe.send_succeeded();
            } else if stored.probe.probe_send_failed(now, &self.timing) {
                exhausted.push(handle.registration());
            }
        }
        exhausted.dedup();
        for registration in exhausted {
            let attempts = self.timing.max_send_failures;
            self.terminate(
                registration,
                Terminal::Failed(Error::network_unavailable(format!(
                    "probe reached no interface after {} attempts",
                    attempts
                ))),
                now,
            );
        }
    }

    // ---------------------------------------------------------------------
    // Incoming packets
    // ---------------------------------------------------------------------

    pub(crate) fn handle_packet(&mut self, packet: &InboundPacket, now: Instant) {
        let message = match Message::decode(&packet.data) {
            Ok(message) => message,
            Err(e) => {
                debug!("ignoring packet from {}: {}", packet.source, e);
                return;
            }
        };
        if message.is_response() {
            self.handle_response(&message, packet.interface, now);
        } else {
            self.handle_query(&message, packet.interface, now);
        }
    }

    fn handle_response(&mut self, message: &Message, interface: InterfaceIndex, now: Instant) {
        let mut targets: Vec<RecordHandle> = Vec::new();
        for answer in message.answers.iter().chain(&message.additionals) {
            if self.held_by_us(answer) {
                continue;
            }
            for (handle, stored) in self.store.iter() {
                if stored.probe.is_terminal()
                    || !stored.record.interface.covers(interface)
                    || !is_conflicting_answer(&stored.record, answer)
                {
                    continue;
                }
                // Conflicts on dependent records belong to the anchor
                let target = if stored.dependent {
                    match self.registrations.get(&handle.registration()) {
                        Some(entry) => entry.anchor,
                        None => continue,
                    }
                } else {
                    handle
                };
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }

        for target in targets {
            let Ok(stored) = self.store.get_mut(&target) else {
                continue;
            };
            if stored.probe.is_verified() {
                warn!(
                    "conflicting answer for announced record {}, probing again",
                    stored.record.name
                );
                stored.probe.restart_probing(now);
                let name = stored.record.name.to_string();
                self.events.push(EngineEvent::Reprobing {
                    registration: target.registration(),
                    name,
                });
            } else if stored.probe.is_probing() {
                self.conflict(target.registration(), now);
            }
        }
    }

    /// One of our live records carries exactly this data
    fn held_by_us(&self, wire: &WireRecord) -> bool {
        self.store.iter().any(|(_, stored)| {
            !stored.probe.is_terminal()
                && stored.record.same_rrset(wire)
                && stored.record.rdata == wire.rdata
        })
    }

    fn handle_query(&mut self, message: &Message, interface: InterfaceIndex, now: Instant) {
        if message.is_probe() {
            self.resolve_simultaneous_probe(message, interface, now);
        }

        let mut answers: Vec<WireRecord> = Vec::new();
        for question in &message.questions {
            for (_, stored) in self.store.iter() {
                let record = &stored.record;
                if !stored.probe.is_verified()
                    || !record.interface.covers(interface)
                    || !question.matches(&record.name, record.rrtype, record.rrclass)
                {
                    continue;
                }
                let known = message.answers.iter().any(|known| {
                    record.same_rrset(known)
                        && known.rdata == record.rdata
                        && known.ttl >= record.ttl / 2
                });
                if known {
                    continue;
                }
                let wire = record.to_wire(record.ttl);
                if !answers.contains(&wire) {
                    answers.push(wire);
                }
            }
        }

        if !answers.is_empty() {
            let mut response = Message::response();
            response.answers = answers;
            self.pending.push(Outbound {
                interface,
                message: response,
                probes: Vec::new(),
            });
        }
    }

    fn resolve_simultaneous_probe(
        &mut self,
        message: &Message,
        interface: InterfaceIndex,
        now: Instant,
    ) {
        let mut losers: Vec<RegistrationId> = Vec::new();
        for question in &message.questions {
            let theirs: Vec<&WireRecord> = message
                .authorities
                .iter()
                .filter(|rr| rr.name == question.name)
                .collect();
            // Our own probe, looped back or heard on another interface
            if theirs.is_empty() || theirs.iter().all(|rr| self.held_by_us(rr)) {
                continue;
            }

            let ours: Vec<(RecordHandle, &StoredRecord)> = self
                .store
                .iter()
                .filter(|(_, s)| {
                    !s.dependent
                        && s.record.is_unique()
                        && s.probe.is_probing()
                        && s.probe.next_at.is_some()
                        && s.record.name == question.name
                        && s.record.interface.covers(interface)
                })
                .collect();
            if ours.is_empty() {
                continue;
            }

            let outcome = tie_break(
                ours.iter().map(|(_, s)| ProbeKey::from(&s.record)),
                theirs.iter().map(|rr| ProbeKey::from(*rr)),
            );
            debug!("simultaneous probe for {}: {:?}", question.name, outcome);
            if outcome == TieBreak::Lost {
                for (handle, _) in &ours {
                    if !losers.contains(&handle.registration()) {
                        losers.push(handle.registration());
                    }
                }
            }
        }

        for registration in losers {
            self.conflict(registration, now);
        }
    }

    // ---------------------------------------------------------------------
    // Conflict outcomes
    // ---------------------------------------------------------------------

    fn conflict(&mut self, registration: RegistrationId, now: Instant) {
        let Some(entry) = self.registrations.get(&registration) else {
            return;
        };
        if let Owner::Host(_) = entry.owner {
            if let Err(e) = self.rename_host(now) {
                warn!("cannot rename host {}: {}", self.host, e);
                self.terminate(registration, Terminal::Conflict, now);
            }
            return;
        }
        if entry.auto_rename {
            match self.rename(registration, now) {
                Ok(()) => return,
                Err(e) => warn!(
                    "cannot rename {}: {}",
                    entry_name(&self.registrations, registration),
                    e
                ),
            }
        }
        self.terminate(registration, Terminal::Conflict, now);
    }

    fn rename(&mut self, registration: RegistrationId, now: Instant) -> Result<()> {
        let entry = self
            .registrations
            .get(&registration)
            .ok_or_else(|| Error::not_found(format!("registration {}", registration)))?;
        let old = entry.name.clone();
        let (anchor, pointer) = (entry.anchor, entry.pointer);
        let label = old
            .first_label()
            .ok_or_else(|| Error::invalid_argument("cannot rename the root"))?;
        let renamed = old.with_first_label(increment_label_suffix(label, &mut self.rng))?;

        let mut goodbyes = Vec::new();
        for handle in self.store.list_by_registration(registration) {
            let Ok(stored) = self.store.get_mut(&handle) else {
                continue;
            };
            if Some(handle) == pointer {
                if stored.announced {
                    goodbyes.push(stored.record.clone());
                }
                stored.record.rdata = rdata::ptr(&renamed);
                stored.probe = ProbeState::awaiting_anchor();
                stored.announced = false;
            } else if stored.record.name == old {
                stored.record.name = renamed.clone();
                stored.announced = false;
                stored.probe = if handle == anchor {
                    ProbeState::unique(now)
                } else {
                    ProbeState::awaiting_anchor()
                };
            }
        }
        self.queue_goodbyes(goodbyes, now);

        if let Some(entry) = self.registrations.get_mut(&registration) {
            entry.name = renamed.clone();
            entry.reported = false;
        }
        info!("name conflict: renamed {} to {}", old, renamed);
        self.events.push(EngineEvent::Renamed {
            registration,
            from: old.to_string(),
            to: renamed.to_string(),
        });
        Ok(())
    }

    /// End a registration without the caller asking for it
    fn terminate(&mut self, registration: RegistrationId, outcome: Terminal, now: Instant) {
        let Some(entry) = self.registrations.remove(&registration) else {
            return;
        };
        if entry.owner == Owner::Service {
            self.tombstones.insert(registration);
        }

        // Shared records we announced still point at us; unique ones now
        // belong to someone else
        let mut goodbyes = Vec::new();
        for handle in self.store.list_by_registration(registration) {
            if let Ok(mut removed) = self.store.remove(&handle) {
                removed.probe.mark_conflict();
                if removed.announced && !removed.record.is_unique() {
                    goodbyes.push(removed.record);
                }
            }
        }
        self.queue_goodbyes(goodbyes, now);

        match outcome {
            Terminal::Conflict => {
                warn!("name conflict for {}", entry.name);
                entry.notify(RegistrationEvent::Conflict {
                    handle: entry.primary,
                    name: entry.name.clone(),
                });
                self.events.push(EngineEvent::Conflict {
                    registration,
                    name: entry.name.to_string(),
                });
            }
            Terminal::Failed(error) => {
                warn!("registration {} failed: {}", entry.name, error);
                self.events.push(EngineEvent::RegistrationFailed {
                    registration,
                    error: error.to_string(),
                });
                entry.notify(RegistrationEvent::Failed {
                    handle: entry.primary,
                    code: error.code(),
                    message: error.to_string(),
                });
            }
        }
    }

    // ---------------------------------------------------------------------
    // Interfaces
    // ---------------------------------------------------------------------

    pub(crate) fn interface_up(&mut self, info: InterfaceInfo, now: Instant) {
        let index = info.index;
        self.interfaces.retain(|i| i.index != index);
        info!("interface {} ({}) is up", info.name, index);
        // Addresses may have changed; the records are built afresh below
        for id in self.host_registrations(Some(index)) {
            self.withdraw(id, false, now);
        }

        for handle in self.store.handles() {
            let delay = self.initial_delay();
            let Ok(stored) = self.store.get_mut(&handle) else {
                continue;
            };
            if !stored.record.interface.covers(index) || stored.probe.is_terminal() {
                continue;
            }
            if stored.dependent {
                stored.probe = ProbeState::awaiting_anchor();
            } else if stored.record.is_unique() {
                stored.probe.restart_probing(now + delay);
            } else {
                stored.probe.start_announcing(now, &self.timing);
            }
        }
        self.advertise_host(&info, now);
        self.interfaces.push(info);
        self.events.push(EngineEvent::InterfaceUp { index });
    }

    pub(crate) fn interface_down(&mut self, index: InterfaceIndex, now: Instant) {
        self.interfaces.retain(|i| i.index != index);
        info!("interface {} is down", index);
        // No goodbyes: the link they would go out on is gone
        for id in self.host_registrations(Some(index)) {
            self.withdraw(id, false, now);
        }

        for handle in self.store.handles() {
            if let Ok(stored) = self.store.get_mut(&handle) {
                if stored.record.interface == index {
                    stored.probe.pause();
                }
            }
        }
        self.events.push(EngineEvent::InterfaceDown { index });
    }

    // ---------------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------------

    /// Withdraw every registration and refuse further client calls
    pub(crate) fn withdraw_all(&mut self, now: Instant) {
        self.closed = true;
        let ids: Vec<RegistrationId> = self.registrations.keys().copied().collect();
        for id in ids {
            if let Some(entry) = self.registrations.get(&id) {
                if !entry.reported {
                    entry.notify(RegistrationEvent::Failed {
                        handle: entry.primary,
                        code: codes::NOT_INITIALIZED,
                        message: "responder shut down before registration completed".to_string(),
                    });
                }
            }
            let _ = self.stop_registration(id, now);
        }
        self.registrars.clear();
    }

    pub(crate) fn take_pending(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }
}

fn entry_name(
    registrations: &HashMap<RegistrationId, RegistrationEntry>,
    id: RegistrationId,
) -> String {
    registrations
        .get(&id)
        .map(|e| e.name.to_string())
        .unwrap_or_else(|| id.to_string())
}
