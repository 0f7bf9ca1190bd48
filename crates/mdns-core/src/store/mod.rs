//! Record store
//!
//! An arena of records keyed by owning registration. Handles are indices
//! with a generation counter; removing a record bumps the slot generation,
//! so a stale handle keeps failing with `NotFound` even after its slot has
//! been reused.

use crate::conflict::ProbeState;
use crate::error::{Error, Result};
use crate::record::ResourceRecord;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one registration (a service or a standalone record)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// Caller-visible reference to a record
///
/// A handle does not own its record. It stops resolving once the record is
/// removed or its registration is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle {
    registration: RegistrationId,
    index: u32,
    generation: u32,
}

impl RecordHandle {
    /// The registration that owns this record
    pub fn registration(&self) -> RegistrationId {
        self.registration
    }
}

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.registration, self.index, self.generation)
    }
}

/// A record together with its ownership and protocol state
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub registration: RegistrationId,
    pub record: ResourceRecord,
    pub probe: ProbeState,
    /// Announces only after the registration's anchor record verifies
    pub dependent: bool,
    /// At least one announcement went out, so withdrawal needs goodbyes
    pub announced: bool,
}

impl StoredRecord {
    pub fn new(registration: RegistrationId, record: ResourceRecord, probe: ProbeState) -> Self {
        Self {
            registration,
            record,
            probe,
            dependent: false,
            announced: false,
        }
    }

    pub fn dependent(mut self) -> Self {
        self.dependent = true;
        self
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<StoredRecord>,
}

/// Generation-checked record arena
#[derive(Debug, Default)]
pub struct RecordStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record and return its handle
    pub fn put(&mut self, entry: StoredRecord) -> RecordHandle {
        let registration = entry.registration;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        self.len += 1;

        RecordHandle {
            registration,
            index,
            generation: slot.generation,
        }
    }

    fn slot(&self, handle: &RecordHandle) -> Option<&StoredRecord> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry
            .as_ref()
            .filter(|e| e.registration == handle.registration)
    }

    pub fn get(&self, handle: &RecordHandle) -> Result<&StoredRecord> {
        self.slot(handle)
            .ok_or_else(|| Error::not_found(format!("record {}", handle)))
    }

    pub fn get_mut(&mut self, handle: &RecordHandle) -> Result<&mut StoredRecord> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation);
        slot.and_then(|s| s.entry.as_mut())
            .filter(|e| e.registration == handle.registration)
            .ok_or_else(|| Error::not_found(format!("record {}", handle)))
    }

    pub fn contains(&self, handle: &RecordHandle) -> bool {
        self.slot(handle).is_some()
    }

    /// Remove a record, invalidating its handle
    pub fn remove(&mut self, handle: &RecordHandle) -> Result<StoredRecord> {
        if !self.contains(handle) {
            return Err(Error::not_found(format!("record {}", handle)));
        }
        let slot = &mut self.slots[handle.index as usize];
        let entry = slot
            .entry
            .take()
            .ok_or_else(|| Error::not_found(format!("record {}", handle)))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Ok(entry)
    }

    /// Handles of every record owned by `registration`, in slot order
    pub fn list_by_registration(&self, registration: RegistrationId) -> Vec<RecordHandle> {
        self.iter()
            .filter(|(_, e)| e.registration == registration)
            .map(|(h, _)| h)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordHandle, &StoredRecord)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    RecordHandle {
                        registration: entry.registration,
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    /// Handles of every stored record
    pub fn handles(&self) -> Vec<RecordHandle> {
        self.iter().map(|(h, _)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{InterfaceIndex, RecordKind, rrclass, rrtype};
    use crate::wire::DomainName;

    fn entry(registration: u64, rdata: &[u8]) -> StoredRecord {
        let record = ResourceRecord::new(
            DomainName::parse("foo.local.").unwrap(),
            rrtype::TXT,
            rrclass::IN,
            rdata.to_vec(),
            0,
            RecordKind::Shared,
            InterfaceIndex::ANY,
        )
        .unwrap();
        StoredRecord::new(RegistrationId(registration), record, ProbeState::awaiting_anchor())
    }

    #[test]
    fn test_put_get_remove() {
        let mut store = RecordStore::new();
        let handle = store.put(entry(1, b"\x01a"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&handle).unwrap().record.rdata, b"\x01a".to_vec());

        store.remove(&handle).unwrap();
        assert!(store.is_empty());

        // Second removal is NotFound
        let err = store.remove(&handle).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let mut store = RecordStore::new();
        let old = store.put(entry(1, b"\x01a"));
        store.remove(&old).unwrap();

        let new = store.put(entry(1, b"\x01b"));
        assert_ne!(old, new);
        assert!(store.get(&old).is_err());
        assert!(store.get_mut(&old).is_err());
        assert_eq!(store.get(&new).unwrap().record.rdata, b"\x01b".to_vec());
    }

    #[test]
    fn test_list_by_registration() {
        let mut store = RecordStore::new();
        let a1 = store.put(entry(1, b"\x01a"));
        let _b = store.put(entry(2, b"\x01b"));
        let a2 = store.put(entry(1, b"\x01c"));

        assert_eq!(store.list_by_registration(RegistrationId(1)), vec![a1, a2]);
        assert_eq!(store.list_by_registration(RegistrationId(2)).len(), 1);
        assert!(store.list_by_registration(RegistrationId(3)).is_empty());
        assert_eq!(store.handles().len(), 3);
    }
}
