//! Resource records and their flags
//!
//! A [`ResourceRecord`] is what callers register: an owner name, numeric
//! type and class, opaque rdata, a TTL and a uniqueness kind, bound to one
//! interface (or all of them).

use crate::error::{Error, Result};
use crate::wire::{DomainName, WireRecord};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Record type numbers from the IANA registry
pub mod rrtype {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const PTR: u16 = 12;
    pub const HINFO: u16 = 13;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
    pub const SRV: u16 = 33;
    pub const OPT: u16 = 41;
    pub const NSEC: u16 = 47;
    pub const ANY: u16 = 255;
}

/// Record class numbers from the IANA registry
pub mod rrclass {
    pub const IN: u16 = 1;
    pub const ANY: u16 = 255;
}

/// TTL for records that carry host names (RFC 6762 §10)
pub const HOST_RECORD_TTL: u32 = 120;

/// TTL for all other records (RFC 6762 §10)
pub const DEFAULT_RECORD_TTL: u32 = 4500;

/// Largest TTL accepted (RFC 2181 §8)
pub const MAX_TTL: u32 = 0x7FFF_FFFF;

/// Network interface index; 0 means every interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceIndex(pub u32);

impl InterfaceIndex {
    pub const ANY: InterfaceIndex = InterfaceIndex(0);

    pub fn is_any(self) -> bool {
        self.0 == 0
    }

    /// Whether a record bound to `self` is visible on `other`
    pub fn covers(self, other: InterfaceIndex) -> bool {
        self.is_any() || other.is_any() || self == other
    }
}

impl fmt::Display for InterfaceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            f.write_str("any")
        } else {
            write!(f, "if{}", self.0)
        }
    }
}

/// Registration flags, bit-compatible with the DNS-SD API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RecordFlags(u32);

impl RecordFlags {
    pub const NONE: RecordFlags = RecordFlags(0);
    pub const NO_AUTO_RENAME: RecordFlags = RecordFlags(0x08);
    pub const SHARED: RecordFlags = RecordFlags(0x10);
    pub const UNIQUE: RecordFlags = RecordFlags(0x20);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: RecordFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Like [`RecordFlags::kind`], falling back to `default` when neither bit is set
    pub fn kind_or(self, default: RecordKind) -> Result<RecordKind> {
        if !self.contains(Self::SHARED) && !self.contains(Self::UNIQUE) {
            return Ok(default);
        }
        self.kind()
    }

    /// Resolve the uniqueness kind; exactly one of SHARED or UNIQUE must be set
    pub fn kind(self) -> Result<RecordKind> {
        match (self.contains(Self::SHARED), self.contains(Self::UNIQUE)) {
            (true, false) => Ok(RecordKind::Shared),
            (false, true) => Ok(RecordKind::Unique),
            (true, true) => Err(Error::invalid_argument(
                "flags must not set both SHARED and UNIQUE",
            )),
            (false, false) => Err(Error::invalid_argument(
                "flags must set exactly one of SHARED or UNIQUE",
            )),
        }
    }
}

impl std::ops::BitOr for RecordFlags {
    type Output = RecordFlags;

    fn bitor(self, rhs: Self) -> Self {
        RecordFlags(self.0 | rhs.0)
    }
}

/// Uniqueness class of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// May coexist with identical records from other responders
    Shared,
    /// Must be unique on the link per (name, type, class)
    Unique,
}

/// A record owned by a registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: DomainName,
    pub rrtype: u16,
    pub rrclass: u16,
    pub rdata: Vec<u8>,
    pub ttl: u32,
    pub kind: RecordKind,
    pub interface: InterfaceIndex,
}

impl ResourceRecord {
    /// Build a validated record
    ///
    /// A `ttl` of zero selects the default for `rrtype`, and empty TXT
    /// rdata becomes a single empty string.
    pub fn new(
        name: DomainName,
        rrtype: u16,
        rrclass: u16,
        rdata: Vec<u8>,
        ttl: u32,
        kind: RecordKind,
        interface: InterfaceIndex,
    ) -> Result<Self> {
        if name.is_root() {
            return Err(Error::invalid_argument("record name cannot be the root"));
        }
        validate_rrtype(rrtype)?;
        validate_rrclass(rrclass)?;
        validate_ttl(ttl)?;
        let rdata = normalize_rdata(rrtype, rdata)?;
        let ttl = if ttl == 0 { default_ttl(rrtype) } else { ttl };

        Ok(Self {
            name,
            rrtype,
            rrclass,
            rdata,
            ttl,
            kind,
            interface,
        })
    }

    pub fn is_unique(&self) -> bool {
        self.kind == RecordKind::Unique
    }

    /// Same owner name, type and class as `other`
    pub fn same_rrset(&self, other: &WireRecord) -> bool {
        self.name == other.name && self.rrtype == other.rrtype && self.rrclass == other.rrclass
    }

    /// Wire form with the given TTL; unique records carry the cache-flush bit
    pub fn to_wire(&self, ttl: u32) -> WireRecord {
        WireRecord {
            name: self.name.clone(),
            rrtype: self.rrtype,
            rrclass: self.rrclass,
            cache_flush: self.is_unique(),
            ttl,
            rdata: self.rdata.clone(),
        }
    }
}

/// TTL used when the caller passes zero
pub fn default_ttl(rrtype: u16) -> u32 {
    match rrtype {
        rrtype::A | rrtype::AAAA | rrtype::SRV | rrtype::HINFO => HOST_RECORD_TTL,
        _ => DEFAULT_RECORD_TTL,
    }
}

pub fn validate_rrtype(value: u16) -> Result<()> {
    match value {
        0 | rrtype::ANY | rrtype::OPT => Err(Error::invalid_argument(format!(
            "record type {} cannot be registered",
            value
        ))),
        _ => Ok(()),
    }
}

pub fn validate_rrclass(value: u16) -> Result<()> {
    if value == 0 || value == rrclass::ANY || value > 0x7FFF {
        return Err(Error::invalid_argument(format!(
            "record class {} cannot be registered",
            value
        )));
    }
    Ok(())
}

pub fn validate_ttl(ttl: u32) -> Result<()> {
    if ttl > MAX_TTL {
        return Err(Error::invalid_argument(format!(
            "ttl {} exceeds maximum {}",
            ttl, MAX_TTL
        )));
    }
    Ok(())
}

/// Check rdata size and apply TXT normalisation
pub fn normalize_rdata(rrtype: u16, rdata: Vec<u8>) -> Result<Vec<u8>> {
    if rdata.len() > u16::MAX as usize {
        return Err(Error::invalid_argument(format!(
            "rdata too long: {} bytes",
            rdata.len()
        )));
    }
    if rrtype == rrtype::TXT && rdata.is_empty() {
        return Ok(vec![0]);
    }
    Ok(rdata)
}

/// Encoders for the rdata of record types a service registration produces
pub mod rdata {
    use crate::error::{Error, Result};
    use crate::wire::DomainName;

    /// PTR rdata pointing at `target`
    pub fn ptr(target: &DomainName) -> Vec<u8> {
        target.to_wire()
    }

    /// SRV rdata
    pub fn srv(priority: u16, weight: u16, port: u16, target: &DomainName) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + target.wire_len());
        out.extend_from_slice(&priority.to_be_bytes());
        out.extend_from_slice(&weight.to_be_bytes());
        out.extend_from_slice(&port.to_be_bytes());
        target.write_to(&mut out);
        out
    }

    /// TXT rdata from `key=value` strings; no entries gives the empty TXT
    pub fn txt<I, S>(entries: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.as_ref();
            let len = u8::try_from(entry.len()).map_err(|_| {
                Error::invalid_argument(format!("TXT entry too long: {} bytes", entry.len()))
            })?;
            out.push(len);
            out.extend_from_slice(entry);
        }
        if out.is_empty() {
            out.push(0);
        }
        Ok(out)
    }

    /// A rdata
    pub fn a(addr: std::net::Ipv4Addr) -> Vec<u8> {
        addr.octets().to_vec()
    }

    /// AAAA rdata
    pub fn aaaa(addr: std::net::Ipv6Addr) -> Vec<u8> {
        addr.octets().to_vec()
    }

    /// Record type and rdata of the address record for `addr`
    pub fn address(addr: std::net::IpAddr) -> (u16, Vec<u8>) {
        match addr {
            std::net::IpAddr::V4(v4) => (super::rrtype::A, a(v4)),
            std::net::IpAddr::V6(v6) => (super::rrtype::AAAA, aaaa(v6)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> DomainName {
        DomainName::parse(s).unwrap()
    }

    #[test]
    fn test_flags_kind() {
        assert_eq!(RecordFlags::SHARED.kind().unwrap(), RecordKind::Shared);
        assert_eq!(
            (RecordFlags::UNIQUE | RecordFlags::NO_AUTO_RENAME).kind().unwrap(),
            RecordKind::Unique
        );
        assert!(RecordFlags::NONE.kind().is_err());
        assert!((RecordFlags::SHARED | RecordFlags::UNIQUE).kind().is_err());
        assert_eq!(RecordFlags::from_bits(0x20), RecordFlags::UNIQUE);
    }

    #[test]
    fn test_default_ttl() {
        let rr = ResourceRecord::new(
            name("svc.local."),
            rrtype::PTR,
            rrclass::IN,
            name("x.svc.local.").to_wire(),
            0,
            RecordKind::Shared,
            InterfaceIndex::ANY,
        )
        .unwrap();
        assert_eq!(rr.ttl, DEFAULT_RECORD_TTL);
        assert_eq!(default_ttl(rrtype::A), HOST_RECORD_TTL);
        assert_eq!(default_ttl(rrtype::SRV), HOST_RECORD_TTL);
    }

    #[test]
    fn test_validation() {
        let build = |rrtype, rrclass, ttl| {
            ResourceRecord::new(
                name("foo.local."),
                rrtype,
                rrclass,
                vec![1],
                ttl,
                RecordKind::Unique,
                InterfaceIndex::ANY,
            )
        };
        assert!(build(0, rrclass::IN, 120).is_err());
        assert!(build(rrtype::ANY, rrclass::IN, 120).is_err());
        assert!(build(rrtype::TXT, 0, 120).is_err());
        assert!(build(rrtype::TXT, 0x8001, 120).is_err());
        assert!(build(rrtype::TXT, rrclass::IN, MAX_TTL + 1).is_err());
        assert!(build(rrtype::TXT, rrclass::IN, MAX_TTL).is_ok());
    }

    #[test]
    fn test_empty_txt_normalised() {
        assert_eq!(normalize_rdata(rrtype::TXT, Vec::new()).unwrap(), vec![0]);
        assert_eq!(rdata::txt(Vec::<&str>::new()).unwrap(), vec![0]);
        assert_eq!(rdata::txt(["v=1"]).unwrap(), b"\x03v=1".to_vec());
    }

    #[test]
    fn test_interface_covers() {
        assert!(InterfaceIndex::ANY.covers(InterfaceIndex(3)));
        assert!(InterfaceIndex(3).covers(InterfaceIndex::ANY));
        assert!(!InterfaceIndex(2).covers(InterfaceIndex(3)));
    }
}
