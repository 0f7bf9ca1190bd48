//! DNS message encoding and decoding
//!
//! Messages are encoded without name compression. Decoding accepts
//! compressed names anywhere, including inside the rdata of the record
//! types that carry names, which are rewritten to their uncompressed form
//! so rdata can be compared byte for byte.

use crate::error::{Error, Result};
use crate::record::rrtype;
use byteorder::{BigEndian, WriteBytesExt};

use super::name::DomainName;
use super::reader::WireReader;

/// QR bit: this message is a response
pub const FLAG_RESPONSE: u16 = 0x8000;

/// AA bit: authoritative answer
pub const FLAG_AUTHORITATIVE: u16 = 0x0400;

/// Top bit of the class field in a record: cache-flush
pub const CACHE_FLUSH_BIT: u16 = 0x8000;

/// Top bit of the class field in a question: unicast response requested
pub const UNICAST_RESPONSE_BIT: u16 = 0x8000;

const CLASS_MASK: u16 = 0x7FFF;
const HEADER_LEN: usize = 12;

/// A question section entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: DomainName,
    pub qtype: u16,
    pub qclass: u16,
    pub unicast_response: bool,
}

impl Question {
    pub fn new(name: DomainName, qtype: u16, qclass: u16) -> Self {
        Self {
            name,
            qtype,
            qclass,
            unicast_response: false,
        }
    }

    /// Whether this question asks for records of the given name, type and class
    pub fn matches(&self, name: &DomainName, rrtype: u16, rrclass: u16) -> bool {
        self.name == *name
            && (self.qtype == rrtype || self.qtype == rrtype::ANY)
            && (self.qclass == rrclass || self.qclass == crate::record::rrclass::ANY)
    }
}

/// A resource record as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    pub name: DomainName,
    pub rrtype: u16,
    pub rrclass: u16,
    pub cache_flush: bool,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl WireRecord {
    /// A goodbye has a zero TTL
    pub fn is_goodbye(&self) -> bool {
        self.ttl == 0
    }
}

/// A complete DNS message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<WireRecord>,
    pub authorities: Vec<WireRecord>,
    pub additionals: Vec<WireRecord>,
}

impl Message {
    /// An empty mDNS query
    pub fn query() -> Self {
        Self::default()
    }

    /// An empty authoritative mDNS response
    pub fn response() -> Self {
        Self {
            flags: FLAG_RESPONSE | FLAG_AUTHORITATIVE,
            ..Self::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    /// A query is a probe when it proposes records in the authority section
    pub fn is_probe(&self) -> bool {
        !self.is_response() && !self.questions.is_empty() && !self.authorities.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.answers.is_empty()
            && self.authorities.is_empty()
            && self.additionals.is_empty()
    }

    /// Encode this message into wire form
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(512);
        out.write_u16::<BigEndian>(self.id)?;
        out.write_u16::<BigEndian>(self.flags)?;
        for count in [
            self.questions.len(),
            self.answers.len(),
            self.authorities.len(),
            self.additionals.len(),
        ] {
            let count = u16::try_from(count)
                .map_err(|_| Error::wire("too many entries in one section"))?;
            out.write_u16::<BigEndian>(count)?;
        }

        for q in &self.questions {
            q.name.write_to(&mut out);
            out.write_u16::<BigEndian>(q.qtype)?;
            let mut qclass = q.qclass & CLASS_MASK;
            if q.unicast_response {
                qclass |= UNICAST_RESPONSE_BIT;
            }
            out.write_u16::<BigEndian>(qclass)?;
        }

        for rr in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            rr.name.write_to(&mut out);
            out.write_u16::<BigEndian>(rr.rrtype)?;
            let mut rrclass = rr.rrclass & CLASS_MASK;
            if rr.cache_flush {
                rrclass |= CACHE_FLUSH_BIT;
            }
            out.write_u16::<BigEndian>(rrclass)?;
            out.write_u32::<BigEndian>(rr.ttl)?;
            let rdlength = u16::try_from(rr.rdata.len())
                .map_err(|_| Error::wire(format!("rdata too long: {} bytes", rr.rdata.len())))?;
            out.write_u16::<BigEndian>(rdlength)?;
            out.extend_from_slice(&rr.rdata);
        }

        Ok(out)
    }

    /// Decode a message from wire form
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::wire(format!(
                "message too short: {} bytes",
                buf.len()
            )));
        }

        let mut reader = WireReader::new(buf);
        let id = reader.read_u16()?;
        let flags = reader.read_u16()?;
        let qdcount = reader.read_u16()?;
        let ancount = reader.read_u16()?;
        let nscount = reader.read_u16()?;
        let arcount = reader.read_u16()?;

        let mut questions = Vec::with_capacity(qdcount as usize);
        for _ in 0..qdcount {
            let name = reader.read_name()?;
            let qtype = reader.read_u16()?;
            let raw_class = reader.read_u16()?;
            questions.push(Question {
                name,
                qtype,
                qclass: raw_class & CLASS_MASK,
                unicast_response: raw_class & UNICAST_RESPONSE_BIT != 0,
            });
        }

        let answers = read_records(&mut reader, ancount)?;
        let authorities = read_records(&mut reader, nscount)?;
        let additionals = read_records(&mut reader, arcount)?;

        Ok(Self {
            id,
            flags,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}

fn read_records(reader: &mut WireReader<'_>, count: u16) -> Result<Vec<WireRecord>> {
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = reader.read_name()?;
        let rrtype = reader.read_u16()?;
        let raw_class = reader.read_u16()?;
        let ttl = reader.read_u32()?;
        let rdlength = reader.read_u16()? as usize;
        let rdata = read_rdata(reader, rrtype, rdlength)?;
        records.push(WireRecord {
            name,
            rrtype,
            rrclass: raw_class & CLASS_MASK,
            cache_flush: raw_class & CACHE_FLUSH_BIT != 0,
            ttl,
            rdata,
        });
    }
    Ok(records)
}

/// Read rdata, expanding compressed names for types that embed them
fn read_rdata(reader: &mut WireReader<'_>, rrtype: u16, rdlength: usize) -> Result<Vec<u8>> {
    let end = reader.position() + rdlength;
    let rdata = match rrtype {
        rrtype::NS | rrtype::CNAME | rrtype::PTR => reader.read_name()?.to_wire(),
        rrtype::MX => {
            let mut out = reader.read_bytes(2)?;
            reader.read_name()?.write_to(&mut out);
            out
        }
        rrtype::SRV => {
            let mut out = reader.read_bytes(6)?;
            reader.read_name()?.write_to(&mut out);
            out
        }
        _ => return reader.read_bytes(rdlength),
    };

    if reader.position() != end {
        return Err(Error::wire(format!(
            "rdata length mismatch for type {}: declared {} bytes",
            rrtype, rdlength
        )));
    }
    Ok(rdata)
}
