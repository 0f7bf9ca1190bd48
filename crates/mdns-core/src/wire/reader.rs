use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};

use super::name::{DomainName, MAX_NAME_LEN};

/// Compression pointers followed before a name is rejected
const MAX_POINTER_HOPS: usize = 64;

/// Big-endian cursor over a received DNS message
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::wire(format!(
                    "truncated message: need {} bytes at offset {}",
                    len, self.pos
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// Read a possibly-compressed name
    ///
    /// Pointers must point strictly backwards, which rules out loops.
    pub(crate) fn read_name(&mut self) -> Result<DomainName> {
        let mut labels: Vec<Vec<u8>> = Vec::new();
        let mut pos = self.pos;
        let mut resume_at = None;
        let mut hops = 0;
        let mut total = 1;

        loop {
            let len = *self
                .buf
                .get(pos)
                .ok_or_else(|| Error::wire("name runs past end of message"))?;

            match len & 0xC0 {
                0x00 if len == 0 => {
                    pos += 1;
                    break;
                }
                0x00 => {
                    let start = pos + 1;
                    let end = start + len as usize;
                    let label = self
                        .buf
                        .get(start..end)
                        .ok_or_else(|| Error::wire("label runs past end of message"))?;
                    total += label.len() + 1;
                    if total > MAX_NAME_LEN {
                        return Err(Error::wire("name exceeds 255 octets"));
                    }
                    labels.push(label.to_vec());
                    pos = end;
                }
                0xC0 => {
                    let low = *self
                        .buf
                        .get(pos + 1)
                        .ok_or_else(|| Error::wire("truncated compression pointer"))?;
                    let target = (((len & 0x3F) as usize) << 8) | low as usize;
                    if target >= pos {
                        return Err(Error::wire(format!(
                            "forward compression pointer {} at offset {}",
                            target, pos
                        )));
                    }
                    hops += 1;
                    if hops > MAX_POINTER_HOPS {
                        return Err(Error::wire("too many compression pointers"));
                    }
                    if resume_at.is_none() {
                        resume_at = Some(pos + 2);
                    }
                    pos = target;
                }
                other => {
                    return Err(Error::wire(format!("unsupported label type 0x{:02x}", other)));
                }
            }
        }

        self.pos = resume_at.unwrap_or(pos);
        DomainName::from_labels(labels).map_err(|e| Error::wire(e.to_string()))
    }
}
