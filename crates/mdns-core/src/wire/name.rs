//! Domain names
//!
//! Names are held as raw label octets. Comparison and hashing are ASCII
//! case-insensitive, as required for DNS names on the wire.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// Longest permitted label, in octets
pub const MAX_LABEL_LEN: usize = 63;

/// Longest permitted name in wire form, in octets
pub const MAX_NAME_LEN: usize = 255;

/// A fully-qualified domain name
#[derive(Debug, Clone, Default)]
pub struct DomainName {
    labels: Vec<Vec<u8>>,
}

impl DomainName {
    /// The root name (".")
    pub fn root() -> Self {
        Self { labels: Vec::new() }
    }

    /// Parse a name in presentation form
    ///
    /// Accepts `\.` and `\\` escapes as well as `\DDD` decimal escapes.
    /// The trailing dot is optional.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mdns_core::wire::DomainName;
    ///
    /// let name = DomainName::parse("My\\.Printer._ipp._tcp.local.").unwrap();
    /// assert_eq!(name.labels().len(), 4);
    /// assert_eq!(name.labels()[0], b"My.Printer".to_vec());
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Err(Error::invalid_argument("domain name cannot be empty"));
        }
        if text == "." {
            return Ok(Self::root());
        }

        let bytes = text.as_bytes();
        let mut labels = Vec::new();
        let mut current = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'\\' => {
                    let rest = &bytes[i + 1..];
                    if rest.len() >= 3 && rest[..3].iter().all(u8::is_ascii_digit) {
                        let value = (rest[0] - b'0') as u32 * 100
                            + (rest[1] - b'0') as u32 * 10
                            + (rest[2] - b'0') as u32;
                        if value > 255 {
                            return Err(Error::invalid_argument(format!(
                                "escape \\{} out of range in '{}'",
                                value, text
                            )));
                        }
                        current.push(value as u8);
                        i += 4;
                    } else if let Some(&c) = rest.first() {
                        current.push(c);
                        i += 2;
                    } else {
                        return Err(Error::invalid_argument(format!(
                            "dangling escape in '{}'",
                            text
                        )));
                    }
                }
                b'.' => {
                    if current.is_empty() {
                        return Err(Error::invalid_argument(format!(
                            "domain name has empty label: '{}'",
                            text
                        )));
                    }
                    labels.push(std::mem::take(&mut current));
                    i += 1;
                }
                c => {
                    current.push(c);
                    i += 1;
                }
            }
        }
        if !current.is_empty() {
            labels.push(current);
        }

        Self::from_labels(labels)
    }

    /// Build a name from raw labels, validating lengths
    pub fn from_labels<I, L>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = L>,
        L: Into<Vec<u8>>,
    {
        let labels: Vec<Vec<u8>> = labels.into_iter().map(Into::into).collect();
        for label in &labels {
            if label.is_empty() {
                return Err(Error::invalid_argument("domain name has empty label"));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(Error::invalid_argument(format!(
                    "label too long: {} octets (max {})",
                    label.len(),
                    MAX_LABEL_LEN
                )));
            }
        }
        let name = Self { labels };
        if name.wire_len() > MAX_NAME_LEN {
            return Err(Error::invalid_argument(format!(
                "domain name too long: {} octets (max {})",
                name.wire_len(),
                MAX_NAME_LEN
            )));
        }
        Ok(name)
    }

    /// The labels of this name, leftmost first
    pub fn labels(&self) -> &[Vec<u8>] {
        &self.labels
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// The leftmost label, if any
    pub fn first_label(&self) -> Option<&[u8]> {
        self.labels.first().map(Vec::as_slice)
    }

    /// Prepend a label to this name
    pub fn prepend(&self, label: impl Into<Vec<u8>>) -> Result<Self> {
        let mut labels = Vec::with_capacity(self.labels.len() + 1);
        labels.push(label.into());
        labels.extend(self.labels.iter().cloned());
        Self::from_labels(labels)
    }

    /// The reverse-mapping name of `addr` (`in-addr.arpa.` or `ip6.arpa.`)
    pub fn reverse_lookup(addr: IpAddr) -> Self {
        let mut labels: Vec<Vec<u8>> = match addr {
            IpAddr::V4(v4) => v4
                .octets()
                .iter()
                .rev()
                .map(|octet| octet.to_string().into_bytes())
                .chain([b"in-addr".to_vec()])
                .collect(),
            IpAddr::V6(v6) => v6
                .octets()
                .iter()
                .rev()
                .flat_map(|octet| [octet & 0x0F, octet >> 4])
                .map(|nibble| format!("{:x}", nibble).into_bytes())
                .chain([b"ip6".to_vec()])
                .collect(),
        };
        labels.push(b"arpa".to_vec());
        Self { labels }
    }

    /// Replace the leftmost label
    pub fn with_first_label(&self, label: impl Into<Vec<u8>>) -> Result<Self> {
        let mut labels = self.labels.clone();
        match labels.first_mut() {
            Some(first) => *first = label.into(),
            None => labels.push(label.into()),
        }
        Self::from_labels(labels)
    }

    /// Length of this name in uncompressed wire form
    pub fn wire_len(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    /// Append the uncompressed wire form of this name to `out`
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for label in &self.labels {
            out.push(label.len() as u8);
            out.extend_from_slice(label);
        }
        out.push(0);
    }

    /// Uncompressed wire form of this name
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        self.write_to(&mut out);
        out
    }

    fn lowercase_labels(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.labels.iter().map(|l| l.to_ascii_lowercase())
    }
}

impl PartialEq for DomainName {
    fn eq(&self, other: &Self) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(&other.labels)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Eq for DomainName {}

impl Hash for DomainName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.labels.len().hash(state);
        for label in self.lowercase_labels() {
            label.hash(state);
        }
    }
}

impl PartialOrd for DomainName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DomainName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lowercase_labels().cmp(other.lowercase_labels())
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return f.write_str(".");
        }
        for label in &self.labels {
            for &b in label {
                match b {
                    b'.' => f.write_str("\\.")?,
                    b'\\' => f.write_str("\\\\")?,
                    0x20..=0x7e => write!(f, "{}", b as char)?,
                    _ => write!(f, "\\{:03}", b)?,
                }
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for DomainName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
