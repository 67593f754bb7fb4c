//! Domain names.
//!
//! Names are stored as a vector of labels. Parsing follows compression
//! pointers (RFC 1035 §4.1.4); encoding never emits them, so encoded
//! names are always self-contained.

use crate::error::{ProtoError, Result};
use crate::wire::{WireReader, WireWriter};
use crate::{MAX_LABEL_LENGTH, MAX_NAME_LENGTH};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// A domain name.
#[derive(Debug, Clone, Eq)]
pub struct Name {
    labels: Vec<Vec<u8>>,
}

impl Name {
    /// The root name (zero labels).
    pub fn root() -> Self {
        Self { labels: Vec::new() }
    }

    /// Returns the labels of this name.
    pub fn labels(&self) -> &[Vec<u8>] {
        &self.labels
    }

    /// Returns true if this is the root name.
    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Wire-format length: one length octet per label plus the root octet.
    pub fn wire_len(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    /// Returns a copy with all ASCII letters lowercased.
    pub fn lowercased(&self) -> Self {
        Self {
            labels: self
                .labels
                .iter()
                .map(|l| l.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Parses a name starting at the reader's position, following
    /// compression pointers. The reader ends up positioned after the
    /// name as it appears in the message (not after any pointer target).
    pub fn parse(reader: &mut WireReader<'_>) -> Result<Self> {
        let mut labels = Vec::new();
        let mut wire_len = 1usize;
        // Position to restore once the first pointer has been followed.
        let mut resume: Option<usize> = None;
        let mut jumps = 0usize;

        loop {
            let len = reader.read_u8()?;
            match len {
                0 => break,
                l if l & 0xc0 == 0xc0 => {
                    let low = reader.read_u8()?;
                    let target = ((usize::from(l) & 0x3f) << 8) | usize::from(low);
                    if resume.is_none() {
                        resume = Some(reader.position());
                    }
                    // Pointers must go backwards; anything else loops.
                    if target >= reader.position() {
                        return Err(ProtoError::BadPointer(target));
                    }
                    jumps += 1;
                    if jumps > 64 {
                        return Err(ProtoError::PointerLoop);
                    }
                    reader.set_position(target);
                }
                l if usize::from(l) > MAX_LABEL_LENGTH => {
                    return Err(ProtoError::LabelTooLong);
                }
                l => {
                    let label = reader.read_bytes(usize::from(l))?;
                    wire_len += usize::from(l) + 1;
                    if wire_len > MAX_NAME_LENGTH {
                        return Err(ProtoError::NameTooLong);
                    }
                    labels.push(label.to_vec());
                }
            }
        }

        if let Some(pos) = resume {
            reader.set_position(pos);
        }
        Ok(Self { labels })
    }

    /// Writes the name in uncompressed wire form.
    pub fn write_to(&self, writer: &mut WireWriter) {
        for label in &self.labels {
            writer.put_u8(label.len() as u8);
            writer.put_slice(label);
        }
        writer.put_u8(0);
    }
}

impl FromStr for Name {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim_end_matches('.');
        if s.is_empty() {
            return Ok(Self::root());
        }
        let mut labels = Vec::new();
        let mut wire_len = 1usize;
        for label in s.split('.') {
            if label.is_empty() {
                return Err(ProtoError::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LENGTH {
                return Err(ProtoError::LabelTooLong);
            }
            wire_len += label.len() + 1;
            if wire_len > MAX_NAME_LENGTH {
                return Err(ProtoError::NameTooLong);
            }
            labels.push(label.as_bytes().to_vec());
        }
        Ok(Self { labels })
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return write!(f, ".");
        }
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            for &b in label {
                if b.is_ascii_graphic() && b != b'.' && b != b'\\' {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "\\{:03}", b)?;
                }
            }
        }
        Ok(())
    }
}

// Comparison is case-insensitive per RFC 1035 §2.3.3.
impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(&other.labels)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for label in &self.labels {
            label.to_ascii_lowercase().hash(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_roundtrip() {
        let name = Name::from_str("www.Example.COM.").unwrap();
        assert_eq!(name.labels().len(), 3);
        assert_eq!(name.to_string(), "www.Example.COM");
        assert_eq!(name.lowercased().to_string(), "www.example.com");
    }

    #[test]
    fn test_case_insensitive_eq() {
        let a = Name::from_str("example.com").unwrap();
        let b = Name::from_str("EXAMPLE.com").unwrap();
        assert_eq!(a, b);

        use std::collections::hash_map::DefaultHasher;
        let mut h1 = DefaultHasher::new();
        let mut h2 = DefaultHasher::new();
        a.hash(&mut h1);
        b.hash(&mut h2);
        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn test_wire_roundtrip() {
        let name = Name::from_str("a.bc.def").unwrap();
        let mut w = WireWriter::with_capacity(16);
        name.write_to(&mut w);
        assert_eq!(w.len(), name.wire_len());

        let buf = w.freeze();
        let mut r = WireReader::new(&buf);
        let parsed = Name::parse(&mut r).unwrap();
        assert_eq!(parsed, name);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_compression_pointer() {
        // "example.com" at offset 0, then a pointer to it at offset 13.
        let mut buf = Vec::new();
        buf.extend_from_slice(&[7]);
        buf.extend_from_slice(b"example");
        buf.extend_from_slice(&[3]);
        buf.extend_from_slice(b"com");
        buf.push(0);
        buf.extend_from_slice(&[0xc0, 0x00]);

        let mut r = WireReader::new(&buf);
        r.set_position(13);
        let name = Name::parse(&mut r).unwrap();
        assert_eq!(name.to_string(), "example.com");
        // Reader resumes after the two pointer bytes.
        assert_eq!(r.position(), 15);
    }

    #[test]
    fn test_forward_pointer_rejected() {
        let buf = [0xc0, 0x04, 0, 0, 0];
        let mut r = WireReader::new(&buf);
        assert!(Name::parse(&mut r).is_err());
    }

    #[test]
    fn test_label_too_long() {
        let label = "a".repeat(64);
        assert!(Name::from_str(&label).is_err());
    }

    #[test]
    fn test_name_too_long() {
        let long = format!("{}.{}.{}.{}", "a".repeat(63), "b".repeat(63), "c".repeat(63), "d".repeat(63));
        assert!(Name::from_str(&long).is_err());
    }
}
