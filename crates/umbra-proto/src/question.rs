//! The question section.

use crate::error::Result;
use crate::name::Name;
use crate::rtype::{RecordClass, RecordType};
use crate::wire::{WireReader, WireWriter};
use std::fmt;

/// A single question entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    pub qname: Name,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl Question {
    pub fn new(qname: Name, qtype: RecordType) -> Self {
        Self {
            qname,
            qtype,
            qclass: RecordClass::IN,
        }
    }

    pub fn a(qname: Name) -> Self {
        Self::new(qname, RecordType::A)
    }

    pub fn aaaa(qname: Name) -> Self {
        Self::new(qname, RecordType::AAAA)
    }

    pub fn ptr(qname: Name) -> Self {
        Self::new(qname, RecordType::PTR)
    }

    pub fn wire_len(&self) -> usize {
        self.qname.wire_len() + 4
    }

    pub fn parse(reader: &mut WireReader<'_>) -> Result<Self> {
        let qname = Name::parse(reader)?;
        let qtype = RecordType(reader.read_u16()?);
        let qclass = RecordClass(reader.read_u16()?);
        Ok(Self {
            qname,
            qtype,
            qclass,
        })
    }

    pub fn write_to(&self, writer: &mut WireWriter) {
        self.qname.write_to(writer);
        writer.put_u16(self.qtype.0);
        writer.put_u16(self.qclass.0);
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.qname, self.qclass, self.qtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_roundtrip() {
        let q = Question::aaaa(Name::from_str("example.com").unwrap());
        let mut w = WireWriter::with_capacity(q.wire_len());
        q.write_to(&mut w);
        let buf = w.freeze();

        let parsed = Question::parse(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(parsed, q);
        assert_eq!(parsed.qclass, RecordClass::IN);
    }
}
