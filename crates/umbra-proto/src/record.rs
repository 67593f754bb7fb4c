//! Resource records.
//!
//! Rdata is carried as raw bytes. Name-bearing rdata the resolver
//! actually reads (PTR, CNAME, SOA) is decompressed at parse time so a
//! parsed record is self-contained; everything else is copied verbatim
//! and only ever inspected, never re-encoded into a new message.

use crate::error::{ProtoError, Result};
use crate::name::Name;
use crate::rtype::{RecordClass, RecordType};
use crate::wire::{WireReader, WireWriter};
use bytes::Bytes;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// A single resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: Name,
    pub rtype: RecordType,
    pub rclass: RecordClass,
    pub ttl: u32,
    rdata: Bytes,
}

impl ResourceRecord {
    /// Builds an A record.
    pub fn a(name: Name, ttl: u32, addr: Ipv4Addr) -> Self {
        Self {
            name,
            rtype: RecordType::A,
            rclass: RecordClass::IN,
            ttl,
            rdata: Bytes::copy_from_slice(&addr.octets()),
        }
    }

    /// Builds an AAAA record.
    pub fn aaaa(name: Name, ttl: u32, addr: Ipv6Addr) -> Self {
        Self {
            name,
            rtype: RecordType::AAAA,
            rclass: RecordClass::IN,
            ttl,
            rdata: Bytes::copy_from_slice(&addr.octets()),
        }
    }

    /// Builds an OPT pseudo-record advertising `payload` bytes (RFC 6891).
    pub fn opt(payload: u16) -> Self {
        Self {
            name: Name::root(),
            rtype: RecordType::OPT,
            rclass: RecordClass(payload),
            ttl: 0,
            rdata: Bytes::new(),
        }
    }

    /// Builds a PTR record.
    pub fn ptr(name: Name, ttl: u32, target: &Name) -> Self {
        let mut w = WireWriter::with_capacity(target.wire_len());
        target.write_to(&mut w);
        Self {
            name,
            rtype: RecordType::PTR,
            rclass: RecordClass::IN,
            ttl,
            rdata: w.freeze(),
        }
    }

    pub fn rdata(&self) -> &[u8] {
        &self.rdata
    }

    #[inline]
    pub fn is_opt(&self) -> bool {
        self.rtype == RecordType::OPT
    }

    /// The IPv4 address, if this is a well-formed A record.
    pub fn as_a(&self) -> Option<Ipv4Addr> {
        if self.rtype != RecordType::A || self.rdata.len() != 4 {
            return None;
        }
        let o: [u8; 4] = self.rdata[..].try_into().ok()?;
        Some(Ipv4Addr::from(o))
    }

    /// The IPv6 address, if this is a well-formed AAAA record.
    pub fn as_aaaa(&self) -> Option<Ipv6Addr> {
        if self.rtype != RecordType::AAAA || self.rdata.len() != 16 {
            return None;
        }
        let o: [u8; 16] = self.rdata[..].try_into().ok()?;
        Some(Ipv6Addr::from(o))
    }

    /// The PTR target name.
    pub fn ptr_target(&self) -> Option<Name> {
        if self.rtype != RecordType::PTR {
            return None;
        }
        Name::parse(&mut WireReader::new(&self.rdata)).ok()
    }

    /// The SOA MINIMUM field, used as the negative-caching TTL bound.
    pub fn soa_minimum(&self) -> Option<u32> {
        if self.rtype != RecordType::SOA {
            return None;
        }
        let mut r = WireReader::new(&self.rdata);
        Name::parse(&mut r).ok()?; // MNAME
        Name::parse(&mut r).ok()?; // RNAME
        r.skip(16).ok()?; // SERIAL, REFRESH, RETRY, EXPIRE
        r.read_u32().ok()
    }

    /// Parses one record. `reader` must be positioned inside the full
    /// message so compression pointers in rdata can be followed.
    pub fn parse(reader: &mut WireReader<'_>) -> Result<Self> {
        let name = Name::parse(reader)?;
        let rtype = RecordType(reader.read_u16()?);
        let rclass = RecordClass(reader.read_u16()?);
        let ttl = reader.read_u32()?;
        let rdlen = usize::from(reader.read_u16()?);
        let rdata_start = reader.position();

        let rdata = match rtype {
            RecordType::PTR | RecordType::CNAME => {
                let target = Name::parse(reader)?;
                if reader.position() != rdata_start + rdlen {
                    reader.set_position(rdata_start + rdlen);
                }
                let mut w = WireWriter::with_capacity(target.wire_len());
                target.write_to(&mut w);
                w.freeze()
            }
            RecordType::SOA => {
                let mname = Name::parse(reader)?;
                let rname = Name::parse(reader)?;
                let tail = reader.read_bytes(20).map_err(|_| ProtoError::BadRdata("SOA"))?;
                let mut w =
                    WireWriter::with_capacity(mname.wire_len() + rname.wire_len() + 20);
                mname.write_to(&mut w);
                rname.write_to(&mut w);
                w.put_slice(tail);
                if reader.position() != rdata_start + rdlen {
                    reader.set_position(rdata_start + rdlen);
                }
                w.freeze()
            }
            _ => Bytes::copy_from_slice(reader.read_bytes(rdlen)?),
        };

        Ok(Self {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        })
    }

    pub fn wire_len(&self) -> usize {
        self.name.wire_len() + 10 + self.rdata.len()
    }

    pub fn write_to(&self, writer: &mut WireWriter) {
        self.name.write_to(writer);
        writer.put_u16(self.rtype.0);
        writer.put_u16(self.rclass.0);
        writer.put_u32(self.ttl);
        writer.put_u16(self.rdata.len() as u16);
        writer.put_slice(&self.rdata);
    }
}

impl fmt::Display for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.name, self.ttl, self.rclass, self.rtype
        )?;
        if let Some(a) = self.as_a() {
            write!(f, " {}", a)?;
        } else if let Some(a) = self.as_aaaa() {
            write!(f, " {}", a)?;
        } else if let Some(t) = self.ptr_target() {
            write!(f, " {}", t)?;
        }
        Ok(())
    }
}
