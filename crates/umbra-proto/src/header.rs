//! The fixed 12-byte message header.

use crate::error::{ProtoError, Result};
use crate::rcode::Rcode;
use crate::wire::{WireReader, WireWriter};
use bitflags::bitflags;

/// Size of the DNS header in bytes.
pub const HEADER_SIZE: usize = 12;

bitflags! {
    /// Header flag bits (QR through CD). The opcode and rcode live in
    /// the same 16-bit field but are kept separately on [`Header`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeaderFlags: u16 {
        /// Query/Response.
        const QR = 0x8000;
        /// Authoritative Answer.
        const AA = 0x0400;
        /// Truncated.
        const TC = 0x0200;
        /// Recursion Desired.
        const RD = 0x0100;
        /// Recursion Available.
        const RA = 0x0080;
        /// Authentic Data (DNSSEC).
        const AD = 0x0020;
        /// Checking Disabled.
        const CD = 0x0010;
    }
}

/// Parsed DNS message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: HeaderFlags,
    pub opcode: u8,
    pub rcode: Rcode,
    pub qd_count: u16,
    pub an_count: u16,
    pub ns_count: u16,
    pub ar_count: u16,
}

impl Header {
    /// A recursive query header with a random ID.
    pub fn query() -> Self {
        Self {
            id: rand::random(),
            flags: HeaderFlags::RD,
            opcode: 0,
            rcode: Rcode::NOERROR,
            qd_count: 1,
            an_count: 0,
            ns_count: 0,
            ar_count: 0,
        }
    }

    /// A response header echoing `query`'s ID and RD bit.
    pub fn response_to(query: &Header) -> Self {
        Self {
            id: query.id,
            flags: HeaderFlags::QR | HeaderFlags::RA | (query.flags & HeaderFlags::RD),
            opcode: query.opcode,
            rcode: Rcode::NOERROR,
            qd_count: query.qd_count,
            an_count: 0,
            ns_count: 0,
            ar_count: 0,
        }
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.flags.contains(HeaderFlags::QR)
    }

    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.flags.contains(HeaderFlags::TC)
    }

    pub fn parse(reader: &mut WireReader<'_>) -> Result<Self> {
        if reader.remaining() < HEADER_SIZE {
            return Err(ProtoError::ShortHeader);
        }
        let id = reader.read_u16()?;
        let raw = reader.read_u16()?;
        Ok(Self {
            id,
            flags: HeaderFlags::from_bits_truncate(raw),
            opcode: ((raw >> 11) & 0x0f) as u8,
            rcode: Rcode((raw & 0x0f) as u8),
            qd_count: reader.read_u16()?,
            an_count: reader.read_u16()?,
            ns_count: reader.read_u16()?,
            ar_count: reader.read_u16()?,
        })
    }

    pub fn write_to(&self, writer: &mut WireWriter) {
        writer.put_u16(self.id);
        let raw = self.flags.bits()
            | (u16::from(self.opcode & 0x0f) << 11)
            | u16::from(self.rcode.0 & 0x0f);
        writer.put_u16(raw);
        writer.put_u16(self.qd_count);
        writer.put_u16(self.an_count);
        writer.put_u16(self.ns_count);
        writer.put_u16(self.ar_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut h = Header::query();
        h.id = 0x1234;
        h.rcode = Rcode::NXDOMAIN;
        h.flags |= HeaderFlags::QR | HeaderFlags::TC;

        let mut w = WireWriter::with_capacity(HEADER_SIZE);
        h.write_to(&mut w);
        let buf = w.freeze();

        let parsed = Header::parse(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(parsed, h);
        assert!(parsed.is_response());
        assert!(parsed.is_truncated());
        assert_eq!(parsed.rcode, Rcode::NXDOMAIN);
    }

    #[test]
    fn test_short_header() {
        let buf = [0u8; 11];
        assert!(Header::parse(&mut WireReader::new(&buf)).is_err());
    }
}
