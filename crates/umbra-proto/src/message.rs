//! DNS messages, plus utilities that operate on raw wire bytes.
//!
//! Answers travel through the resolver as opaque byte buffers. Anything
//! that has to touch a stored answer without re-encoding it (ID echo on
//! cache hits, TTL aging, the EDNS0 downgrade) works directly on the
//! buffer via the `raw` helpers at the bottom of this module.

use crate::error::{ProtoError, Result};
use crate::header::{Header, HeaderFlags, HEADER_SIZE};
use crate::question::Question;
use crate::rcode::Rcode;
use crate::record::ResourceRecord;
use crate::rtype::RecordType;
use crate::wire::{WireReader, WireWriter};
use bytes::Bytes;

/// A parsed DNS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    questions: Vec<Question>,
    answers: Vec<ResourceRecord>,
    authority: Vec<ResourceRecord>,
    additional: Vec<ResourceRecord>,
}

impl Message {
    /// Creates a recursive query for `question` with a random ID and no OPT.
    pub fn query(question: Question) -> Self {
        Self {
            header: Header::query(),
            questions: vec![question],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// Creates an empty response mirroring `query`.
    pub fn response_to(query: &Message) -> Self {
        Self {
            header: Header::response_to(&query.header),
            questions: query.questions.clone(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.header.id
    }

    #[inline]
    pub fn set_id(&mut self, id: u16) {
        self.header.id = id;
    }

    #[inline]
    pub fn rcode(&self) -> Rcode {
        self.header.rcode
    }

    #[inline]
    pub fn set_rcode(&mut self, rcode: Rcode) {
        self.header.rcode = rcode;
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.header.is_truncated()
    }

    #[inline]
    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    /// The first question, which is the only one in practice.
    #[inline]
    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }

    #[inline]
    pub fn answers(&self) -> &[ResourceRecord] {
        &self.answers
    }

    #[inline]
    pub fn authority(&self) -> &[ResourceRecord] {
        &self.authority
    }

    #[inline]
    pub fn additional(&self) -> &[ResourceRecord] {
        &self.additional
    }

    pub fn add_answer(&mut self, record: ResourceRecord) {
        self.answers.push(record);
        self.header.an_count = self.answers.len() as u16;
    }

    pub fn add_authority(&mut self, record: ResourceRecord) {
        self.authority.push(record);
        self.header.ns_count = self.authority.len() as u16;
    }

    /// Appends an OPT pseudo-record advertising `payload` bytes.
    pub fn enable_edns0(&mut self, payload: u16) {
        if self.has_edns0() {
            return;
        }
        self.additional.push(ResourceRecord::opt(payload));
        self.header.ar_count = self.additional.len() as u16;
    }

    pub fn has_edns0(&self) -> bool {
        self.additional.iter().any(ResourceRecord::is_opt)
    }

    #[inline]
    pub fn is_nxdomain(&self) -> bool {
        self.rcode().is_nxdomain()
    }

    #[inline]
    pub fn is_servfail(&self) -> bool {
        self.rcode().is_servfail()
    }

    /// NOERROR with an empty answer section.
    pub fn is_nodata(&self) -> bool {
        self.rcode().is_no_error() && self.answers.is_empty()
    }

    pub fn answers_of_type(
        &self,
        rtype: RecordType,
    ) -> impl Iterator<Item = &ResourceRecord> {
        self.answers.iter().filter(move |r| r.rtype == rtype)
    }

    pub fn a_records(&self) -> impl Iterator<Item = std::net::Ipv4Addr> + '_ {
        self.answers.iter().filter_map(ResourceRecord::as_a)
    }

    pub fn aaaa_records(&self) -> impl Iterator<Item = std::net::Ipv6Addr> + '_ {
        self.answers.iter().filter_map(ResourceRecord::as_aaaa)
    }

    /// The SOA MINIMUM from the authority section, if present.
    pub fn soa_minimum(&self) -> Option<u32> {
        self.authority.iter().find_map(ResourceRecord::soa_minimum)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let header = Header::parse(&mut reader)?;

        let mut questions = Vec::with_capacity(usize::from(header.qd_count));
        for _ in 0..header.qd_count {
            questions.push(Question::parse(&mut reader)?);
        }

        let mut sections = [
            Vec::with_capacity(usize::from(header.an_count)),
            Vec::with_capacity(usize::from(header.ns_count)),
            Vec::with_capacity(usize::from(header.ar_count)),
        ];
        let counts = [header.an_count, header.ns_count, header.ar_count];
        let mut opt_seen = false;
        for (section, &count) in sections.iter_mut().zip(&counts) {
            for _ in 0..count {
                let rr = ResourceRecord::parse(&mut reader)?;
                if rr.is_opt() {
                    if opt_seen {
                        return Err(ProtoError::MultipleOpt);
                    }
                    opt_seen = true;
                }
                section.push(rr);
            }
        }
        let [answers, authority, additional] = sections;

        Ok(Self {
            header,
            questions,
            answers,
            authority,
            additional,
        })
    }

    pub fn wire_len(&self) -> usize {
        HEADER_SIZE
            + self.questions.iter().map(Question::wire_len).sum::<usize>()
            + self
                .answers
                .iter()
                .chain(&self.authority)
                .chain(&self.additional)
                .map(ResourceRecord::wire_len)
                .sum::<usize>()
    }

    pub fn write_to(&self, writer: &mut WireWriter) {
        let mut header = self.header.clone();
        header.qd_count = self.questions.len() as u16;
        header.an_count = self.answers.len() as u16;
        header.ns_count = self.authority.len() as u16;
        header.ar_count = self.additional.len() as u16;
        header.write_to(writer);

        for q in &self.questions {
            q.write_to(writer);
        }
        for r in self
            .answers
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
        {
            r.write_to(writer);
        }
    }

    pub fn to_wire(&self) -> Bytes {
        let mut w = WireWriter::with_capacity(self.wire_len());
        self.write_to(&mut w);
        w.freeze()
    }
}

// ============================================================================
// Raw-byte helpers
// ============================================================================

/// The message ID without a full parse.
pub fn peek_id(data: &[u8]) -> Option<u16> {
    data.get(..2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Overwrites the message ID in place.
pub fn set_raw_id(data: &mut [u8], id: u16) {
    if data.len() >= 2 {
        data[..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// The header RCODE without a full parse.
pub fn peek_rcode(data: &[u8]) -> Option<Rcode> {
    data.get(3).map(|b| Rcode(b & 0x0f))
}

/// The TC bit without a full parse.
pub fn peek_tc(data: &[u8]) -> Option<bool> {
    data.get(2)
        .map(|b| HeaderFlags::from_bits_truncate(u16::from(*b) << 8).contains(HeaderFlags::TC))
}

/// Skips a (possibly compressed) name in raw wire bytes, returning the
/// offset just past it.
fn skip_name(data: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        let len = *data.get(pos).ok_or(ProtoError::UnexpectedEof(pos))?;
        match len {
            0 => return Ok(pos + 1),
            l if l & 0xc0 == 0xc0 => {
                if pos + 2 > data.len() {
                    return Err(ProtoError::UnexpectedEof(pos + 2));
                }
                return Ok(pos + 2);
            }
            l => pos += usize::from(l) + 1,
        }
    }
}

/// Collects the offset of each record's TTL field along with its type.
fn ttl_offsets(data: &[u8]) -> Result<Vec<(usize, RecordType)>> {
    let header = Header::parse(&mut WireReader::new(data))?;
    let mut pos = HEADER_SIZE;
    for _ in 0..header.qd_count {
        pos = skip_name(data, pos)?;
        pos += 4;
    }
    let total =
        usize::from(header.an_count) + usize::from(header.ns_count) + usize::from(header.ar_count);
    let mut offsets = Vec::with_capacity(total);
    for _ in 0..total {
        pos = skip_name(data, pos)?;
        if pos + 10 > data.len() {
            return Err(ProtoError::UnexpectedEof(pos + 10));
        }
        let rtype = RecordType(u16::from_be_bytes([data[pos], data[pos + 1]]));
        let rdlen = usize::from(u16::from_be_bytes([data[pos + 8], data[pos + 9]]));
        offsets.push((pos + 4, rtype));
        pos += 10 + rdlen;
        if pos > data.len() {
            return Err(ProtoError::UnexpectedEof(pos));
        }
    }
    Ok(offsets)
}

/// Rewrites every record TTL in place to `remaining` seconds (floored at
/// 1), leaving OPT pseudo-records alone. Used when serving cached
/// answers, which store the original bytes plus an absolute expiry.
pub fn rewrite_ttls(data: &mut [u8], remaining: u32) -> Result<()> {
    let remaining = remaining.max(1);
    for (ttl_at, rtype) in ttl_offsets(data)? {
        if rtype != RecordType::OPT {
            data[ttl_at..ttl_at + 4].copy_from_slice(&remaining.to_be_bytes());
        }
    }
    Ok(())
}

/// Returns true if the message carries an OPT record.
pub fn has_edns0(data: &[u8]) -> Result<bool> {
    let msg = Message::parse(data)?;
    Ok(msg.has_edns0())
}

/// Returns a copy of `data` with the OPT record removed, or `None` when
/// there is none. Compression pointers stay valid because they only ever
/// point backwards and OPT carries a root name nothing can point into.
pub fn strip_edns0(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let header = Header::parse(&mut WireReader::new(data))?;
    let mut pos = HEADER_SIZE;
    for _ in 0..header.qd_count {
        pos = skip_name(data, pos)?;
        pos += 4;
    }
    let total =
        usize::from(header.an_count) + usize::from(header.ns_count) + usize::from(header.ar_count);
    for _ in 0..total {
        let start = pos;
        pos = skip_name(data, pos)?;
        if pos + 10 > data.len() {
            return Err(ProtoError::UnexpectedEof(pos + 10));
        }
        let rtype = RecordType(u16::from_be_bytes([data[pos], data[pos + 1]]));
        let rdlen = usize::from(u16::from_be_bytes([data[pos + 8], data[pos + 9]]));
        let end = pos + 10 + rdlen;
        if end > data.len() {
            return Err(ProtoError::UnexpectedEof(end));
        }
        if rtype == RecordType::OPT {
            let mut out = Vec::with_capacity(data.len() - (end - start));
            out.extend_from_slice(&data[..start]);
            out.extend_from_slice(&data[end..]);
            let ar = u16::from_be_bytes([out[10], out[11]]).saturating_sub(1);
            out[10..12].copy_from_slice(&ar.to_be_bytes());
            return Ok(Some(out));
        }
        pos = end;
    }
    Ok(None)
}
