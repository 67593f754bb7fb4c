//! NAT64 prefix state and AAAA synthesis.
//!
//! Each network holds at most one /96 prefix, set explicitly or learned
//! by discovery (an AAAA query for `ipv4only.arpa.`). The dispatcher
//! uses it to synthesize AAAA answers from A answers and to translate
//! reverse (PTR) queries for addresses inside the prefix.

use crate::{ResolveError, Result};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use tracing::debug;
use umbra_proto::{Message, Name, Question, RecordType, ResourceRecord};

/// Well-known NAT64 discovery name (RFC 7050).
pub const IPV4ONLY_ARPA: &str = "ipv4only.arpa";

/// Well-known addresses `ipv4only.arpa` resolves to.
const WKA_PRIMARY: Ipv4Addr = Ipv4Addr::new(192, 0, 0, 170);
const WKA_SECONDARY: Ipv4Addr = Ipv4Addr::new(192, 0, 0, 171);

/// A /96 NAT64 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nat64Prefix {
    addr: Ipv6Addr,
}

impl Nat64Prefix {
    pub const LEN: u8 = 96;

    /// Builds a prefix from an address whose low 32 bits are ignored.
    pub fn new(addr: Ipv6Addr) -> Self {
        let mut octets = addr.octets();
        octets[12..].fill(0);
        Self {
            addr: Ipv6Addr::from(octets),
        }
    }

    pub fn addr(&self) -> Ipv6Addr {
        self.addr
    }

    /// Maps an IPv4 address into the prefix.
    pub fn embed(&self, v4: Ipv4Addr) -> Ipv6Addr {
        let mut octets = self.addr.octets();
        octets[12..].copy_from_slice(&v4.octets());
        Ipv6Addr::from(octets)
    }

    /// True when `addr` falls inside this /96.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        addr.octets()[..12] == self.addr.octets()[..12]
    }

    /// Recovers the embedded IPv4 address.
    pub fn extract(&self, addr: Ipv6Addr) -> Ipv4Addr {
        let octets = addr.octets();
        Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15])
    }
}

impl FromStr for Nat64Prefix {
    type Err = ResolveError;

    /// Parses `"64:ff9b::/96"` (the length, when present, must be 96).
    fn from_str(s: &str) -> Result<Self> {
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (s, None),
        };
        if let Some(len) = len {
            let len: u8 = len
                .parse()
                .map_err(|_| ResolveError::InvalidArgument(format!("bad prefix length in {s}")))?;
            if len != Self::LEN {
                return Err(ResolveError::InvalidArgument(format!(
                    "NAT64 prefix must be /96, got /{len}"
                )));
            }
        }
        let addr: Ipv6Addr = addr
            .parse()
            .map_err(|_| ResolveError::InvalidArgument(format!("bad prefix address in {s}")))?;
        Ok(Self::new(addr))
    }
}

impl std::fmt::Display for Nat64Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, Self::LEN)
    }
}

/// Addresses synthesis must never apply to.
pub fn is_special_use_v4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 0                                     // 0.0.0.0/8
        || octets[0] == 127                            // 127.0.0.0/8
        || (octets[0] == 169 && octets[1] == 254)      // 169.254.0.0/16
        || (octets[0] & 0xf0) == 224                   // 224.0.0.0/4
        || addr == Ipv4Addr::BROADCAST
}

#[derive(Debug, Default)]
struct Inner {
    prefix: Option<Nat64Prefix>,
    discovery_running: bool,
    generation: u64,
}

/// Per-network NAT64 prefix holder.
///
/// Discovery completions carry the generation current when discovery
/// started; a completion that lost a race against `stop_discovery` or an
/// explicit set is discarded, so an explicit prefix always wins once
/// discovery is stopped.
#[derive(Debug, Default)]
pub struct Nat64State {
    inner: Mutex<Inner>,
}

impl Nat64State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(&self) -> Option<Nat64Prefix> {
        self.inner.lock().prefix
    }

    /// Installs an explicit prefix. Rejected while discovery is running.
    /// Returns true when the stored prefix changed.
    pub fn set_prefix(&self, prefix: Nat64Prefix) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.discovery_running {
            return Err(ResolveError::AlreadyExists);
        }
        let changed = inner.prefix != Some(prefix);
        inner.prefix = Some(prefix);
        Ok(changed)
    }

    /// Clears the stored prefix; `NotFound` when nothing is set.
    pub fn clear_prefix(&self) -> Result<Nat64Prefix> {
        let mut inner = self.inner.lock();
        inner.prefix.take().ok_or(ResolveError::NotFound)
    }

    /// Marks discovery as running and returns its generation token, or
    /// `None` when a discovery is already in flight.
    pub fn begin_discovery(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.discovery_running {
            return None;
        }
        inner.discovery_running = true;
        inner.generation += 1;
        Some(inner.generation)
    }

    /// Stops discovery; in-flight completions become stale.
    pub fn stop_discovery(&self) {
        let mut inner = self.inner.lock();
        inner.discovery_running = false;
        inner.generation += 1;
    }

    /// Publishes a discovered prefix if `generation` is still current.
    /// Returns true when the prefix was installed.
    pub fn publish_discovered(&self, generation: u64, prefix: Nat64Prefix) -> bool {
        let mut inner = self.inner.lock();
        if !inner.discovery_running || inner.generation != generation {
            debug!(%prefix, "discarding stale NAT64 discovery result");
            return false;
        }
        inner.discovery_running = false;
        inner.prefix = Some(prefix);
        true
    }
}

/// Extracts a NAT64 prefix from an `ipv4only.arpa` AAAA answer: the
/// first address embedding one of the well-known IPv4 addresses wins.
pub fn prefix_from_discovery_answer(answer: &Message) -> Option<Nat64Prefix> {
    for addr in answer.aaaa_records() {
        let octets = addr.octets();
        let embedded = Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]);
        if embedded == WKA_PRIMARY || embedded == WKA_SECONDARY {
            return Some(Nat64Prefix::new(addr));
        }
    }
    None
}

/// Builds a synthesized AAAA response for `question` from the A answers
/// in `a_response`, skipping special-use IPv4 addresses. Returns `None`
/// when nothing is synthesizable.
pub fn synthesize_aaaa(
    prefix: Nat64Prefix,
    question: &Question,
    query_id: u16,
    a_response: &Message,
) -> Option<Message> {
    let mut out = Message::response_to(&{
        let mut q = Message::query(question.clone());
        q.set_id(query_id);
        q
    });
    for record in a_response.answers_of_type(RecordType::A) {
        let Some(v4) = record.as_a() else { continue };
        if is_special_use_v4(v4) {
            continue;
        }
        out.add_answer(ResourceRecord::aaaa(
            question.qname.clone(),
            record.ttl,
            prefix.embed(v4),
        ));
    }
    if out.answers().is_empty() {
        return None;
    }
    Some(out)
}

/// Parses a `*.ip6.arpa` reverse name into an address.
pub fn parse_reverse_v6(name: &Name) -> Option<Ipv6Addr> {
    let labels = name.labels();
    if labels.len() != 34 {
        return None;
    }
    if !labels[32].eq_ignore_ascii_case(b"ip6") || !labels[33].eq_ignore_ascii_case(b"arpa") {
        return None;
    }
    let mut octets = [0u8; 16];
    for (i, label) in labels[..32].iter().enumerate() {
        if label.len() != 1 {
            return None;
        }
        let nibble = (label[0] as char).to_digit(16)? as u8;
        // Nibbles come least-significant first.
        let byte = 15 - i / 2;
        if i % 2 == 0 {
            octets[byte] |= nibble;
        } else {
            octets[byte] |= nibble << 4;
        }
    }
    Some(Ipv6Addr::from(octets))
}

/// Builds the `in-addr.arpa` reverse name for an IPv4 address.
pub fn reverse_v4_name(addr: Ipv4Addr) -> Name {
    let o = addr.octets();
    // Label content is digits and fixed suffixes, which always parse.
    Name::from_str(&format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0]))
        .unwrap_or_else(|_| Name::root())
}
