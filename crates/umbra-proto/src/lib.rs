//! # umbra DNS wire layer
//!
//! Minimal DNS message handling for the umbra resolver core.
//!
//! The resolver passes query and answer bytes through opaquely; this crate
//! only provides what the dispatch path actually inspects and builds:
//!
//! - header flags (QR, TC, RD) and response codes
//! - the question section
//! - record iteration with typed accessors for A / AAAA / PTR and the
//!   SOA minimum used for negative caching
//! - answer construction for NAT64 synthesis
//! - in-place utilities on raw wire bytes: TTL rewriting for cache hits
//!   and OPT-record manipulation for the EDNS0 downgrade path

pub mod error;
pub mod header;
pub mod message;
pub mod name;
pub mod question;
pub mod rcode;
pub mod record;
pub mod rtype;
pub mod wire;

pub use error::{ProtoError, Result};
pub use header::{Header, HeaderFlags, HEADER_SIZE};
pub use message::Message;
pub use name::Name;
pub use question::Question;
pub use rcode::Rcode;
pub use record::ResourceRecord;
pub use rtype::{RecordClass, RecordType};

/// Maximum length of a DNS label (RFC 1035).
pub const MAX_LABEL_LENGTH: usize = 63;

/// Maximum length of a domain name in wire form (RFC 1035).
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum size of a DNS message over UDP without EDNS0.
pub const MAX_UDP_MESSAGE_SIZE: usize = 512;

/// EDNS0 UDP payload size advertised in queries.
pub const EDNS_UDP_PAYLOAD: u16 = 1232;
