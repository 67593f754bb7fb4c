//! Record types and classes.
//!
//! The dispatcher never needs the full typed zoo of record types, so both
//! are thin u16 newtypes with the handful of constants it inspects.

use std::fmt;

/// A DNS record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordType(pub u16);

impl RecordType {
    pub const A: RecordType = RecordType(1);
    pub const CNAME: RecordType = RecordType(5);
    pub const SOA: RecordType = RecordType(6);
    pub const PTR: RecordType = RecordType(12);
    pub const AAAA: RecordType = RecordType(28);
    pub const OPT: RecordType = RecordType(41);
    pub const ANY: RecordType = RecordType(255);
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::A => "A",
            Self::CNAME => "CNAME",
            Self::SOA => "SOA",
            Self::PTR => "PTR",
            Self::AAAA => "AAAA",
            Self::OPT => "OPT",
            Self::ANY => "ANY",
            RecordType(n) => return write!(f, "TYPE{}", n),
        };
        f.write_str(s)
    }
}

/// A DNS record class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordClass(pub u16);

impl RecordClass {
    pub const IN: RecordClass = RecordClass(1);
    pub const ANY: RecordClass = RecordClass(255);
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IN => f.write_str("IN"),
            Self::ANY => f.write_str("ANY"),
            RecordClass(n) => write!(f, "CLASS{}", n),
        }
    }
}
