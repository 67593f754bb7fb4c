//! Response codes.

use std::fmt;

/// A DNS response code (header RCODE field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rcode(pub u8);

impl Rcode {
    pub const NOERROR: Rcode = Rcode(0);
    pub const FORMERR: Rcode = Rcode(1);
    pub const SERVFAIL: Rcode = Rcode(2);
    pub const NXDOMAIN: Rcode = Rcode(3);
    pub const NOTIMP: Rcode = Rcode(4);
    pub const REFUSED: Rcode = Rcode(5);

    #[inline]
    pub fn is_no_error(self) -> bool {
        self == Self::NOERROR
    }

    #[inline]
    pub fn is_nxdomain(self) -> bool {
        self == Self::NXDOMAIN
    }

    #[inline]
    pub fn is_servfail(self) -> bool {
        self == Self::SERVFAIL
    }

    /// NOERROR and NXDOMAIN are terminal answers; everything else makes
    /// the dispatcher try the next candidate.
    #[inline]
    pub fn is_conclusive(self) -> bool {
        matches!(self, Self::NOERROR | Self::NXDOMAIN)
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::NOERROR => "NOERROR",
            Self::FORMERR => "FORMERR",
            Self::SERVFAIL => "SERVFAIL",
            Self::NXDOMAIN => "NXDOMAIN",
            Self::NOTIMP => "NOTIMP",
            Self::REFUSED => "REFUSED",
            Rcode(n) => return write!(f, "RCODE{}", n),
        };
        f.write_str(s)
    }
}
