//! Cached answers.

use bytes::Bytes;
use std::time::{Duration, Instant};

/// A cached DNS answer: the response bytes as received, an absolute
/// expiry, and the flags the dispatcher cares about.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    wire: Bytes,
    created_at: Instant,
    expires_at: Instant,
    negative: bool,
    synthesized: bool,
}

impl CacheEntry {
    pub fn new(wire: Bytes, ttl: Duration, negative: bool) -> Self {
        let now = Instant::now();
        Self {
            wire,
            created_at: now,
            expires_at: now + ttl,
            negative,
            synthesized: false,
        }
    }

    /// Marks the entry as assembled from NAT64 synthesis.
    pub fn synthesized(mut self) -> Self {
        self.synthesized = true;
        self
    }

    pub fn wire(&self) -> &Bytes {
        &self.wire
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn is_synthesized(&self) -> bool {
        self.synthesized
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Produces response bytes for a waiting query: the stored message
    /// with TTLs aged to the remaining lifetime and the caller's ID.
    pub fn answer_for(&self, query_id: u16, now: Instant) -> Vec<u8> {
        let mut out = self.wire.to_vec();
        let remaining = self.remaining_ttl(now).as_secs().min(u64::from(u32::MAX)) as u32;
        // A malformed stored message is impossible here; entries are
        // only built from responses that parsed.
        let _ = umbra_proto::message::rewrite_ttls(&mut out, remaining);
        umbra_proto::message::set_raw_id(&mut out, query_id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let e = CacheEntry::new(Bytes::new(), Duration::from_secs(10), false);
        let now = Instant::now();
        assert!(!e.is_expired(now));
        assert!(e.remaining_ttl(now) <= Duration::from_secs(10));
        assert!(e.is_expired(now + Duration::from_secs(11)));
        assert_eq!(e.remaining_ttl(now + Duration::from_secs(11)), Duration::ZERO);
    }

    #[test]
    fn test_flags() {
        let e = CacheEntry::new(Bytes::new(), Duration::from_secs(1), true).synthesized();
        assert!(e.is_negative());
        assert!(e.is_synthesized());
    }
}
