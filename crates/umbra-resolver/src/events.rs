//! Observer interface for validation and NAT64 events.

use crate::identity::ServerIdentity;
use crate::NetId;
use std::net::Ipv6Addr;

/// Consumer of resolver events (typically the metrics layer).
///
/// Implementations must not block: events are emitted from the
/// validation path and, for NAT64, from the configuration path. An
/// observer that needs to do real work should hand the event off to its
/// own queue.
pub trait ValidationObserver: Send + Sync {
    /// One event per terminal validation transition for a server.
    fn on_private_dns_validation(
        &self,
        netid: NetId,
        identity: &ServerIdentity,
        success: bool,
    );

    /// The network gained (`added`) or lost a NAT64 prefix.
    fn on_nat64_prefix_update(&self, netid: NetId, added: bool, prefix: Ipv6Addr, prefix_len: u8);
}

/// Observer that drops every event.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl ValidationObserver for NoopObserver {
    fn on_private_dns_validation(&self, _: NetId, _: &ServerIdentity, _: bool) {}

    fn on_nat64_prefix_update(&self, _: NetId, _: bool, _: Ipv6Addr, _: u8) {}
}
