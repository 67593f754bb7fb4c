//! # umbra DNS resolver core
//!
//! Private-DNS resolution core of a system resolver: per-network pools of
//! encrypted-DNS servers (DoT / DoH), asynchronous server validation with
//! backoff, per-server health statistics, and a query dispatcher that
//! routes recursive queries across Do53 / DoT / DoH while honoring the
//! network's privacy mode.
//!
//! ## Architecture
//!
//! - [`config::Registry`] holds one record per network. Mutation goes
//!   through a tracker behind a mutex; the query path reads an immutable
//!   snapshot pinned via `arc-swap`.
//! - [`validate::ValidationEngine`] runs at most one probe task per
//!   (network, server), retries with exponential backoff, and publishes
//!   results gated by a configuration generation counter.
//! - [`dispatch::Resolver`] is the entry point consumed by the RPC layer:
//!   the configuration API mutates the registry, the query API performs
//!   cache-coalesced, health-ordered, failover-capable exchanges.
//!
//! Privacy modes: **OFF** uses Do53 only. **OPPORTUNISTIC** prefers
//! validated encrypted transports but degrades to Do53. **STRICT** never
//! touches Do53; with nothing validated, queries fail hard.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod do53;
pub mod doh;
pub mod dot;
pub mod events;
pub mod identity;
pub mod nat64;
pub mod stats;
pub mod validate;

pub use config::{PrivateDnsStatus, Registry};
pub use dispatch::Resolver;
pub use events::ValidationObserver;
pub use identity::{ServerIdentity, ValidationState};

/// Network identifier, assigned by the host OS.
pub type NetId = u32;

/// Per-network privacy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivateDnsMode {
    /// Cleartext Do53 only.
    #[default]
    Off,
    /// Encrypted transports preferred, Do53 fallback allowed.
    Opportunistic,
    /// Encrypted transports only; no Do53 fallback.
    Strict,
}

impl PrivateDnsMode {
    pub fn allows_do53(self) -> bool {
        !matches!(self, Self::Strict)
    }
}

/// Transport families a network is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Do53,
    Dot,
    Doh,
}

bitflags::bitflags! {
    /// Per-query flags from the stub resolver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueryFlags: u32 {
        /// Skip the cache lookup stage.
        const NO_CACHE_LOOKUP = 1 << 0;
        /// Do not store the answer. Implies `NO_CACHE_LOOKUP`.
        const NO_CACHE_STORE = 1 << 1;
        /// Give up after the first failed candidate.
        const NO_RETRY = 1 << 2;
        /// Route to the network's local nameservers regardless of mode.
        const USE_LOCAL_NAMESERVERS = 1 << 3;
        /// Internal: bypass private DNS (NAT64 prefix discovery).
        const BYPASS_PRIVATE_DNS = 1 << 16;
    }
}

impl QueryFlags {
    /// `NO_CACHE_STORE` implies skipping the lookup too, so a stale
    /// entry can never be refreshed by a non-storing query.
    pub fn skips_cache_lookup(self) -> bool {
        self.intersects(Self::NO_CACHE_LOOKUP | Self::NO_CACHE_STORE)
    }

    pub fn skips_cache_store(self) -> bool {
        self.contains(Self::NO_CACHE_STORE)
    }
}

/// Error taxonomy shared by the configuration and query APIs.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("timeout")]
    Timeout,

    #[error("network unreachable: {0}")]
    NetworkUnreachable(#[from] std::io::Error),

    #[error("refused by server")]
    Refused,

    #[error("malformed message: {0}")]
    FormErr(#[from] umbra_proto::ProtoError),

    #[error("SERVFAIL from all candidates")]
    ServFail,

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("TLS certificate does not match {expected}")]
    TlsNameMismatch { expected: String },

    #[error("no validated private DNS server")]
    PrivateDnsValidationFailed,

    #[error("cache flushed during query")]
    CacheFlushed,

    #[error("blocked by UID policy")]
    BlockedByPolicy,
}

/// Result alias for resolver operations.
pub type Result<T> = std::result::Result<T, ResolveError>;

/// Per-network resolver parameters, as passed by the RPC layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverParams {
    /// How long a health sample stays relevant.
    pub sample_validity: Duration,

    /// Minimum success ratio (percent) for a server to stay usable.
    pub success_threshold_pct: u8,

    /// Samples required before the threshold applies.
    pub min_samples: usize,

    /// Ring capacity for health samples.
    pub max_samples: usize,

    /// First-attempt query timeout.
    pub base_timeout: Duration,

    /// Per-server attempt count.
    pub retry_count: usize,
}

impl Default for ResolverParams {
    fn default() -> Self {
        Self {
            sample_validity: Duration::from_secs(1800),
            success_threshold_pct: 75,
            min_samples: 3,
            max_samples: 8,
            base_timeout: Duration::from_millis(5000),
            retry_count: 2,
        }
    }
}

impl ResolverParams {
    /// Coerces out-of-range values to defaults; idempotent.
    pub fn normalize(mut self) -> Self {
        let defaults = Self::default();
        if self.base_timeout.is_zero() {
            self.base_timeout = defaults.base_timeout;
        }
        if self.retry_count == 0 {
            self.retry_count = defaults.retry_count;
        }
        if self.max_samples == 0 || self.max_samples > 64 {
            self.max_samples = defaults.max_samples;
        }
        if self.min_samples == 0 || self.min_samples > self.max_samples {
            self.min_samples = defaults.min_samples.min(self.max_samples);
        }
        if self.success_threshold_pct > 100 {
            self.success_threshold_pct = defaults.success_threshold_pct;
        }
        if self.sample_validity.is_zero() {
            self.sample_validity = defaults.sample_validity;
        }
        self
    }
}

/// Transport policy knobs, read at network (re)configuration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportPolicy {
    /// DoT connect timeout; values below one second are raised to it.
    pub dot_connect_timeout: Duration,

    /// DoT per-query timeout; `None` means unbounded.
    pub dot_query_timeout: Option<Duration>,

    /// Share one in-flight handshake among concurrent DoT queries.
    pub dot_async_handshake: bool,

    /// Connect attempts per DoT query when not sharing handshakes.
    pub dot_max_tries: u32,

    /// Consecutive timed-out queries before a DoT server is marked
    /// temporarily unusable; `None` disables.
    pub dot_unusable_threshold: Option<u32>,

    /// Consecutive timeouts on an established connection before a
    /// revalidation probe is requested; `None` disables.
    pub dot_revalidation_threshold: Option<u32>,

    /// In opportunistic mode, fall straight back to Do53 when the first
    /// DoT server does not answer the handshake.
    pub dot_quick_fallback: bool,

    /// UDP pre-probe gating for validation; `None` disables the check.
    pub dot_validation_latency_factor: Option<u32>,
    pub dot_validation_latency_offset: Option<Duration>,

    /// Gap between the A and AAAA legs of a parallel lookup.
    pub parallel_lookup_sleep: Duration,

    /// Keep listening on the previous UDP socket across retries.
    pub keep_listening_udp: bool,

    /// Order Do53 servers by health statistics instead of config order.
    pub sort_nameservers: bool,

    /// DoH timeouts.
    pub doh_query_timeout: Duration,
    pub doh_probe_timeout: Duration,
    pub doh_idle_timeout: Duration,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            dot_connect_timeout: Duration::from_millis(1000),
            dot_query_timeout: None,
            dot_async_handshake: false,
            dot_max_tries: 3,
            dot_unusable_threshold: None,
            dot_revalidation_threshold: None,
            dot_quick_fallback: true,
            dot_validation_latency_factor: Some(3),
            dot_validation_latency_offset: Some(Duration::from_millis(100)),
            parallel_lookup_sleep: Duration::ZERO,
            keep_listening_udp: false,
            sort_nameservers: false,
            doh_query_timeout: Duration::from_millis(30_000),
            doh_probe_timeout: Duration::from_millis(60_000),
            doh_idle_timeout: Duration::from_millis(55_000),
        }
    }
}

impl TransportPolicy {
    /// Applies the documented clamps; idempotent.
    pub fn normalize(mut self) -> Self {
        if self.dot_connect_timeout < Duration::from_millis(1000) {
            self.dot_connect_timeout = Duration::from_millis(1000);
        }
        if self.dot_max_tries == 0 {
            self.dot_max_tries = 1;
        }
        self
    }
}
