//! Per-network private-DNS configuration.
//!
//! A process-global [`Registry`] maps network ids to records. Mutation
//! (the `set`/`clear`/options calls from the RPC layer) goes through a
//! tracker behind a mutex; the query path never takes that lock — it
//! reads an immutable [`NetworkSnapshot`] pinned through `arc-swap`.
//!
//! Servers removed by a configuration change stay in the tracker as
//! inactive while a validation probe still references them; snapshots
//! only ever expose active servers, so queries cannot reach them.

use crate::do53::{Do53Transport, TcMode};
use crate::doh::{DohConfig, DohEndpoint, DohTransport};
use crate::dot::{DotConfig, DotTransport};
use crate::identity::{ServerEntry, ServerIdentity, ValidationState};
use crate::nat64::Nat64State;
use crate::stats::NetworkStats;
use crate::{
    NetId, PrivateDnsMode, ResolveError, ResolverParams, Result, TransportPolicy, TransportType,
};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};
use umbra_cache::{CacheConfig, ResponseCache};

/// UIDs treated as privileged callers for CA-override installation.
const AID_ROOT: u32 = 0;
const AID_SYSTEM: u32 = 1000;

/// Maximum number of search domains kept after deduplication.
const MAX_SEARCH_DOMAINS: usize = 6;

/// Maximum length of a single search domain.
const MAX_SEARCH_DOMAIN_LEN: usize = 255;

/// Explicit DoH parameters from the RPC layer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DohParams {
    pub name: String,
    pub ips: Vec<IpAddr>,
    pub dohpath: String,
    pub port: u16,
}

/// A custom hosts mapping consulted before any DNS transport.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CustomHost {
    pub ip: IpAddr,
    pub name: String,
}

/// Per-network resolver options set independently of the server list.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResolverOptions {
    pub tc_mode: TcMode,
    /// UIDs whose queries are refused locally.
    pub blocked_uids: Vec<u32>,
    pub custom_hosts: Vec<CustomHost>,
    /// Cleared when the network only has link-local IPv6 without a
    /// default route; suppresses the AAAA leg of parallel lookups.
    pub ipv6_available: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            tc_mode: TcMode::Default,
            blocked_uids: Vec::new(),
            custom_hosts: Vec::new(),
            ipv6_available: true,
        }
    }
}

/// Arguments to [`Registry::set_resolver_configuration`].
#[derive(Debug, Clone)]
pub struct SetConfigurationRequest {
    pub netid: NetId,
    pub caller_uid: u32,
    pub mode: PrivateDnsMode,
    /// Cleartext servers, `"ip"` or `"ip:port"`.
    pub plaintext_servers: Vec<String>,
    /// Encrypted (DoT) servers, `"ip"` or `"ip:port"`.
    pub encrypted_servers: Vec<String>,
    /// Private-DNS hostname; required non-empty in strict mode.
    pub private_dns_hostname: String,
    pub domains: Vec<String>,
    pub params: ResolverParams,
    pub ca_certificate: Option<String>,
    pub doh_params: Option<DohParams>,
    pub transports: Vec<TransportType>,
    pub policy: TransportPolicy,
    /// Optional options bundle; otherwise the last value set through
    /// [`Registry::set_resolver_options`] is kept.
    pub options: Option<ResolverOptions>,
}

/// DoH server record in a snapshot or status view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DohServerInfo {
    pub endpoint: DohEndpoint,
    pub state: ValidationState,
}

/// Snapshot view returned by [`Registry::get_status`].
#[derive(Debug, Clone)]
pub struct PrivateDnsStatus {
    pub mode: PrivateDnsMode,
    pub dot_servers: Vec<(ServerIdentity, ValidationState)>,
    pub doh_servers: Vec<DohServerInfo>,
}

impl PrivateDnsStatus {
    pub fn validated_dot_servers(&self) -> Vec<ServerIdentity> {
        self.dot_servers
            .iter()
            .filter(|(_, state)| state.is_success())
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    pub fn has_validated_doh(&self) -> bool {
        self.doh_servers.iter().any(|info| info.state.is_success())
    }
}

/// Immutable per-network view read by the query path.
#[derive(Debug, Clone)]
pub struct NetworkSnapshot {
    pub netid: NetId,
    pub generation: u64,
    pub mode: PrivateDnsMode,
    pub do53_servers: Vec<SocketAddr>,
    pub dot_servers: Vec<(ServerIdentity, ValidationState)>,
    pub doh_server: Option<DohServerInfo>,
    pub strict_hostname: Option<String>,
    pub search_domains: Vec<String>,
    pub params: ResolverParams,
    pub policy: TransportPolicy,
    pub transports: Vec<TransportType>,
    pub options: ResolverOptions,
}

impl NetworkSnapshot {
    fn empty(netid: NetId) -> Self {
        Self {
            netid,
            generation: 0,
            mode: PrivateDnsMode::Off,
            do53_servers: Vec::new(),
            dot_servers: Vec::new(),
            doh_server: None,
            strict_hostname: None,
            search_domains: Vec::new(),
            params: ResolverParams::default(),
            policy: TransportPolicy::default(),
            transports: vec![TransportType::Do53, TransportType::Dot, TransportType::Doh],
            options: ResolverOptions::default(),
        }
    }

    pub fn validated_dot_servers(&self) -> Vec<ServerIdentity> {
        self.dot_servers
            .iter()
            .filter(|(_, state)| state.is_success())
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    pub fn allows_transport(&self, transport: TransportType) -> bool {
        self.transports.contains(&transport)
    }
}

/// What the validation engine should probe after a configuration change.
#[derive(Debug, Clone)]
pub enum ValidationRequest {
    Dot {
        identity: ServerIdentity,
        generation: u64,
    },
    Doh {
        endpoint: DohEndpoint,
        generation: u64,
    },
}

/// Outcome of publishing a validation result.
#[derive(Debug, PartialEq, Eq)]
pub enum PublishResult {
    /// State recorded; `emit` says whether the observer should hear
    /// about it (terminal transitions only, deduplicated).
    Applied { emit: bool },
    /// The result belongs to an older configuration and was discarded.
    Stale,
}

struct Tracker {
    generation: u64,
    mode: PrivateDnsMode,
    do53_servers: Vec<SocketAddr>,
    dot_entries: Vec<ServerEntry>,
    doh_server: Option<DohServerInfo>,
    strict_hostname: Option<String>,
    ca_certificate: Option<String>,
    search_domains: Vec<String>,
    params: ResolverParams,
    policy: TransportPolicy,
    transports: Vec<TransportType>,
    options: ResolverOptions,
    /// Last outcome reported per server, for event deduplication.
    last_reported: HashMap<ServerIdentity, bool>,
    /// Servers with a probe task in flight, keyed to the configuration
    /// generation that spawned the probe. A newer generation may start
    /// its own probe while a stale one drains.
    probing: HashMap<ServerIdentity, u64>,
}

impl Tracker {
    fn new() -> Self {
        Self {
            generation: 0,
            mode: PrivateDnsMode::Off,
            do53_servers: Vec::new(),
            dot_entries: Vec::new(),
            doh_server: None,
            strict_hostname: None,
            ca_certificate: None,
            search_domains: Vec::new(),
            params: ResolverParams::default(),
            policy: TransportPolicy::default(),
            transports: vec![TransportType::Do53, TransportType::Dot, TransportType::Doh],
            options: ResolverOptions::default(),
            last_reported: HashMap::new(),
            probing: HashMap::new(),
        }
    }

    fn entry_mut(&mut self, identity: &ServerIdentity) -> Option<&mut ServerEntry> {
        self.dot_entries
            .iter_mut()
            .find(|entry| &entry.identity == identity)
    }

    /// Drops inactive entries without a running probe.
    fn purge_inactive(&mut self) {
        let probing: HashSet<ServerIdentity> = self.probing.keys().cloned().collect();
        self.dot_entries
            .retain(|entry| entry.active || probing.contains(&entry.identity));
    }

    fn snapshot(&self, netid: NetId) -> NetworkSnapshot {
        NetworkSnapshot {
            netid,
            generation: self.generation,
            mode: self.mode,
            do53_servers: self.do53_servers.clone(),
            dot_servers: self
                .dot_entries
                .iter()
                .filter(|entry| entry.active)
                .map(|entry| (entry.identity.clone(), entry.state))
                .collect(),
            doh_server: self.doh_server.clone(),
            strict_hostname: self.strict_hostname.clone(),
            search_domains: self.search_domains.clone(),
            params: self.params.clone(),
            policy: self.policy.clone(),
            transports: self.transports.clone(),
            options: self.options.clone(),
        }
    }
}

/// One network's record: mutable tracker, swap-published snapshot, and
/// the per-network collaborators the dispatcher needs.
pub struct NetworkHandle {
    pub netid: NetId,
    tracker: Mutex<Tracker>,
    snapshot: ArcSwap<NetworkSnapshot>,
    pub cache: Arc<ResponseCache>,
    pub stats: Arc<NetworkStats>,
    pub nat64: Arc<Nat64State>,
    pub do53: Arc<Do53Transport>,
    dot: ArcSwap<DotTransport>,
    doh: ArcSwap<DohTransport>,
}

impl NetworkHandle {
    fn new(netid: NetId) -> Self {
        Self {
            netid,
            tracker: Mutex::new(Tracker::new()),
            snapshot: ArcSwap::from_pointee(NetworkSnapshot::empty(netid)),
            cache: ResponseCache::new(CacheConfig::default()),
            stats: Arc::new(NetworkStats::new()),
            nat64: Arc::new(Nat64State::new()),
            do53: Arc::new(Do53Transport::new()),
            dot: ArcSwap::from_pointee(DotTransport::new(DotConfig::default())),
            doh: ArcSwap::from_pointee(DohTransport::new(DohConfig::default())),
        }
    }

    /// Pins the current snapshot.
    pub fn snapshot(&self) -> Arc<NetworkSnapshot> {
        self.snapshot.load_full()
    }

    pub fn dot(&self) -> Arc<DotTransport> {
        self.dot.load_full()
    }

    pub fn doh(&self) -> Arc<DohTransport> {
        self.doh.load_full()
    }

    fn republish(&self, tracker: &Tracker) {
        self.snapshot.store(Arc::new(tracker.snapshot(self.netid)));
    }
}

/// Process-global registry of per-network private-DNS state.
#[derive(Default)]
pub struct Registry {
    networks: DashMap<NetId, Arc<NetworkHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle for `netid`, creating the record on first use.
    pub fn network(&self, netid: NetId) -> Arc<NetworkHandle> {
        self.networks
            .entry(netid)
            .or_insert_with(|| Arc::new(NetworkHandle::new(netid)))
            .clone()
    }

    /// The handle for `netid` if the network exists.
    pub fn get(&self, netid: NetId) -> Option<Arc<NetworkHandle>> {
        self.networks.get(&netid).map(|h| Arc::clone(h.value()))
    }

    /// Installs a new configuration atomically and returns the probes
    /// the validation engine should launch.
    pub fn set_resolver_configuration(
        &self,
        request: SetConfigurationRequest,
    ) -> Result<Vec<ValidationRequest>> {
        if request.ca_certificate.is_some()
            && request.caller_uid != AID_ROOT
            && request.caller_uid != AID_SYSTEM
        {
            return Err(ResolveError::PermissionDenied(
                "CA certificate requires a system caller",
            ));
        }
        if request.mode == PrivateDnsMode::Strict && request.private_dns_hostname.is_empty() {
            return Err(ResolveError::InvalidArgument(
                "strict mode requires a private DNS hostname".into(),
            ));
        }

        let do53_servers = parse_servers(&request.plaintext_servers, 53)?;
        let dot_addrs = parse_servers(&request.encrypted_servers, 853)?;
        let provider = if request.mode == PrivateDnsMode::Strict {
            request.private_dns_hostname.clone()
        } else {
            String::new()
        };

        let handle = self.network(request.netid);
        let mut tracker = handle.tracker.lock();
        tracker.generation += 1;
        let generation = tracker.generation;

        tracker.mode = request.mode;
        tracker.do53_servers = do53_servers;
        tracker.strict_hostname = if request.private_dns_hostname.is_empty() {
            None
        } else {
            Some(request.private_dns_hostname.clone())
        };
        tracker.ca_certificate = request.ca_certificate.clone();
        tracker.search_domains = normalize_search_domains(&request.domains);
        tracker.params = request.params.normalize();
        tracker.policy = request.policy.normalize();
        tracker.transports = if request.transports.is_empty() {
            vec![TransportType::Do53, TransportType::Dot, TransportType::Doh]
        } else {
            request.transports.clone()
        };
        if let Some(options) = request.options.clone() {
            tracker.options = options;
        }

        // Reconcile DoT entries: retain state for identities that stay,
        // deactivate the rest, add newcomers.
        let new_identities: Vec<ServerIdentity> = match request.mode {
            PrivateDnsMode::Off => Vec::new(),
            _ => dot_addrs
                .iter()
                .map(|addr| ServerIdentity::new(*addr, provider.clone()))
                .collect(),
        };
        for entry in &mut tracker.dot_entries {
            entry.active = new_identities.contains(&entry.identity);
        }
        let mut to_validate = Vec::new();
        for identity in &new_identities {
            match tracker.entry_mut(identity) {
                Some(entry) => {
                    entry.active = true;
                    // A server that previously failed gets a fresh start
                    // under the new configuration.
                    if entry.state == ValidationState::Fail {
                        entry.state = ValidationState::Unknown;
                        entry.attempts = 0;
                    }
                }
                None => tracker.dot_entries.push(ServerEntry::new(identity.clone())),
            }
            // Probe servers that are not yet validated, unless a probe
            // for this very generation is already in flight. A probe
            // left over from an older generation publishes into the
            // void, so it does not count.
            let state = tracker.entry_mut(identity).map(|entry| entry.state);
            let probe_current = tracker
                .probing
                .get(identity)
                .map_or(false, |&g| g >= generation);
            if matches!(
                state,
                Some(ValidationState::Unknown) | Some(ValidationState::InProgress)
            ) && !probe_current
            {
                to_validate.push(ValidationRequest::Dot {
                    identity: identity.clone(),
                    generation,
                });
            }
        }
        tracker.purge_inactive();

        // DoH: explicit parameters win; otherwise the built-in provider
        // table maps the configured servers or hostname to a template.
        let caller_is_system =
            request.caller_uid == AID_ROOT || request.caller_uid == AID_SYSTEM;
        let new_doh = if request.mode == PrivateDnsMode::Off {
            None
        } else {
            make_doh_endpoint(
                &request.doh_params,
                &dot_addrs,
                &request.private_dns_hostname,
                caller_is_system,
            )
        };
        match (&tracker.doh_server, &new_doh) {
            (Some(old), Some(new)) if old.endpoint == *new => {
                // Same endpoint: keep its state, but restart the probe
                // when an unfinished one belongs to an older generation.
                if !old.state.is_success() {
                    let identity = new.identity();
                    let probe_current = tracker
                        .probing
                        .get(&identity)
                        .map_or(false, |&g| g >= generation);
                    if !probe_current {
                        to_validate.push(ValidationRequest::Doh {
                            endpoint: new.clone(),
                            generation,
                        });
                    }
                }
            }
            (_, Some(new)) => {
                tracker.doh_server = Some(DohServerInfo {
                    endpoint: new.clone(),
                    state: ValidationState::InProgress,
                });
                to_validate.push(ValidationRequest::Doh {
                    endpoint: new.clone(),
                    generation,
                });
            }
            (_, None) => tracker.doh_server = None,
        }

        // Rebuild transports for the new TLS parameters.
        handle.dot.store(Arc::new(DotTransport::new(DotConfig {
            connect_timeout: tracker.policy.dot_connect_timeout,
            query_timeout: tracker.policy.dot_query_timeout,
            async_handshake: tracker.policy.dot_async_handshake,
            max_tries: tracker.policy.dot_max_tries,
            latency_factor: tracker.policy.dot_validation_latency_factor,
            latency_offset: tracker.policy.dot_validation_latency_offset,
            ca_override_pem: tracker.ca_certificate.clone(),
        })));
        handle.doh.store(Arc::new(DohTransport::new(DohConfig {
            query_timeout: tracker.policy.doh_query_timeout,
            probe_timeout: tracker.policy.doh_probe_timeout,
            idle_timeout: tracker.policy.doh_idle_timeout,
            connect_timeout: tracker.policy.dot_connect_timeout.max(
                std::time::Duration::from_secs(5),
            ),
            ca_override_pem: tracker.ca_certificate.clone(),
        })));

        // Health samples for servers that left the configuration are
        // no longer meaningful.
        let keep: HashSet<ServerIdentity> = tracker
            .dot_entries
            .iter()
            .filter(|entry| entry.active)
            .map(|entry| entry.identity.clone())
            .chain(
                tracker
                    .do53_servers
                    .iter()
                    .map(|addr| ServerIdentity::anonymous(*addr)),
            )
            .chain(tracker.doh_server.iter().map(|info| info.endpoint.identity()))
            .collect();
        handle.stats.retain(|identity| keep.contains(identity));

        handle.republish(&tracker);
        info!(
            netid = request.netid,
            mode = ?tracker.mode,
            do53 = tracker.do53_servers.len(),
            dot = new_identities.len(),
            doh = tracker.doh_server.is_some(),
            generation,
            "resolver configuration installed"
        );
        Ok(to_validate)
    }

    /// Updates options that are orthogonal to the server list.
    pub fn set_resolver_options(&self, netid: NetId, options: ResolverOptions) -> Result<()> {
        let handle = self.get(netid).ok_or(ResolveError::NotFound)?;
        let mut tracker = handle.tracker.lock();
        tracker.options = options;
        handle.republish(&tracker);
        Ok(())
    }

    /// Read-only status view for the RPC layer.
    pub fn get_status(&self, netid: NetId) -> Option<PrivateDnsStatus> {
        let handle = self.get(netid)?;
        let snapshot = handle.snapshot();
        Some(PrivateDnsStatus {
            mode: snapshot.mode,
            dot_servers: snapshot.dot_servers.clone(),
            doh_servers: snapshot.doh_server.clone().into_iter().collect(),
        })
    }

    /// Active, validated DoT servers ordered by the health policy.
    pub fn validated_servers(&self, netid: NetId) -> Vec<ServerIdentity> {
        let Some(handle) = self.get(netid) else {
            return Vec::new();
        };
        let snapshot = handle.snapshot();
        handle
            .stats
            .order_candidates(&snapshot.validated_dot_servers(), &snapshot.params)
    }

    /// Transitions the network to OFF and drops encrypted servers.
    pub fn clear(&self, netid: NetId) {
        if let Some(handle) = self.get(netid) {
            let mut tracker = handle.tracker.lock();
            tracker.generation += 1;
            tracker.mode = PrivateDnsMode::Off;
            for entry in &mut tracker.dot_entries {
                entry.active = false;
            }
            tracker.purge_inactive();
            tracker.doh_server = None;
            tracker.strict_hostname = None;
            handle.dot().retain(|_| false);
            handle.doh().retain(|_| false);
            handle.republish(&tracker);
            debug!(netid, "private DNS configuration cleared");
        }
    }

    /// Creates the per-network record (idempotent).
    pub fn create_network(&self, netid: NetId) {
        let _ = self.network(netid);
    }

    /// Tears the network down: flushes its cache (waking pending
    /// queries) and forgets the record. Outstanding validations become
    /// stale through the generation bump implied by removal.
    pub fn destroy_network(&self, netid: NetId) -> Result<()> {
        let (_, handle) = self
            .networks
            .remove(&netid)
            .ok_or(ResolveError::NotFound)?;
        handle.cache.flush();
        handle.dot().retain(|_| false);
        handle.doh().retain(|_| false);
        info!(netid, "network destroyed");
        Ok(())
    }

    pub fn flush_network_cache(&self, netid: NetId) -> Result<()> {
        let handle = self.get(netid).ok_or(ResolveError::NotFound)?;
        handle.cache.flush();
        Ok(())
    }

    /// Marks a probe as started; refuses duplicates per (server,
    /// generation) — a newer generation supersedes a draining probe. A
    /// server that is already validated keeps its Success state while
    /// being re-probed, so the revalidation-threshold path does not
    /// knock it out of the validated set.
    pub fn begin_probe(&self, netid: NetId, identity: &ServerIdentity, generation: u64) -> bool {
        let Some(handle) = self.get(netid) else {
            return false;
        };
        let mut tracker = handle.tracker.lock();
        if tracker
            .probing
            .get(identity)
            .map_or(false, |&g| g >= generation)
        {
            return false;
        }
        tracker.probing.insert(identity.clone(), generation);
        if let Some(entry) = tracker.entry_mut(identity) {
            if entry.state == ValidationState::Unknown {
                entry.state = ValidationState::InProgress;
            }
            entry.attempts += 1;
        }
        handle.republish(&tracker);
        true
    }

    /// Removes a probe from the in-flight set, unless a newer
    /// generation has taken the slot over.
    pub fn end_probe(&self, netid: NetId, identity: &ServerIdentity, generation: u64) {
        if let Some(handle) = self.get(netid) {
            let mut tracker = handle.tracker.lock();
            if tracker.probing.get(identity) == Some(&generation) {
                tracker.probing.remove(identity);
            }
            tracker.purge_inactive();
            handle.republish(&tracker);
        }
    }

    /// Publishes a DoT probe outcome. A failed probe with a scheduled
    /// retry keeps the server `InProgress`; only giving up marks `Fail`.
    /// The new state becomes visible to queries (snapshot swap) before
    /// the caller emits any event; `emit` dedups repeated outcomes.
    pub fn publish_dot_outcome(
        &self,
        netid: NetId,
        identity: &ServerIdentity,
        generation: u64,
        success: bool,
        will_retry: bool,
    ) -> PublishResult {
        let Some(handle) = self.get(netid) else {
            return PublishResult::Stale;
        };
        let mut tracker = handle.tracker.lock();
        if tracker.generation != generation {
            return PublishResult::Stale;
        }
        let state = if success {
            ValidationState::Success
        } else if will_retry {
            ValidationState::InProgress
        } else {
            ValidationState::Fail
        };
        match tracker.entry_mut(identity) {
            Some(entry) if entry.active => entry.state = state,
            _ => return PublishResult::Stale,
        }
        let emit = tracker.last_reported.get(identity) != Some(&success);
        if emit {
            tracker.last_reported.insert(identity.clone(), success);
        }
        handle.republish(&tracker);
        PublishResult::Applied { emit }
    }

    /// Publishes a DoH probe outcome for the network's DoH server.
    pub fn publish_doh_outcome(
        &self,
        netid: NetId,
        endpoint: &DohEndpoint,
        generation: u64,
        success: bool,
        will_retry: bool,
    ) -> PublishResult {
        let Some(handle) = self.get(netid) else {
            return PublishResult::Stale;
        };
        let mut tracker = handle.tracker.lock();
        if tracker.generation != generation {
            return PublishResult::Stale;
        }
        let state = if success {
            ValidationState::Success
        } else if will_retry {
            ValidationState::InProgress
        } else {
            ValidationState::Fail
        };
        match &mut tracker.doh_server {
            Some(info) if info.endpoint == *endpoint => info.state = state,
            _ => return PublishResult::Stale,
        }
        let identity = endpoint.identity();
        let emit = tracker.last_reported.get(&identity) != Some(&success);
        if emit {
            tracker.last_reported.insert(identity, success);
        }
        handle.republish(&tracker);
        PublishResult::Applied { emit }
    }

    /// A revalidation request from the dispatcher. With `demote` the
    /// server is taken out of the validated set for the duration
    /// (unusable-threshold); without it the server keeps serving while
    /// the probe runs (revalidation-threshold).
    pub fn request_revalidation(
        &self,
        netid: NetId,
        identity: &ServerIdentity,
        demote: bool,
    ) -> Option<ValidationRequest> {
        let handle = self.get(netid)?;
        let mut tracker = handle.tracker.lock();
        let generation = tracker.generation;
        let probing = tracker.probing.contains_key(identity);
        let entry = tracker.entry_mut(identity)?;
        if !entry.active || probing {
            return None;
        }
        if demote {
            entry.state = ValidationState::InProgress;
        }
        handle.republish(&tracker);
        Some(ValidationRequest::Dot {
            identity: identity.clone(),
            generation,
        })
    }
}

/// Parses `"ip"` / `"ip:port"` strings, filtering duplicates while
/// preserving first-occurrence order.
fn parse_servers(servers: &[String], default_port: u16) -> Result<Vec<SocketAddr>> {
    let mut out = Vec::new();
    for server in servers {
        let addr = if let Ok(ip) = server.parse::<IpAddr>() {
            SocketAddr::new(ip, default_port)
        } else if let Ok(addr) = server.parse::<SocketAddr>() {
            addr
        } else {
            return Err(ResolveError::InvalidArgument(format!(
                "bad server address: {server}"
            )));
        };
        if !out.contains(&addr) {
            out.push(addr);
        }
    }
    Ok(out)
}

/// Deduplicates search domains preserving first occurrence, drops
/// over-length entries first, then caps the list. Stable under
/// repetition.
fn normalize_search_domains(domains: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    domains
        .iter()
        .filter(|domain| domain.len() <= MAX_SEARCH_DOMAIN_LEN)
        .filter(|domain| seen.insert(domain.to_ascii_lowercase()))
        .take(MAX_SEARCH_DOMAINS)
        .cloned()
        .collect()
}

struct DohProviderEntry {
    ips: &'static [&'static str],
    host: &'static str,
    template: &'static str,
    requires_privileged_caller: bool,
}

/// Built-in DoH providers recognized for auto-upgrade when no explicit
/// DoH parameters are supplied.
static KNOWN_DOH_PROVIDERS: &[DohProviderEntry] = &[
    DohProviderEntry {
        ips: &[
            "2001:4860:4860::8888",
            "2001:4860:4860::8844",
            "8.8.8.8",
            "8.8.4.4",
        ],
        host: "dns.google",
        template: "https://dns.google/dns-query",
        requires_privileged_caller: false,
    },
    DohProviderEntry {
        ips: &["2001:4860:4860::64", "2001:4860:4860::6464"],
        host: "dns64.dns.google",
        template: "https://dns64.dns.google/dns-query",
        requires_privileged_caller: false,
    },
    DohProviderEntry {
        ips: &[
            "2606:4700::6810:f8f9",
            "2606:4700::6810:f9f9",
            "104.16.248.249",
            "104.16.249.249",
        ],
        host: "cloudflare-dns.com",
        template: "https://cloudflare-dns.com/dns-query",
        requires_privileged_caller: false,
    },
    // Loopback provider for integration testing; gated on privilege.
    DohProviderEntry {
        ips: &["127.0.0.3", "::1"],
        host: "example.com",
        template: "https://example.com/dns-query",
        requires_privileged_caller: true,
    },
    DohProviderEntry {
        ips: &["192.0.2.100"],
        host: "dns.androidtesting.org",
        template: "https://dns.androidtesting.org/dns-query",
        requires_privileged_caller: false,
    },
];

/// Chooses the DoH endpoint: explicit parameters first, then the
/// provider table — hostname match preferred, IP match as fallback.
fn make_doh_endpoint(
    doh_params: &Option<DohParams>,
    servers: &[SocketAddr],
    hostname: &str,
    caller_is_system: bool,
) -> Option<DohEndpoint> {
    if let Some(params) = doh_params {
        let ip = params.ips.first()?;
        let port = if params.port == 0 { 443 } else { params.port };
        return Some(DohEndpoint {
            addr: SocketAddr::new(*ip, port),
            hostname: params.name.clone(),
            path: if params.dohpath.is_empty() {
                "/dns-query".to_string()
            } else {
                params.dohpath.clone()
            },
        });
    }

    for provider in KNOWN_DOH_PROVIDERS {
        if provider.requires_privileged_caller && !caller_is_system {
            continue;
        }
        if !hostname.is_empty() {
            if provider.host == hostname {
                if let Some(server) = servers.first() {
                    return DohEndpoint::from_template(
                        SocketAddr::new(server.ip(), 443),
                        provider.template,
                    );
                }
            }
            continue;
        }
        for server in servers {
            if provider.ips.iter().any(|ip| {
                ip.parse::<IpAddr>().map(|parsed| parsed == server.ip()).unwrap_or(false)
            }) {
                return DohEndpoint::from_template(
                    SocketAddr::new(server.ip(), 443),
                    provider.template,
                );
            }
        }
    }
    None
}
