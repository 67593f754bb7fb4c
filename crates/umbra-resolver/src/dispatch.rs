//! Query dispatch.
//!
//! The [`Resolver`] is the public face of the crate: the configuration
//! API forwards to the registry and validation engine, and the query API
//! runs each request through the dispatch pipeline: custom hosts, UID
//! policy, cache (with coalescing), transport selection by privacy
//! mode, health-ordered failover, and NAT64 synthesis.

use crate::config::{
    NetworkHandle, NetworkSnapshot, PrivateDnsStatus, Registry, ResolverOptions,
    SetConfigurationRequest,
};
use crate::do53::{Do53Outcome, TransportError, UdpSession};
use crate::dot::DotError;
use crate::events::ValidationObserver;
use crate::identity::ServerIdentity;
use crate::nat64::{self, Nat64Prefix};
use crate::stats::QueryOutcome;
use crate::validate::ValidationEngine;
use crate::{
    NetId, PrivateDnsMode, QueryFlags, ResolveError, Result, TransportType,
};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use umbra_cache::{CacheEntry, CacheKey, CacheLookup};
use umbra_proto::{message, Message, Name, Question, Rcode, RecordType, ResourceRecord};

/// Cap on a single attempt's timeout regardless of backoff growth.
const MAX_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Address family requested through [`Resolver::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
    Unspec,
}

/// The resolver core: configuration plane plus query plane.
pub struct Resolver {
    registry: Arc<Registry>,
    engine: Arc<ValidationEngine>,
}

impl Resolver {
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let engine = ValidationEngine::new(registry.clone());
        Arc::new(Self { registry, engine })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn set_observer(&self, observer: Arc<dyn ValidationObserver>) {
        self.engine.set_observer(observer);
    }

    // ========================================================================
    // Configuration API
    // ========================================================================

    /// Installs a network configuration and kicks off validation.
    pub fn set_resolver_configuration(&self, request: SetConfigurationRequest) -> Result<()> {
        let netid = request.netid;
        let to_validate = self.registry.set_resolver_configuration(request)?;
        self.engine.launch(netid, to_validate);
        Ok(())
    }

    pub fn create_network_cache(&self, netid: NetId) {
        self.registry.create_network(netid);
    }

    pub fn destroy_network_cache(&self, netid: NetId) -> Result<()> {
        self.registry.destroy_network(netid)
    }

    pub fn flush_network_cache(&self, netid: NetId) -> Result<()> {
        self.registry.flush_network_cache(netid)
    }

    pub fn clear(&self, netid: NetId) {
        self.registry.clear(netid);
    }

    pub fn get_status(&self, netid: NetId) -> Option<PrivateDnsStatus> {
        self.registry.get_status(netid)
    }

    pub fn set_resolver_options(&self, netid: NetId, options: ResolverOptions) -> Result<()> {
        self.registry.set_resolver_options(netid, options)
    }

    // ========================================================================
    // NAT64 prefix API
    // ========================================================================

    /// Sets (or, with an empty string, clears) the network's /96 prefix.
    pub fn set_prefix64(&self, netid: NetId, prefix: &str) -> Result<()> {
        let handle = self.registry.get(netid).ok_or(ResolveError::NotFound)?;
        if prefix.is_empty() {
            let removed = handle.nat64.clear_prefix()?;
            self.engine_observer_prefix(netid, false, removed);
            return Ok(());
        }
        let parsed = Nat64Prefix::from_str(prefix)?;
        if handle.nat64.set_prefix(parsed)? {
            self.engine_observer_prefix(netid, true, parsed);
        }
        Ok(())
    }

    pub fn get_prefix64(&self, netid: NetId) -> Option<Nat64Prefix> {
        self.registry.get(netid)?.nat64.prefix()
    }

    /// Starts prefix discovery: an AAAA query for `ipv4only.arpa` that
    /// bypasses private DNS. A discovery already in flight is rejected
    /// with `AlreadyExists`.
    pub fn start_prefix64_discovery(self: &Arc<Self>, netid: NetId) -> Result<()> {
        let handle = self.registry.get(netid).ok_or(ResolveError::NotFound)?;
        let Some(generation) = handle.nat64.begin_discovery() else {
            return Err(ResolveError::AlreadyExists);
        };

        let resolver = self.clone();
        tokio::spawn(async move {
            let name = match Name::from_str(nat64::IPV4ONLY_ARPA) {
                Ok(name) => name,
                Err(_) => return,
            };
            let query = Message::query(Question::aaaa(name));
            let flags = QueryFlags::BYPASS_PRIVATE_DNS | QueryFlags::NO_CACHE_STORE;
            let result = resolver.query(netid, 0, &query.to_wire(), flags).await;

            let Some(handle) = resolver.registry.get(netid) else {
                return;
            };
            let prefix = result
                .ok()
                .and_then(|bytes| Message::parse(&bytes).ok())
                .and_then(|msg| nat64::prefix_from_discovery_answer(&msg));
            match prefix {
                Some(prefix) => {
                    if handle.nat64.publish_discovered(generation, prefix) {
                        debug!(netid, %prefix, "NAT64 prefix discovered");
                        resolver.engine_observer_prefix(netid, true, prefix);
                    }
                }
                None => {
                    trace!(netid, "NAT64 prefix discovery found nothing");
                    handle.nat64.stop_discovery();
                }
            }
        });
        Ok(())
    }

    pub fn stop_prefix64_discovery(&self, netid: NetId) -> Result<()> {
        let handle = self.registry.get(netid).ok_or(ResolveError::NotFound)?;
        handle.nat64.stop_discovery();
        Ok(())
    }

    fn engine_observer_prefix(&self, netid: NetId, added: bool, prefix: Nat64Prefix) {
        // NAT64 updates share the validation observer.
        self.engine.notify_nat64(netid, added, prefix);
    }

    // ========================================================================
    // Query API
    // ========================================================================

    /// Resolves a raw wire query for `netid`, returning answer bytes.
    pub async fn query(
        &self,
        netid: NetId,
        uid: u32,
        query: &[u8],
        flags: QueryFlags,
    ) -> Result<Vec<u8>> {
        let handle = self.registry.get(netid).ok_or(ResolveError::NotFound)?;
        let snapshot = handle.snapshot();

        if snapshot.options.blocked_uids.contains(&uid) {
            return Err(ResolveError::BlockedByPolicy);
        }

        let parsed = Message::parse(query)?;
        let question = parsed
            .question()
            .cloned()
            .ok_or_else(|| ResolveError::InvalidArgument("query without question".into()))?;
        let query_id = parsed.id();

        // Custom hosts bypass DNS entirely; answers keep entry order.
        if let Some(answer) = custom_hosts_answer(&snapshot, &parsed, &question) {
            return Ok(answer);
        }

        if flags.skips_cache_lookup() {
            let (bytes, _entry) = self
                .exchange_and_postprocess(&handle, &snapshot, query, &question, flags)
                .await?;
            return Ok(bytes);
        }

        let key = CacheKey::from_question(&question);
        loop {
            match handle.cache.lookup(&key, query_id) {
                CacheLookup::Hit(bytes) => return Ok(bytes),
                CacheLookup::Wait(waiter) => {
                    waiter.wait().await;
                    continue;
                }
                CacheLookup::Miss(guard) => {
                    let result = self
                        .exchange_and_postprocess(&handle, &snapshot, query, &question, flags)
                        .await;
                    return match result {
                        Ok((bytes, Some(entry))) if !flags.skips_cache_store() => {
                            guard.complete(entry);
                            Ok(bytes)
                        }
                        Ok((bytes, _)) => {
                            guard.abandon();
                            Ok(bytes)
                        }
                        Err(e) => {
                            guard.abandon();
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Name-resolution entry: combines A and AAAA per policy and orders
    /// the result by RFC 6724 precedence.
    pub async fn resolve(
        &self,
        netid: NetId,
        uid: u32,
        name: &str,
        family: AddressFamily,
        flags: QueryFlags,
    ) -> Result<Vec<IpAddr>> {
        let qname = Name::from_str(name)
            .map_err(|e| ResolveError::InvalidArgument(format!("bad name {name}: {e}")))?;
        let handle = self.registry.get(netid).ok_or(ResolveError::NotFound)?;
        let snapshot = handle.snapshot();

        let mut addrs = match family {
            AddressFamily::V4 => {
                self.resolve_family(netid, uid, &qname, RecordType::A, flags)
                    .await?
            }
            AddressFamily::V6 => {
                self.resolve_family(netid, uid, &qname, RecordType::AAAA, flags)
                    .await?
            }
            AddressFamily::Unspec => {
                let aaaa_leg = async {
                    if !snapshot.options.ipv6_available {
                        return Ok(Vec::new());
                    }
                    if !snapshot.policy.parallel_lookup_sleep.is_zero() {
                        tokio::time::sleep(snapshot.policy.parallel_lookup_sleep).await;
                    }
                    self.resolve_family(netid, uid, &qname, RecordType::AAAA, flags)
                        .await
                };
                let a_leg = self.resolve_family(netid, uid, &qname, RecordType::A, flags);
                let (a, aaaa) = tokio::join!(a_leg, aaaa_leg);
                match (a, aaaa) {
                    (Ok(mut a), Ok(aaaa)) => {
                        a.extend(aaaa);
                        a
                    }
                    (Ok(a), Err(_)) => a,
                    (Err(_), Ok(aaaa)) if !aaaa.is_empty() => aaaa,
                    (Err(e), _) => return Err(e),
                }
            }
        };
        sort_rfc6724(&mut addrs);
        Ok(addrs)
    }

    async fn resolve_family(
        &self,
        netid: NetId,
        uid: u32,
        qname: &Name,
        rtype: RecordType,
        flags: QueryFlags,
    ) -> Result<Vec<IpAddr>> {
        let query = Message::query(Question::new(qname.clone(), rtype));
        let answer = self.query(netid, uid, &query.to_wire(), flags).await?;
        let parsed = Message::parse(&answer)?;
        Ok(match rtype {
            RecordType::AAAA => parsed.aaaa_records().map(IpAddr::V6).collect(),
            _ => parsed.a_records().map(IpAddr::V4).collect(),
        })
    }

    // ========================================================================
    // Exchange pipeline
    // ========================================================================

    /// Runs the upstream exchange, applies NAT64 post-processing, and
    /// builds the cache entry for conclusive answers.
    async fn exchange_and_postprocess(
        &self,
        handle: &Arc<NetworkHandle>,
        snapshot: &Arc<NetworkSnapshot>,
        query: &[u8],
        question: &Question,
        flags: QueryFlags,
    ) -> Result<(Vec<u8>, Option<CacheEntry>)> {
        let bytes = self.exchange(handle, snapshot, query, flags).await?;
        let parsed = Message::parse(&bytes)?;

        // NAT64 forward synthesis: AAAA with no usable answers.
        if question.qtype == RecordType::AAAA
            && !flags.contains(QueryFlags::BYPASS_PRIVATE_DNS)
            && parsed.aaaa_records().next().is_none()
        {
            if let Some(prefix) = handle.nat64.prefix() {
                if let Some((bytes, entry)) = self
                    .synthesize_forward(handle, snapshot, question, query, flags, prefix)
                    .await?
                {
                    return Ok((bytes, Some(entry)));
                }
            }
        }

        // NAT64 reverse: PTR for an in-prefix address answering NXDOMAIN
        // retries against the embedded IPv4 address.
        if question.qtype == RecordType::PTR && parsed.is_nxdomain() {
            if let Some(prefix) = handle.nat64.prefix() {
                if let Some(addr) = nat64::parse_reverse_v6(&question.qname) {
                    if prefix.contains(addr) {
                        if let Some(result) = self
                            .reverse_ptr_fallback(handle, snapshot, query, question, flags, prefix, addr)
                            .await?
                        {
                            return Ok(result);
                        }
                    }
                }
            }
        }

        let entry = build_cache_entry(handle, &parsed, &bytes);
        Ok((bytes, entry))
    }

    async fn synthesize_forward(
        &self,
        handle: &Arc<NetworkHandle>,
        snapshot: &Arc<NetworkSnapshot>,
        question: &Question,
        original_query: &[u8],
        flags: QueryFlags,
        prefix: Nat64Prefix,
    ) -> Result<Option<(Vec<u8>, CacheEntry)>> {
        let a_query = Message::query(Question::a(question.qname.clone()));
        let a_bytes = match self
            .exchange(handle, snapshot, &a_query.to_wire(), flags)
            .await
        {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        };
        let a_parsed = Message::parse(&a_bytes)?;
        if !a_parsed.rcode().is_no_error() {
            return Ok(None);
        }
        let query_id = message::peek_id(original_query).unwrap_or(0);
        let Some(synthesized) = nat64::synthesize_aaaa(prefix, question, query_id, &a_parsed)
        else {
            return Ok(None);
        };
        debug!(
            netid = handle.netid,
            name = %question.qname,
            "synthesized AAAA answer from NAT64 prefix"
        );
        let bytes = synthesized.to_wire().to_vec();
        let ttl = answer_ttl(&synthesized).unwrap_or(Duration::from_secs(60));
        let entry = CacheEntry::new(
            Bytes::from(bytes.clone()),
            handle.cache.clamp_ttl(ttl, false),
            false,
        )
        .synthesized();
        Ok(Some((bytes, entry)))
    }

    async fn reverse_ptr_fallback(
        &self,
        handle: &Arc<NetworkHandle>,
        snapshot: &Arc<NetworkSnapshot>,
        original_query: &[u8],
        question: &Question,
        flags: QueryFlags,
        prefix: Nat64Prefix,
        addr: std::net::Ipv6Addr,
    ) -> Result<Option<(Vec<u8>, Option<CacheEntry>)>> {
        let v4 = prefix.extract(addr);
        let v4_query = Message::query(Question::ptr(nat64::reverse_v4_name(v4)));
        let v4_bytes = match self
            .exchange(handle, snapshot, &v4_query.to_wire(), flags)
            .await
        {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        };
        let v4_parsed = Message::parse(&v4_bytes)?;
        if !v4_parsed.rcode().is_no_error() {
            return Ok(None);
        }

        // Rebuild under the original (prefixed) question name.
        let original = Message::parse(original_query)?;
        let mut out = Message::response_to(&original);
        for record in v4_parsed.answers_of_type(RecordType::PTR) {
            if let Some(target) = record.ptr_target() {
                out.add_answer(ResourceRecord::ptr(
                    question.qname.clone(),
                    record.ttl,
                    &target,
                ));
            }
        }
        if out.answers().is_empty() {
            return Ok(None);
        }
        let bytes = out.to_wire().to_vec();
        let ttl = answer_ttl(&out).unwrap_or(Duration::from_secs(60));
        let entry = CacheEntry::new(
            Bytes::from(bytes.clone()),
            handle.cache.clamp_ttl(ttl, false),
            false,
        )
        .synthesized();
        Ok(Some((bytes, Some(entry))))
    }

    /// Transport selection and failover for one upstream exchange.
    async fn exchange(
        &self,
        handle: &Arc<NetworkHandle>,
        snapshot: &Arc<NetworkSnapshot>,
        query: &[u8],
        flags: QueryFlags,
    ) -> Result<Vec<u8>> {
        let bypass = flags
            .intersects(QueryFlags::BYPASS_PRIVATE_DNS | QueryFlags::USE_LOCAL_NAMESERVERS);
        let use_private = !bypass && snapshot.mode != PrivateDnsMode::Off;

        let mut last_err: Option<ResolveError> = None;
        if use_private {
            // DoH first when validated; DoT otherwise.
            if snapshot.allows_transport(TransportType::Doh) {
                if let Some(info) = &snapshot.doh_server {
                    if info.state.is_success() {
                        match self.try_doh(handle, snapshot, &info.endpoint, query).await {
                            Ok(bytes) => return Ok(bytes),
                            Err(e) => last_err = Some(e),
                        }
                    }
                }
            }
            if snapshot.allows_transport(TransportType::Dot) {
                match self.try_dot(handle, snapshot, query, flags).await {
                    Ok(bytes) => return Ok(bytes),
                    Err(e) => last_err = Some(e),
                }
            }
            if snapshot.mode == PrivateDnsMode::Strict {
                // Never leak to Do53.
                return Err(last_err.unwrap_or(ResolveError::PrivateDnsValidationFailed));
            }
        }

        if !snapshot.allows_transport(TransportType::Do53) {
            return Err(last_err.unwrap_or(ResolveError::PrivateDnsValidationFailed));
        }
        self.try_do53(handle, snapshot, query, flags).await
    }

    async fn try_doh(
        &self,
        handle: &Arc<NetworkHandle>,
        snapshot: &Arc<NetworkSnapshot>,
        endpoint: &crate::doh::DohEndpoint,
        query: &[u8],
    ) -> Result<Vec<u8>> {
        let identity = endpoint.identity();
        let started = Instant::now();
        let doh = handle.doh();
        match doh
            .query(endpoint, query, snapshot.policy.doh_query_timeout)
            .await
        {
            Ok(bytes) => {
                let rcode = message::peek_rcode(&bytes);
                if rcode.map(Rcode::is_conclusive).unwrap_or(false) {
                    handle.stats.record(
                        &identity,
                        QueryOutcome::Success {
                            rtt: started.elapsed(),
                        },
                        &snapshot.params,
                    );
                    return Ok(bytes);
                }
                handle.stats.record(
                    &identity,
                    QueryOutcome::Error {
                        rcode: rcode.unwrap_or(Rcode::SERVFAIL),
                    },
                    &snapshot.params,
                );
                Err(ResolveError::ServFail)
            }
            Err(crate::doh::DohError::Timeout) => {
                handle
                    .stats
                    .record(&identity, QueryOutcome::Timeout, &snapshot.params);
                Err(ResolveError::Timeout)
            }
            Err(e) => {
                trace!(server = %identity, error = %e, "DoH exchange failed");
                handle
                    .stats
                    .record(&identity, QueryOutcome::Internal, &snapshot.params);
                Err(ResolveError::ServFail)
            }
        }
    }

    async fn try_dot(
        &self,
        handle: &Arc<NetworkHandle>,
        snapshot: &Arc<NetworkSnapshot>,
        query: &[u8],
        flags: QueryFlags,
    ) -> Result<Vec<u8>> {
        let candidates = handle
            .stats
            .order_candidates(&snapshot.validated_dot_servers(), &snapshot.params);
        if candidates.is_empty() {
            return Err(ResolveError::PrivateDnsValidationFailed);
        }

        let dot = handle.dot();
        let rounds = if flags.contains(QueryFlags::NO_RETRY) {
            1
        } else {
            snapshot.params.retry_count.max(1)
        };
        let mut last_err = ResolveError::Timeout;
        'rounds: for round in 0..rounds {
            let attempt_timeout = attempt_timeout(snapshot.params.base_timeout, round);
            for (index, identity) in candidates.iter().enumerate() {
                let started = Instant::now();
                match dot.query(identity, query, attempt_timeout).await {
                    Ok(bytes) => {
                        let rcode = message::peek_rcode(&bytes);
                        if rcode.map(Rcode::is_conclusive).unwrap_or(false) {
                            handle.stats.record(
                                identity,
                                QueryOutcome::Success {
                                    rtt: started.elapsed(),
                                },
                                &snapshot.params,
                            );
                            return Ok(bytes);
                        }
                        handle.stats.record(
                            identity,
                            QueryOutcome::Error {
                                rcode: rcode.unwrap_or(Rcode::SERVFAIL),
                            },
                            &snapshot.params,
                        );
                        last_err = ResolveError::ServFail;
                    }
                    Err(DotError::QueryTimeout) => {
                        handle
                            .stats
                            .record(identity, QueryOutcome::Timeout, &snapshot.params);
                        self.after_dot_timeout(handle, snapshot, identity, &dot);
                        last_err = ResolveError::Timeout;
                    }
                    Err(e) if e.is_connect_failure() => {
                        trace!(server = %identity, error = %e, "DoT connect failed");
                        handle
                            .stats
                            .record(identity, QueryOutcome::Internal, &snapshot.params);
                        last_err = match e {
                            DotError::NameMismatch(expected) => {
                                ResolveError::TlsNameMismatch { expected }
                            }
                            other => ResolveError::TlsHandshakeFailed(other.to_string()),
                        };
                        // Quick fallback: in opportunistic mode an
                        // unresponsive first server sends us straight to
                        // Do53 without trying the rest.
                        if snapshot.mode == PrivateDnsMode::Opportunistic
                            && snapshot.policy.dot_quick_fallback
                            && round == 0
                            && index == 0
                        {
                            break 'rounds;
                        }
                    }
                    Err(e) => {
                        handle
                            .stats
                            .record(identity, QueryOutcome::Internal, &snapshot.params);
                        last_err = ResolveError::TlsHandshakeFailed(e.to_string());
                    }
                }
                if flags.contains(QueryFlags::NO_RETRY) {
                    break 'rounds;
                }
            }
        }
        Err(last_err)
    }

    fn after_dot_timeout(
        &self,
        handle: &Arc<NetworkHandle>,
        snapshot: &Arc<NetworkSnapshot>,
        identity: &ServerIdentity,
        dot: &Arc<crate::dot::DotTransport>,
    ) {
        let timeouts = dot.consecutive_timeouts(identity);
        if let Some(threshold) = snapshot.policy.dot_unusable_threshold {
            if timeouts >= threshold {
                warn!(
                    netid = handle.netid,
                    server = %identity,
                    timeouts,
                    "DoT server marked unusable, revalidating"
                );
                self.engine
                    .request_dot_revalidation(handle.netid, identity, true);
                return;
            }
        }
        if let Some(threshold) = snapshot.policy.dot_revalidation_threshold {
            if timeouts >= threshold {
                self.engine
                    .request_dot_revalidation(handle.netid, identity, false);
            }
        }
    }

    async fn try_do53(
        &self,
        handle: &Arc<NetworkHandle>,
        snapshot: &Arc<NetworkSnapshot>,
        query: &[u8],
        flags: QueryFlags,
    ) -> Result<Vec<u8>> {
        if snapshot.do53_servers.is_empty() {
            return Err(ResolveError::NetworkUnreachable(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "no nameservers configured",
            )));
        }
        let servers: Vec<SocketAddr> = if snapshot.policy.sort_nameservers {
            let identities: Vec<ServerIdentity> = snapshot
                .do53_servers
                .iter()
                .map(|addr| ServerIdentity::anonymous(*addr))
                .collect();
            handle
                .stats
                .order_candidates(&identities, &snapshot.params)
                .into_iter()
                .map(|identity| identity.sockaddr)
                .collect()
        } else {
            snapshot.do53_servers.clone()
        };

        let rounds = if flags.contains(QueryFlags::NO_RETRY) {
            1
        } else {
            snapshot.params.retry_count.max(1)
        };
        let keep_listening = snapshot.policy.keep_listening_udp;
        let mut prev_session: Option<UdpSession> = None;
        let mut last_err = ResolveError::Timeout;

        enum Round {
            Late(Vec<u8>, SocketAddr),
            Fresh(std::result::Result<Do53Outcome, TransportError>),
        }

        'rounds: for round in 0..rounds {
            let attempt_timeout = attempt_timeout(snapshot.params.base_timeout, round);
            for server in &servers {
                let started = Instant::now();
                let round_result = match prev_session.take() {
                    Some(prev) if keep_listening => {
                        let fresh = handle.do53.exchange(*server, query, attempt_timeout);
                        tokio::pin!(fresh);
                        tokio::select! {
                            late = prev.recv(attempt_timeout) => match late {
                                Ok(bytes) => Round::Late(bytes, prev.server()),
                                Err(_) => Round::Fresh(fresh.await),
                            },
                            fresh_result = &mut fresh => Round::Fresh(fresh_result),
                        }
                    }
                    _ => Round::Fresh(handle.do53.exchange(*server, query, attempt_timeout).await),
                };

                match round_result {
                    Round::Late(bytes, sender) => {
                        let rcode = message::peek_rcode(&bytes);
                        if rcode.map(Rcode::is_conclusive).unwrap_or(false) {
                            trace!(server = %sender, "accepted late UDP response");
                            // Credit the sender of the late answer.
                            handle.stats.record(
                                &ServerIdentity::anonymous(sender),
                                QueryOutcome::Success {
                                    rtt: started.elapsed(),
                                },
                                &snapshot.params,
                            );
                            return Ok(bytes);
                        }
                    }
                    Round::Fresh(Ok(Do53Outcome::Answer(bytes))) => {
                        let identity = ServerIdentity::anonymous(*server);
                        let rcode = message::peek_rcode(&bytes);
                        if rcode.map(Rcode::is_conclusive).unwrap_or(false) {
                            handle.stats.record(
                                &identity,
                                QueryOutcome::Success {
                                    rtt: started.elapsed(),
                                },
                                &snapshot.params,
                            );
                            return Ok(bytes);
                        }
                        handle.stats.record(
                            &identity,
                            QueryOutcome::Error {
                                rcode: rcode.unwrap_or(Rcode::SERVFAIL),
                            },
                            &snapshot.params,
                        );
                        last_err = match rcode {
                            Some(Rcode::REFUSED) => ResolveError::Refused,
                            Some(Rcode::FORMERR) => ResolveError::FormErr(
                                umbra_proto::ProtoError::BadRdata("query"),
                            ),
                            _ => ResolveError::ServFail,
                        };
                    }
                    Round::Fresh(Ok(Do53Outcome::TimedOut(session))) => {
                        handle.stats.record(
                            &ServerIdentity::anonymous(*server),
                            QueryOutcome::Timeout,
                            &snapshot.params,
                        );
                        if keep_listening {
                            prev_session = Some(session);
                        }
                        last_err = ResolveError::Timeout;
                    }
                    Round::Fresh(Err(e)) => {
                        handle.stats.record(
                            &ServerIdentity::anonymous(*server),
                            QueryOutcome::Internal,
                            &snapshot.params,
                        );
                        last_err = match e {
                            TransportError::Timeout => ResolveError::Timeout,
                            TransportError::Network(io) => ResolveError::NetworkUnreachable(io),
                            TransportError::Malformed(p) => ResolveError::FormErr(p),
                        };
                    }
                }
                if flags.contains(QueryFlags::NO_RETRY) {
                    break 'rounds;
                }
            }
        }
        Err(last_err)
    }
}

/// Per-attempt timeout: base × 2^round, capped.
fn attempt_timeout(base: Duration, round: usize) -> Duration {
    let shifted = base.saturating_mul(1u32 << round.min(4));
    shifted.min(MAX_ATTEMPT_TIMEOUT)
}

/// Minimum positive TTL across the answer records.
fn answer_ttl(msg: &Message) -> Option<Duration> {
    msg.answers()
        .iter()
        .map(|r| r.ttl)
        .min()
        .map(|ttl| Duration::from_secs(u64::from(ttl)))
}

/// Builds the cache entry for a conclusive answer, or `None` when the
/// response should not be cached (SERVFAIL and friends).
fn build_cache_entry(
    handle: &Arc<NetworkHandle>,
    parsed: &Message,
    bytes: &[u8],
) -> Option<CacheEntry> {
    let rcode = parsed.rcode();
    if !rcode.is_conclusive() {
        return None;
    }
    let negative = rcode.is_nxdomain() || parsed.is_nodata();
    let ttl = if negative {
        let soa = parsed
            .soa_minimum()
            .map(|minimum| Duration::from_secs(u64::from(minimum)));
        let cap = handle.cache.config().negative_ttl_cap;
        soa.map_or(cap, |soa| soa.min(cap))
    } else {
        answer_ttl(parsed).unwrap_or(Duration::from_secs(60))
    };
    Some(CacheEntry::new(
        Bytes::copy_from_slice(bytes),
        handle.cache.clamp_ttl(ttl, negative),
        negative,
    ))
}

/// Answers the query locally when a custom-hosts entry matches; record
/// order follows the configured list and is never re-sorted.
fn custom_hosts_answer(
    snapshot: &Arc<NetworkSnapshot>,
    parsed: &Message,
    question: &Question,
) -> Option<Vec<u8>> {
    if snapshot.options.custom_hosts.is_empty() {
        return None;
    }
    let qname = question.qname.to_string().to_ascii_lowercase();
    let mut answer = Message::response_to(parsed);
    for host in &snapshot.options.custom_hosts {
        if host.name.to_ascii_lowercase() != qname {
            continue;
        }
        match (host.ip, question.qtype) {
            (IpAddr::V4(v4), RecordType::A) => {
                answer.add_answer(ResourceRecord::a(question.qname.clone(), 0, v4));
            }
            (IpAddr::V6(v6), RecordType::AAAA) => {
                answer.add_answer(ResourceRecord::aaaa(question.qname.clone(), 0, v6));
            }
            _ => {}
        }
    }
    if answer.answers().is_empty() {
        return None;
    }
    Some(answer.to_wire().to_vec())
}

/// RFC 6724 destination-address ordering, precedence and label rules
/// only (the source address is unknown at this layer). The sort is
/// stable, so addresses of equal precedence keep their arrival order.
fn sort_rfc6724(addrs: &mut [IpAddr]) {
    addrs.sort_by(|a, b| precedence(b).cmp(&precedence(a)));
}

fn precedence(addr: &IpAddr) -> u8 {
    match addr {
        // Plain IPv4 counts as v4-mapped for precedence purposes.
        IpAddr::V4(_) => 35,
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            if v6.is_loopback() {
                50
            } else if segments[0] == 0x2002 {
                30 // 6to4
            } else if segments[0] == 0x2001 && segments[1] == 0 {
                5 // Teredo
            } else if (segments[0] & 0xfe00) == 0xfc00 {
                3 // ULA
            } else if (segments[0] & 0xffc0) == 0xfec0 {
                1 // site-local (deprecated)
            } else if v6.to_ipv4_mapped().is_some() {
                35
            } else {
                40
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_attempt_timeout_progression() {
        let base = Duration::from_millis(1000);
        assert_eq!(attempt_timeout(base, 0), Duration::from_secs(1));
        assert_eq!(attempt_timeout(base, 1), Duration::from_secs(2));
        assert_eq!(attempt_timeout(base, 2), Duration::from_secs(4));
        // Capped.
        assert_eq!(
            attempt_timeout(Duration::from_secs(20), 3),
            MAX_ATTEMPT_TIMEOUT
        );
    }

    #[test]
    fn test_rfc6724_ordering() {
        let native: IpAddr = "2001:db8::1".parse().unwrap();
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let teredo: IpAddr = "2001:0:53aa::1".parse().unwrap();
        let ula: IpAddr = "fd00::1".parse().unwrap();
        let loopback: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);

        let mut addrs = vec![teredo, v4, ula, native, loopback];
        sort_rfc6724(&mut addrs);
        assert_eq!(addrs, vec![loopback, native, v4, teredo, ula]);
    }

    #[test]
    fn test_rfc6724_stable_within_class() {
        let a: IpAddr = "192.0.2.1".parse().unwrap();
        let b: IpAddr = "192.0.2.2".parse().unwrap();
        let c: IpAddr = "192.0.2.3".parse().unwrap();
        let mut addrs = vec![a, b, c];
        sort_rfc6724(&mut addrs);
        assert_eq!(addrs, vec![a, b, c]);
    }

    #[test]
    fn test_precedence_values() {
        assert_eq!(precedence(&"::1".parse().unwrap()), 50);
        assert_eq!(precedence(&"2001:db8::1".parse().unwrap()), 40);
        assert_eq!(precedence(&"192.0.2.9".parse().unwrap()), 35);
        assert_eq!(precedence(&"2002::1".parse().unwrap()), 30);
        assert_eq!(precedence(&"2001::1".parse().unwrap()), 5);
        assert_eq!(precedence(&"fc00::7".parse().unwrap()), 3);
    }
}
