//! End-to-end tests for the resolver core.
//!
//! These run the full dispatch pipeline against in-process mock
//! upstreams: a configurable UDP (Do53) server and a DoT echo server
//! with certificates minted per test.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use umbra_proto::{message, Message, Name, Question, Rcode, RecordType, ResourceRecord};
use umbra_resolver::config::{ResolverOptions, SetConfigurationRequest};
use umbra_resolver::dispatch::AddressFamily;
use umbra_resolver::events::ValidationObserver;
use umbra_resolver::identity::{ServerIdentity, ValidationState};
use umbra_resolver::{
    PrivateDnsMode, QueryFlags, Resolver, ResolveError, ResolverParams, TransportPolicy,
};

// ============================================================================
// Test upstreams
// ============================================================================

/// A scriptable Do53 upstream.
struct MockDns {
    records: RwLock<HashMap<(Name, RecordType), Vec<ResourceRecord>>>,
    queries: AtomicU64,
    delay_ms: AtomicU64,
    /// Answer NXDOMAIN (with an SOA carrying this minimum) for unknown
    /// names instead of an empty NOERROR.
    nxdomain_soa_minimum: AtomicU64,
}

impl MockDns {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            queries: AtomicU64::new(0),
            delay_ms: AtomicU64::new(0),
            nxdomain_soa_minimum: AtomicU64::new(0),
        })
    }

    fn add_a(&self, name: &str, ip: Ipv4Addr, ttl: u32) {
        let name = Name::from_str(name).unwrap();
        let record = ResourceRecord::a(name.clone(), ttl, ip);
        self.records
            .write()
            .entry((name, RecordType::A))
            .or_default()
            .push(record);
    }

    fn add_aaaa(&self, name: &str, ip: std::net::Ipv6Addr, ttl: u32) {
        let name = Name::from_str(name).unwrap();
        let record = ResourceRecord::aaaa(name.clone(), ttl, ip);
        self.records
            .write()
            .entry((name, RecordType::AAAA))
            .or_default()
            .push(record);
    }

    fn set_delay(&self, ms: u64) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    fn build_response(&self, query: &[u8]) -> Option<Vec<u8>> {
        let parsed = Message::parse(query).ok()?;
        let question = parsed.question()?.clone();
        let mut resp = Message::response_to(&parsed);
        let records = self
            .records
            .read()
            .get(&(question.qname.lowercased(), question.qtype))
            .cloned()
            .unwrap_or_default();
        if records.is_empty() {
            let soa_minimum = self.nxdomain_soa_minimum.load(Ordering::SeqCst);
            if soa_minimum > 0 {
                resp.set_rcode(Rcode::NXDOMAIN);
                resp.add_authority(make_soa(soa_minimum as u32));
            }
        }
        for record in records {
            resp.add_answer(record);
        }
        Some(resp.to_wire().to_vec())
    }

    async fn serve(self: &Arc<Self>) -> SocketAddr {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let server = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                server.queries.fetch_add(1, Ordering::SeqCst);
                let query = buf[..len].to_vec();
                let server = server.clone();
                let socket = socket.clone();
                tokio::spawn(async move {
                    let delay = server.delay_ms.load(Ordering::SeqCst);
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    if let Some(resp) = server.build_response(&query) {
                        let _ = socket.send_to(&resp, peer).await;
                    }
                });
            }
        });
        addr
    }

    /// A server that never answers.
    async fn serve_silent() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                if socket.recv_from(&mut buf).await.is_err() {
                    break;
                }
            }
        });
        addr
    }
}

fn make_soa(minimum: u32) -> ResourceRecord {
    use umbra_proto::wire::{WireReader, WireWriter};
    let mut rdata = WireWriter::with_capacity(64);
    Name::from_str("ns1.example.com").unwrap().write_to(&mut rdata);
    Name::from_str("admin.example.com")
        .unwrap()
        .write_to(&mut rdata);
    for v in [1u32, 7200, 900, 86400, minimum] {
        rdata.put_u32(v);
    }
    let mut w = WireWriter::with_capacity(128);
    Name::from_str("example.com").unwrap().write_to(&mut w);
    w.put_u16(RecordType::SOA.0);
    w.put_u16(umbra_proto::RecordClass::IN.0);
    w.put_u32(3600);
    w.put_u16(rdata.len() as u16);
    w.put_slice(rdata.as_slice());
    let buf = w.freeze();
    ResourceRecord::parse(&mut WireReader::new(&buf)).unwrap()
}

/// DoT echo server with a freshly minted CA.
struct DotFixture {
    addr: SocketAddr,
    ca_pem: String,
}

async fn spawn_dot_server(hostname: &str) -> DotFixture {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
    use rustls::pki_types::PrivateKeyDer;

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let server_params = CertificateParams::new(vec![hostname.to_string()]).unwrap();
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

    let key = PrivateKeyDer::try_from(server_key.serialize_der()).unwrap();
    let config = Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![server_cert.der().clone()], key)
            .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(config);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                loop {
                    let mut len_buf = [0u8; 2];
                    if tls.read_exact(&mut len_buf).await.is_err() {
                        break;
                    }
                    let len = usize::from(u16::from_be_bytes(len_buf));
                    let mut query = vec![0u8; len];
                    if tls.read_exact(&mut query).await.is_err() {
                        break;
                    }
                    let Ok(parsed) = Message::parse(&query) else {
                        break;
                    };
                    let mut resp = Message::response_to(&parsed);
                    resp.add_answer(ResourceRecord::a(
                        parsed.question().unwrap().qname.clone(),
                        60,
                        Ipv4Addr::new(203, 0, 113, 99),
                    ));
                    let wire = resp.to_wire();
                    if tls.write_all(&(wire.len() as u16).to_be_bytes()).await.is_err()
                        || tls.write_all(&wire).await.is_err()
                    {
                        break;
                    }
                    let _ = tls.flush().await;
                }
            });
        }
    });

    DotFixture {
        addr,
        ca_pem: ca_cert.pem(),
    }
}

#[derive(Default)]
struct EventLog {
    validations: parking_lot::Mutex<Vec<(u32, ServerIdentity, bool)>>,
}

impl ValidationObserver for EventLog {
    fn on_private_dns_validation(&self, netid: u32, identity: &ServerIdentity, success: bool) {
        self.validations
            .lock()
            .push((netid, identity.clone(), success));
    }

    fn on_nat64_prefix_update(&self, _: u32, _: bool, _: std::net::Ipv6Addr, _: u8) {}
}

fn off_mode_request(netid: u32, do53: SocketAddr) -> SetConfigurationRequest {
    SetConfigurationRequest {
        netid,
        caller_uid: 0,
        mode: PrivateDnsMode::Off,
        plaintext_servers: vec![do53.to_string()],
        encrypted_servers: Vec::new(),
        private_dns_hostname: String::new(),
        domains: Vec::new(),
        params: ResolverParams::default(),
        ca_certificate: None,
        doh_params: None,
        transports: Vec::new(),
        policy: TransportPolicy::default(),
        options: None,
    }
}

fn a_query(name: &str) -> Vec<u8> {
    Message::query(Question::a(Name::from_str(name).unwrap()))
        .to_wire()
        .to_vec()
}

fn aaaa_query(name: &str) -> Vec<u8> {
    Message::query(Question::aaaa(Name::from_str(name).unwrap()))
        .to_wire()
        .to_vec()
}

async fn wait_for_validation(resolver: &Resolver, netid: u32) {
    for _ in 0..100 {
        if let Some(status) = resolver.get_status(netid) {
            if status
                .dot_servers
                .iter()
                .any(|(_, s)| *s == ValidationState::Success)
            {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("validation never succeeded");
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_basic_off_mode_query() {
    let upstream = MockDns::new();
    upstream.add_a("example.com", Ipv4Addr::new(93, 184, 216, 34), 300);
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(1, addr))
        .unwrap();

    let answer = resolver
        .query(1, 10_000, &a_query("example.com"), QueryFlags::empty())
        .await
        .unwrap();
    let parsed = Message::parse(&answer).unwrap();
    assert_eq!(
        parsed.a_records().collect::<Vec<_>>(),
        vec![Ipv4Addr::new(93, 184, 216, 34)]
    );
    assert_eq!(upstream.queries(), 1);

    // Second query is served from the cache.
    let again = resolver
        .query(1, 10_000, &a_query("example.com"), QueryFlags::empty())
        .await
        .unwrap();
    assert!(!again.is_empty());
    assert_eq!(upstream.queries(), 1);
}

#[tokio::test]
async fn test_cache_coalescing_single_upstream_query() {
    let upstream = MockDns::new();
    upstream.add_a("slow.example.com", Ipv4Addr::new(192, 0, 2, 10), 300);
    upstream.set_delay(500);
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(1, addr))
        .unwrap();

    let r1 = resolver.clone();
    let r2 = resolver.clone();
    let t1 = tokio::spawn(async move {
        r1.query(1, 1, &a_query("slow.example.com"), QueryFlags::empty())
            .await
    });
    let t2 = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        r2.query(1, 2, &a_query("slow.example.com"), QueryFlags::empty())
            .await
    });

    let a1 = t1.await.unwrap().unwrap();
    let a2 = t2.await.unwrap().unwrap();

    // Exactly one wire query; both callers see the same records.
    assert_eq!(upstream.queries(), 1);
    let p1 = Message::parse(&a1).unwrap();
    let p2 = Message::parse(&a2).unwrap();
    assert_eq!(
        p1.a_records().collect::<Vec<_>>(),
        p2.a_records().collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_flush_unblocks_pending() {
    let upstream = MockDns::new();
    upstream.add_a("pending.example.com", Ipv4Addr::new(192, 0, 2, 11), 300);
    upstream.set_delay(800);
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(1, addr))
        .unwrap();

    let r1 = resolver.clone();
    let t1 = tokio::spawn(async move {
        r1.query(1, 1, &a_query("pending.example.com"), QueryFlags::empty())
            .await
    });

    // Let T1 install the pending marker, then flush.
    tokio::time::sleep(Duration::from_millis(100)).await;
    resolver.flush_network_cache(1).unwrap();

    // T2's identical query is not coalesced with T1's pre-flush fetch.
    let a2 = resolver
        .query(1, 2, &a_query("pending.example.com"), QueryFlags::empty())
        .await
        .unwrap();
    assert!(!a2.is_empty());
    assert_eq!(upstream.queries(), 2);

    // T1 still gets its answer.
    assert!(t1.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_no_cache_store_does_not_refresh() {
    let upstream = MockDns::new();
    upstream.add_a("short.example.com", Ipv4Addr::new(192, 0, 2, 12), 1);
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(1, addr))
        .unwrap();

    // Prime the cache, then let the entry go stale.
    resolver
        .query(1, 1, &a_query("short.example.com"), QueryFlags::empty())
        .await
        .unwrap();
    assert_eq!(upstream.queries(), 1);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // NO_CACHE_STORE hits upstream but must not refresh the entry.
    resolver
        .query(
            1,
            1,
            &a_query("short.example.com"),
            QueryFlags::NO_CACHE_STORE,
        )
        .await
        .unwrap();
    assert_eq!(upstream.queries(), 2);

    // A regular query still sees a stale cache and refetches.
    resolver
        .query(1, 1, &a_query("short.example.com"), QueryFlags::empty())
        .await
        .unwrap();
    assert_eq!(upstream.queries(), 3);
}

#[tokio::test]
async fn test_negative_caching_with_soa_minimum() {
    let upstream = MockDns::new();
    upstream.nxdomain_soa_minimum.store(600, Ordering::SeqCst);
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(1, addr))
        .unwrap();

    let answer = resolver
        .query(1, 1, &a_query("missing.example.com"), QueryFlags::empty())
        .await
        .unwrap();
    assert_eq!(message::peek_rcode(&answer), Some(Rcode::NXDOMAIN));
    assert_eq!(upstream.queries(), 1);

    // The NXDOMAIN is served from cache.
    let again = resolver
        .query(1, 1, &a_query("missing.example.com"), QueryFlags::empty())
        .await
        .unwrap();
    assert_eq!(message::peek_rcode(&again), Some(Rcode::NXDOMAIN));
    assert_eq!(upstream.queries(), 1);
}

#[tokio::test]
async fn test_nat64_forward_synthesis() {
    let upstream = MockDns::new();
    upstream.add_a("v4only.example.com", Ipv4Addr::new(1, 2, 3, 4), 120);
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(1, addr))
        .unwrap();
    resolver.set_prefix64(1, "64:ff9b::/96").unwrap();

    // AAAA query returns the synthesized address.
    let answer = resolver
        .query(1, 1, &aaaa_query("v4only.example.com"), QueryFlags::empty())
        .await
        .unwrap();
    let parsed = Message::parse(&answer).unwrap();
    assert_eq!(
        parsed.aaaa_records().collect::<Vec<_>>(),
        vec!["64:ff9b::102:304".parse::<std::net::Ipv6Addr>().unwrap()]
    );

    // AF_UNSPEC resolve returns both the native A and the synthesized
    // AAAA.
    let addrs = resolver
        .resolve(1, 1, "v4only.example.com", AddressFamily::Unspec, QueryFlags::empty())
        .await
        .unwrap();
    assert!(addrs.contains(&IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
    assert!(addrs.contains(&"64:ff9b::102:304".parse::<IpAddr>().unwrap()));
}

#[tokio::test]
async fn test_nat64_skips_special_use() {
    let upstream = MockDns::new();
    upstream.add_a("loop.example.com", Ipv4Addr::new(127, 0, 0, 1), 120);
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(1, addr))
        .unwrap();
    resolver.set_prefix64(1, "64:ff9b::/96").unwrap();

    let answer = resolver
        .query(1, 1, &aaaa_query("loop.example.com"), QueryFlags::empty())
        .await
        .unwrap();
    let parsed = Message::parse(&answer).unwrap();
    assert_eq!(parsed.aaaa_records().count(), 0);
}

#[tokio::test]
async fn test_prefix64_roundtrip_and_conflicts() {
    let upstream = MockDns::new();
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(1, addr))
        .unwrap();

    // Clear with nothing set: NotFound.
    assert!(matches!(
        resolver.set_prefix64(1, ""),
        Err(ResolveError::NotFound)
    ));

    resolver.set_prefix64(1, "64:ff9b::/96").unwrap();
    assert_eq!(
        resolver.get_prefix64(1).unwrap().to_string(),
        "64:ff9b::/96"
    );

    // Non-/96 rejected.
    assert!(matches!(
        resolver.set_prefix64(1, "64:ff9b::/64"),
        Err(ResolveError::InvalidArgument(_))
    ));

    resolver.set_prefix64(1, "").unwrap();
    assert!(resolver.get_prefix64(1).is_none());
}

#[tokio::test]
async fn test_strict_mode_never_touches_do53() {
    let upstream = MockDns::new();
    upstream.add_a("secret.example.com", Ipv4Addr::new(192, 0, 2, 13), 300);
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    let mut request = off_mode_request(1, addr);
    request.mode = PrivateDnsMode::Strict;
    request.private_dns_hostname = "dns.test.example".into();
    // TEST-NET-1: the DoT server is unreachable, so nothing validates.
    request.encrypted_servers = vec!["192.0.2.1".into()];
    resolver.set_resolver_configuration(request).unwrap();

    let result = resolver
        .query(1, 1, &a_query("secret.example.com"), QueryFlags::empty())
        .await;
    assert!(result.is_err());

    // No bytes ever reached the cleartext server.
    assert_eq!(upstream.queries(), 0);
}

#[tokio::test]
async fn test_opportunistic_falls_back_to_do53() {
    let upstream = MockDns::new();
    upstream.add_a("fallback.example.com", Ipv4Addr::new(192, 0, 2, 14), 300);
    let addr = upstream.serve().await;

    // DoT server: a closed port (bind then drop) so validation fails
    // fast with connection refused.
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dot_addr = closed.local_addr().unwrap();
    drop(closed);

    let resolver = Resolver::new();
    let observer = Arc::new(EventLog::default());
    resolver.set_observer(observer.clone());

    let mut request = off_mode_request(1, addr);
    request.mode = PrivateDnsMode::Opportunistic;
    request.encrypted_servers = vec![dot_addr.to_string()];
    request.policy.dot_validation_latency_factor = None;
    request.policy.dot_validation_latency_offset = None;
    resolver.set_resolver_configuration(request).unwrap();

    // Queries degrade to Do53 while the DoT server stays unvalidated.
    let answer = resolver
        .query(1, 1, &a_query("fallback.example.com"), QueryFlags::empty())
        .await
        .unwrap();
    let parsed = Message::parse(&answer).unwrap();
    assert_eq!(parsed.a_records().count(), 1);
    assert!(upstream.queries() >= 1);

    // The failing server produced exactly one failure event.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let events = observer.validations.lock().clone();
    assert_eq!(events.len(), 1);
    assert!(!events[0].2);
}

#[tokio::test]
async fn test_opportunistic_uses_validated_dot() {
    let upstream = MockDns::new();
    let do53_addr = upstream.serve().await;
    let dot = spawn_dot_server("dot.test.example").await;

    let resolver = Resolver::new();
    let observer = Arc::new(EventLog::default());
    resolver.set_observer(observer.clone());

    let mut request = off_mode_request(1, do53_addr);
    request.mode = PrivateDnsMode::Opportunistic;
    request.encrypted_servers = vec![dot.addr.to_string()];
    request.policy.dot_validation_latency_factor = None;
    request.policy.dot_validation_latency_offset = None;
    resolver.set_resolver_configuration(request).unwrap();

    wait_for_validation(&resolver, 1).await;
    let events = observer.validations.lock().clone();
    assert_eq!(events.len(), 1);
    assert!(events[0].2);

    // Queries ride the validated DoT server; Do53 stays silent.
    let answer = resolver
        .query(1, 1, &a_query("private.example.com"), QueryFlags::empty())
        .await
        .unwrap();
    let parsed = Message::parse(&answer).unwrap();
    assert_eq!(
        parsed.a_records().collect::<Vec<_>>(),
        vec![Ipv4Addr::new(203, 0, 113, 99)]
    );
    assert_eq!(upstream.queries(), 0);

    let _ = dot.ca_pem;
}

#[tokio::test]
async fn test_strict_mode_with_validated_server() {
    let upstream = MockDns::new();
    let do53_addr = upstream.serve().await;
    let dot = spawn_dot_server("dot.test.example").await;

    let resolver = Resolver::new();
    let mut request = off_mode_request(1, do53_addr);
    request.mode = PrivateDnsMode::Strict;
    request.private_dns_hostname = "dot.test.example".into();
    request.encrypted_servers = vec![dot.addr.to_string()];
    request.ca_certificate = Some(dot.ca_pem.clone());
    request.policy.dot_validation_latency_factor = None;
    request.policy.dot_validation_latency_offset = None;
    resolver.set_resolver_configuration(request).unwrap();

    wait_for_validation(&resolver, 1).await;

    let answer = resolver
        .query(1, 1, &a_query("strict.example.com"), QueryFlags::empty())
        .await
        .unwrap();
    let parsed = Message::parse(&answer).unwrap();
    assert_eq!(parsed.a_records().count(), 1);
    assert_eq!(upstream.queries(), 0);
}

#[tokio::test]
async fn test_keep_listening_udp_accepts_late_response() {
    // Server A answers late; server B never answers.
    let slow = MockDns::new();
    slow.add_a("late.example.com", Ipv4Addr::new(192, 0, 2, 15), 300);
    slow.set_delay(1500);
    let a_addr = slow.serve().await;
    let b_addr = MockDns::serve_silent().await;

    let resolver = Resolver::new();
    let mut request = off_mode_request(1, a_addr);
    request.plaintext_servers = vec![a_addr.to_string(), b_addr.to_string()];
    request.params.base_timeout = Duration::from_millis(1000);
    request.params.retry_count = 1;
    request.policy.keep_listening_udp = true;
    resolver.set_resolver_configuration(request).unwrap();

    // Attempt 1 (A) times out at 1 s; during attempt 2 (B) the late
    // answer from A lands at ~1.5 s and is accepted.
    let answer = resolver
        .query(1, 1, &a_query("late.example.com"), QueryFlags::empty())
        .await
        .unwrap();
    let parsed = Message::parse(&answer).unwrap();
    assert_eq!(parsed.a_records().count(), 1);
    assert_eq!(slow.queries(), 1);
}

#[tokio::test]
async fn test_blocked_uid_policy() {
    let upstream = MockDns::new();
    upstream.add_a("example.com", Ipv4Addr::new(192, 0, 2, 16), 300);
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(1, addr))
        .unwrap();
    resolver
        .set_resolver_options(
            1,
            ResolverOptions {
                blocked_uids: vec![4242],
                ..Default::default()
            },
        )
        .unwrap();

    assert!(matches!(
        resolver
            .query(1, 4242, &a_query("example.com"), QueryFlags::empty())
            .await,
        Err(ResolveError::BlockedByPolicy)
    ));
    // The block is local: the server saw nothing, no health changes.
    assert_eq!(upstream.queries(), 0);

    // Other UIDs are unaffected.
    assert!(resolver
        .query(1, 1000, &a_query("example.com"), QueryFlags::empty())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_custom_hosts_bypass_dns() {
    let upstream = MockDns::new();
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(1, addr))
        .unwrap();
    resolver
        .set_resolver_options(
            1,
            ResolverOptions {
                custom_hosts: vec![
                    umbra_resolver::config::CustomHost {
                        ip: "10.0.0.7".parse().unwrap(),
                        name: "printer.corp".into(),
                    },
                    umbra_resolver::config::CustomHost {
                        ip: "10.0.0.8".parse().unwrap(),
                        name: "printer.corp".into(),
                    },
                ],
                ..Default::default()
            },
        )
        .unwrap();

    let answer = resolver
        .query(1, 1, &a_query("printer.corp"), QueryFlags::empty())
        .await
        .unwrap();
    let parsed = Message::parse(&answer).unwrap();
    // Order follows the configured list; no DNS traffic at all.
    assert_eq!(
        parsed.a_records().collect::<Vec<_>>(),
        vec![
            Ipv4Addr::new(10, 0, 0, 7),
            Ipv4Addr::new(10, 0, 0, 8)
        ]
    );
    assert_eq!(upstream.queries(), 0);
}

#[tokio::test]
async fn test_resolve_orders_by_rfc6724() {
    let upstream = MockDns::new();
    upstream.add_a("dual.example.com", Ipv4Addr::new(192, 0, 2, 20), 300);
    upstream.add_aaaa(
        "dual.example.com",
        "2001:db8::20".parse().unwrap(),
        300,
    );
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(1, addr))
        .unwrap();

    let addrs = resolver
        .resolve(1, 1, "dual.example.com", AddressFamily::Unspec, QueryFlags::empty())
        .await
        .unwrap();
    // Native IPv6 (precedence 40) sorts ahead of IPv4 (35).
    assert_eq!(
        addrs,
        vec![
            "2001:db8::20".parse::<IpAddr>().unwrap(),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 20)),
        ]
    );
}

#[tokio::test]
async fn test_ipv6_unavailable_suppresses_aaaa() {
    let upstream = MockDns::new();
    upstream.add_a("dual.example.com", Ipv4Addr::new(192, 0, 2, 21), 300);
    upstream.add_aaaa(
        "dual.example.com",
        "2001:db8::21".parse().unwrap(),
        300,
    );
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(1, addr))
        .unwrap();
    resolver
        .set_resolver_options(
            1,
            ResolverOptions {
                ipv6_available: false,
                ..Default::default()
            },
        )
        .unwrap();

    let addrs = resolver
        .resolve(1, 1, "dual.example.com", AddressFamily::Unspec, QueryFlags::empty())
        .await
        .unwrap();
    assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 21))]);
}

#[tokio::test]
async fn test_destroyed_network_rejects_queries() {
    let upstream = MockDns::new();
    let addr = upstream.serve().await;

    let resolver = Resolver::new();
    resolver
        .set_resolver_configuration(off_mode_request(7, addr))
        .unwrap();
    resolver.destroy_network_cache(7).unwrap();

    assert!(matches!(
        resolver
            .query(7, 1, &a_query("example.com"), QueryFlags::empty())
            .await,
        Err(ResolveError::NotFound)
    ));
}
