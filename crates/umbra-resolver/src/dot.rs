//! DNS over TLS (RFC 7858) client transport.
//!
//! One TLS connection per server identity, shared by every in-flight
//! query targeting it. Queries are pipelined on the connection and
//! demultiplexed by message ID; connection open/close is serialized per
//! identity. Certificate handling follows the privacy mode: a named
//! server (strict mode) is verified against the trust anchors (or the
//! CA override) with the provider name as SNI, while an anonymous
//! server (opportunistic mode) is encrypted but not authenticated.

use crate::do53::{Do53Outcome, Do53Transport};
use crate::identity::ServerIdentity;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};
use umbra_proto::message;

/// Hostname used for handshake probes.
const PROBE_HOSTNAME: &str = "dnsotls-ds.metric.gstatic.com";

/// Idle period after which a connection with no outstanding queries is
/// torn down.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// DoT failures, split so the dispatcher can tell connection-setup
/// problems (quick-fallback triggers) from per-query ones.
#[derive(Error, Debug)]
pub enum DotError {
    #[error("connect timeout")]
    ConnectTimeout,

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("certificate does not match {0}")]
    NameMismatch(String),

    #[error("query timeout")]
    QueryTimeout,

    #[error("connection closed")]
    Closed,

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

impl DotError {
    /// True for failures that happen before any query is sent.
    pub fn is_connect_failure(&self) -> bool {
        match self {
            Self::ConnectTimeout | Self::Handshake(_) | Self::NameMismatch(_) => true,
            Self::Network(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// DoT transport configuration, derived from the network policy.
#[derive(Debug, Clone)]
pub struct DotConfig {
    pub connect_timeout: Duration,
    pub query_timeout: Option<Duration>,
    pub async_handshake: bool,
    pub max_tries: u32,
    /// UDP-baseline latency gate for probes; `None` disables it.
    pub latency_factor: Option<u32>,
    pub latency_offset: Option<Duration>,
    pub ca_override_pem: Option<String>,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1000),
            query_timeout: None,
            async_handshake: false,
            max_tries: 3,
            latency_factor: None,
            latency_offset: None,
            ca_override_pem: None,
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u16, (u16, oneshot::Sender<Vec<u8>>)>>>;

struct DotRequest {
    wire: Vec<u8>,
    resp: oneshot::Sender<Vec<u8>>,
}

/// A live pipelined connection.
struct DotConnection {
    req_tx: mpsc::UnboundedSender<DotRequest>,
    closed: Arc<AtomicBool>,
}

impl DotConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct Slot {
    conn: tokio::sync::Mutex<Option<Arc<DotConnection>>>,
    consecutive_timeouts: AtomicU32,
}

impl Slot {
    fn new() -> Self {
        Self {
            conn: tokio::sync::Mutex::new(None),
            consecutive_timeouts: AtomicU32::new(0),
        }
    }
}

/// Per-network DoT client transport.
pub struct DotTransport {
    config: DotConfig,
    slots: DashMap<ServerIdentity, Arc<Slot>>,
    do53: Do53Transport,
}

impl DotTransport {
    pub fn new(config: DotConfig) -> Self {
        Self {
            config,
            slots: DashMap::new(),
            do53: Do53Transport::new(),
        }
    }

    pub fn config(&self) -> &DotConfig {
        &self.config
    }

    /// Consecutive timed-out queries against `identity` since the last
    /// success; the dispatcher compares this against the unusable and
    /// revalidation thresholds.
    pub fn consecutive_timeouts(&self, identity: &ServerIdentity) -> u32 {
        self.slots
            .get(identity)
            .map(|s| s.consecutive_timeouts.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Drops the pooled connection for `identity`.
    pub fn close(&self, identity: &ServerIdentity) {
        self.slots.remove(identity);
    }

    /// Drops every pooled connection not satisfying `keep`.
    pub fn retain(&self, keep: impl Fn(&ServerIdentity) -> bool) {
        self.slots.retain(|id, _| keep(id));
    }

    /// Sends `query` to `identity`, connecting as needed.
    pub async fn query(
        &self,
        identity: &ServerIdentity,
        query: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, DotError> {
        let slot = self
            .slots
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone();

        let mut last_err = DotError::Closed;
        for attempt in 0..self.config.max_tries.max(1) {
            let conn = match self.ensure_connected(identity, &slot).await {
                Ok(conn) => conn,
                Err(e) => return Err(e),
            };
            match self.query_on(&conn, query, deadline).await {
                Ok(response) => {
                    slot.consecutive_timeouts.store(0, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(DotError::QueryTimeout) => {
                    slot.consecutive_timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(DotError::QueryTimeout);
                }
                Err(e) => {
                    trace!(server = %identity, attempt, error = %e, "DoT query failed, reconnecting");
                    let mut guard = slot.conn.lock().await;
                    if let Some(existing) = guard.as_ref() {
                        if Arc::ptr_eq(existing, &conn) {
                            *guard = None;
                        }
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn query_on(
        &self,
        conn: &Arc<DotConnection>,
        query: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, DotError> {
        if conn.is_closed() {
            return Err(DotError::Closed);
        }
        let (resp_tx, resp_rx) = oneshot::channel();
        conn.req_tx
            .send(DotRequest {
                wire: query.to_vec(),
                resp: resp_tx,
            })
            .map_err(|_| DotError::Closed)?;

        let effective = match self.config.query_timeout {
            Some(qt) => deadline.min(qt),
            None => deadline,
        };
        match timeout(effective, resp_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DotError::Closed),
            Err(_) => Err(DotError::QueryTimeout),
        }
    }

    async fn ensure_connected(
        &self,
        identity: &ServerIdentity,
        slot: &Arc<Slot>,
    ) -> Result<Arc<DotConnection>, DotError> {
        {
            let guard = slot.conn.lock().await;
            if let Some(conn) = guard.as_ref() {
                if !conn.is_closed() {
                    return Ok(conn.clone());
                }
            }
        }

        if self.config.async_handshake {
            // Hold the slot lock across the handshake: concurrent
            // queries wait for the single in-flight attempt.
            let mut guard = slot.conn.lock().await;
            if let Some(conn) = guard.as_ref() {
                if !conn.is_closed() {
                    return Ok(conn.clone());
                }
            }
            let conn = Arc::new(self.open(identity).await?);
            *guard = Some(conn.clone());
            Ok(conn)
        } else {
            // Each query connects on its own; first to finish installs.
            let conn = Arc::new(self.open(identity).await?);
            let mut guard = slot.conn.lock().await;
            match guard.as_ref() {
                Some(existing) if !existing.is_closed() => Ok(existing.clone()),
                _ => {
                    *guard = Some(conn.clone());
                    Ok(conn)
                }
            }
        }
    }

    async fn open(&self, identity: &ServerIdentity) -> Result<DotConnection, DotError> {
        let tls_config = self.tls_client_config(identity)?;
        let connector = TlsConnector::from(tls_config);
        let server_name: ServerName<'static> = if identity.provider.is_empty() {
            ServerName::from(identity.sockaddr.ip())
        } else {
            ServerName::try_from(identity.provider.clone())
                .map_err(|e| DotError::Handshake(format!("invalid server name: {e}")))?
        };

        let connect = async {
            let tcp = TcpStream::connect(identity.sockaddr).await?;
            tcp.set_nodelay(true)?;
            connector.connect(server_name, tcp).await
        };
        let tls_stream = match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(classify_tls_error(identity, e)),
            Err(_) => return Err(DotError::ConnectTimeout),
        };
        debug!(server = %identity, "DoT connection established");

        let (mut read_half, mut write_half) = tokio::io::split(tls_stream);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (req_tx, mut req_rx) = mpsc::unbounded_channel::<DotRequest>();

        // Writer: assign a connection-local ID, remember the original,
        // frame and send.
        let writer_pending = pending.clone();
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(req) = req_rx.recv().await {
                let orig_id = message::peek_id(&req.wire).unwrap_or(0);
                let local_id = {
                    let mut pending = writer_pending.lock();
                    let mut id: u16 = rand::thread_rng().gen();
                    while pending.contains_key(&id) {
                        id = id.wrapping_add(1);
                    }
                    pending.insert(id, (orig_id, req.resp));
                    id
                };
                let mut wire = req.wire;
                message::set_raw_id(&mut wire, local_id);

                let frame_len = (wire.len() as u16).to_be_bytes();
                if write_half.write_all(&frame_len).await.is_err()
                    || write_half.write_all(&wire).await.is_err()
                    || write_half.flush().await.is_err()
                {
                    writer_pending.lock().remove(&local_id);
                    writer_closed.store(true, Ordering::Release);
                    break;
                }
            }
        });

        // Reader: demultiplex responses by ID, restore the original ID.
        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let identity_str = identity.to_string();
        tokio::spawn(async move {
            loop {
                let read_one = async {
                    let mut len_buf = [0u8; 2];
                    read_half.read_exact(&mut len_buf).await?;
                    let len = usize::from(u16::from_be_bytes(len_buf));
                    let mut buf = vec![0u8; len];
                    read_half.read_exact(&mut buf).await?;
                    Ok::<_, std::io::Error>(buf)
                };
                let response = match timeout(IDLE_TIMEOUT, read_one).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        trace!(server = %identity_str, error = %e, "DoT read error");
                        break;
                    }
                    Err(_) => {
                        if reader_pending.lock().is_empty() {
                            trace!(server = %identity_str, "DoT connection idle, closing");
                            break;
                        }
                        continue;
                    }
                };
                let local_id = match message::peek_id(&response) {
                    Some(id) => id,
                    None => continue,
                };
                let entry = reader_pending.lock().remove(&local_id);
                if let Some((orig_id, resp_tx)) = entry {
                    let mut response = response;
                    message::set_raw_id(&mut response, orig_id);
                    let _ = resp_tx.send(response);
                }
            }
            reader_closed.store(true, Ordering::Release);
            // Outstanding queries learn about the death via their
            // oneshot senders dropping.
            reader_pending.lock().clear();
        });

        Ok(DotConnection { req_tx, closed })
    }

    /// Validation probe: optional UDP latency baseline, TLS handshake
    /// with certificate checks, then one probe query over the session.
    pub async fn probe(&self, identity: &ServerIdentity) -> Result<(), DotError> {
        let name = umbra_proto::Name::from_str(PROBE_HOSTNAME)
            .map_err(|e| DotError::Handshake(format!("bad probe name: {e}")))?;
        let probe_query = umbra_proto::Message::query(umbra_proto::Question::a(name))
            .to_wire()
            .to_vec();

        let udp_baseline = match (self.config.latency_factor, self.config.latency_offset) {
            (Some(_), Some(_)) => {
                let udp_server = SocketAddr::new(identity.sockaddr.ip(), 53);
                let started = Instant::now();
                match self
                    .do53
                    .exchange(udp_server, &probe_query, Duration::from_secs(2))
                    .await
                {
                    Ok(Do53Outcome::Answer(_)) => Some(started.elapsed()),
                    _ => None,
                }
            }
            _ => None,
        };

        let started = Instant::now();
        let response = self
            .query(identity, &probe_query, Duration::from_secs(10))
            .await?;
        let tls_elapsed = started.elapsed();
        if message::peek_rcode(&response).is_none() {
            return Err(DotError::Handshake("empty probe response".into()));
        }

        if let (Some(factor), Some(offset), Some(baseline)) = (
            self.config.latency_factor,
            self.config.latency_offset,
            udp_baseline,
        ) {
            let budget = baseline * factor + offset;
            if tls_elapsed > budget {
                warn!(
                    server = %identity,
                    ?tls_elapsed,
                    ?budget,
                    "DoT probe exceeded latency budget"
                );
                return Err(DotError::Handshake("probe latency over budget".into()));
            }
        }
        Ok(())
    }

    fn tls_client_config(&self, identity: &ServerIdentity) -> Result<Arc<ClientConfig>, DotError> {
        if identity.provider.is_empty() && self.config.ca_override_pem.is_none() {
            // Opportunistic: any certificate is accepted.
            let config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
                .with_no_client_auth();
            return Ok(Arc::new(config));
        }

        let mut roots = RootCertStore::empty();
        match &self.config.ca_override_pem {
            Some(pem) => {
                let mut reader = std::io::BufReader::new(pem.as_bytes());
                for cert in rustls_pemfile::certs(&mut reader).flatten() {
                    let _ = roots.add(cert);
                }
                if roots.is_empty() {
                    return Err(DotError::Handshake("CA override contains no certificates".into()));
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

fn classify_tls_error(identity: &ServerIdentity, err: std::io::Error) -> DotError {
    let text = err.to_string();
    if text.contains("NotValidForName") || text.contains("CertNotValidForName") {
        DotError::NameMismatch(if identity.provider.is_empty() {
            identity.sockaddr.ip().to_string()
        } else {
            identity.provider.clone()
        })
    } else if err.kind() == std::io::ErrorKind::InvalidData {
        DotError::Handshake(text)
    } else {
        DotError::Network(err)
    }
}

mod danger {
    //! Certificate verifier for opportunistic mode, which encrypts
    //! without authenticating the server.

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerification;

    impl NoVerification {
        pub fn new() -> Self {
            Self
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
    use rustls::pki_types::PrivateKeyDer;
    use rustls::ServerConfig;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;
    use umbra_proto::{Message, Name, Question, ResourceRecord};

    struct TestCa {
        ca_pem: String,
        server_config: Arc<ServerConfig>,
    }

    /// Issues a CA plus a leaf certificate for `hostname` and builds a
    /// TLS server config from them.
    fn make_tls_fixture(hostname: &str) -> TestCa {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let server_params = CertificateParams::new(vec![hostname.to_string()]).unwrap();
        let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

        let key = PrivateKeyDer::try_from(server_key.serialize_der()).unwrap();
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![server_cert.der().clone()], key)
            .unwrap();

        TestCa {
            ca_pem: ca_cert.pem(),
            server_config: Arc::new(server_config),
        }
    }

    /// DoT echo server: answers every framed query with one A record.
    async fn spawn_dot_server(config: Arc<ServerConfig>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptor::from(config);
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
                            std::net::Ipv4Addr::new(192, 0, 2, 33),
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
        addr
    }

    fn test_query(name: &str) -> Vec<u8> {
        Message::query(Question::a(Name::from_str(name).unwrap()))
            .to_wire()
            .to_vec()
    }

    #[tokio::test]
    async fn test_opportunistic_query_accepts_any_cert() {
        let fixture = make_tls_fixture("dot.test.example");
        let addr = spawn_dot_server(fixture.server_config).await;

        let transport = DotTransport::new(DotConfig {
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let identity = ServerIdentity::anonymous(addr);
        let response = transport
            .query(&identity, &test_query("example.com"), Duration::from_secs(2))
            .await
            .unwrap();
        let parsed = Message::parse(&response).unwrap();
        assert_eq!(parsed.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_response_id_restored() {
        let fixture = make_tls_fixture("dot.test.example");
        let addr = spawn_dot_server(fixture.server_config).await;

        let transport = DotTransport::new(DotConfig {
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let identity = ServerIdentity::anonymous(addr);
        let mut query = test_query("example.com");
        message::set_raw_id(&mut query, 0x4242);
        let response = transport
            .query(&identity, &query, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(message::peek_id(&response), Some(0x4242));
    }

    #[tokio::test]
    async fn test_pipelined_queries_share_connection() {
        let fixture = make_tls_fixture("dot.test.example");
        let addr = spawn_dot_server(fixture.server_config).await;

        let transport = Arc::new(DotTransport::new(DotConfig {
            connect_timeout: Duration::from_secs(2),
            async_handshake: true,
            ..Default::default()
        }));
        let identity = ServerIdentity::anonymous(addr);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let transport = transport.clone();
            let identity = identity.clone();
            tasks.push(tokio::spawn(async move {
                let query = test_query(&format!("host{i}.example.com"));
                transport
                    .query(&identity, &query, Duration::from_secs(2))
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_named_probe_with_ca_override() {
        let fixture = make_tls_fixture("dot.test.example");
        let addr = spawn_dot_server(fixture.server_config).await;

        let transport = DotTransport::new(DotConfig {
            connect_timeout: Duration::from_secs(2),
            ca_override_pem: Some(fixture.ca_pem),
            ..Default::default()
        });
        let identity = ServerIdentity::new(addr, "dot.test.example");
        transport.probe(&identity).await.unwrap();
    }

    #[tokio::test]
    async fn test_name_mismatch_fails_probe() {
        let fixture = make_tls_fixture("dot.test.example");
        let addr = spawn_dot_server(fixture.server_config).await;

        let transport = DotTransport::new(DotConfig {
            connect_timeout: Duration::from_secs(2),
            ca_override_pem: Some(fixture.ca_pem),
            ..Default::default()
        });
        let identity = ServerIdentity::new(addr, "wrong.example");
        let err = transport.probe(&identity).await.unwrap_err();
        assert!(
            matches!(err, DotError::NameMismatch(_) | DotError::Handshake(_)),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn test_connect_timeout_is_connect_failure() {
        // RFC 5737 TEST-NET-1 address: connect attempts hang.
        let transport = DotTransport::new(DotConfig {
            connect_timeout: Duration::from_millis(1000),
            max_tries: 1,
            ..Default::default()
        });
        let identity =
            ServerIdentity::anonymous(SocketAddr::from_str("192.0.2.1:853").unwrap());
        let err = transport
            .query(&identity, &test_query("example.com"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_connect_failure() || matches!(err, DotError::Network(_)));
    }

    #[tokio::test]
    async fn test_consecutive_timeout_counter_resets() {
        let fixture = make_tls_fixture("dot.test.example");
        let addr = spawn_dot_server(fixture.server_config).await;

        let transport = DotTransport::new(DotConfig {
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let identity = ServerIdentity::anonymous(addr);
        assert_eq!(transport.consecutive_timeouts(&identity), 0);

        transport
            .query(&identity, &test_query("example.com"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(transport.consecutive_timeouts(&identity), 0);
    }
}
