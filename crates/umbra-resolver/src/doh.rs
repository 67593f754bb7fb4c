//! DNS over HTTPS (RFC 8484) client transport.
//!
//! One HTTP/2 session per server; queries run as concurrent streams on
//! it (POST, `application/dns-message`). A session that errors is torn
//! down and reopened lazily by the next query; an idle session is closed
//! after the configured idle timeout (55 s by default).

use crate::identity::ServerIdentity;
use bytes::Bytes;
use http::{Method, Request};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

/// MIME type for DNS messages per RFC 8484.
const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// ALPN identifier; RFC 8484 requires HTTP/2.
const ALPN_H2: &[u8] = b"h2";

/// DoH failures.
#[derive(Error, Debug)]
pub enum DohError {
    #[error("connect timeout")]
    ConnectTimeout,

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("HTTP/2 session error: {0}")]
    Session(#[from] h2::Error),

    #[error("query timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

/// DoH transport configuration.
#[derive(Debug, Clone)]
pub struct DohConfig {
    pub query_timeout: Duration,
    pub probe_timeout: Duration,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub ca_override_pem: Option<String>,
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_millis(30_000),
            probe_timeout: Duration::from_millis(60_000),
            idle_timeout: Duration::from_millis(55_000),
            connect_timeout: Duration::from_millis(5_000),
            ca_override_pem: None,
        }
    }
}

/// A configured DoH server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DohEndpoint {
    pub addr: SocketAddr,
    pub hostname: String,
    pub path: String,
}

impl DohEndpoint {
    /// Splits an HTTPS template like `https://dns.example/dns-query`
    /// into hostname and path.
    pub fn from_template(addr: SocketAddr, template: &str) -> Option<Self> {
        let rest = template.strip_prefix("https://")?;
        let (hostname, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/dns-query"),
        };
        if hostname.is_empty() {
            return None;
        }
        Some(Self {
            addr,
            hostname: hostname.to_string(),
            path: path.to_string(),
        })
    }

    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity::new(self.addr, self.hostname.clone())
    }
}

struct DohSession {
    send_request: h2::client::SendRequest<Bytes>,
    last_used: Arc<Mutex<Instant>>,
    dead: Arc<AtomicBool>,
}

/// Per-network DoH client transport.
pub struct DohTransport {
    config: DohConfig,
    sessions: Mutex<HashMap<SocketAddr, Arc<DohSession>>>,
}

impl DohTransport {
    pub fn new(config: DohConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DohConfig {
        &self.config
    }

    /// Drops the session for `addr`, if any.
    pub fn close(&self, addr: SocketAddr) {
        self.sessions.lock().remove(&addr);
    }

    /// Drops every session not satisfying `keep`.
    pub fn retain(&self, keep: impl Fn(SocketAddr) -> bool) {
        self.sessions.lock().retain(|addr, _| keep(*addr));
    }

    /// Sends `query` to `endpoint` with the given deadline.
    pub async fn query(
        &self,
        endpoint: &DohEndpoint,
        query: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, DohError> {
        let session = self.ensure_session(endpoint).await?;
        *session.last_used.lock() = Instant::now();

        let result = timeout(deadline, self.exchange_on(&session, endpoint, query)).await;
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                if matches!(e, DohError::Session(_)) {
                    trace!(server = %endpoint.hostname, error = %e, "DoH session died");
                    session.dead.store(true, Ordering::Release);
                    self.close(endpoint.addr);
                }
                Err(e)
            }
            Err(_) => Err(DohError::Timeout),
        }
    }

    /// Handshake probe: one query for a well-known name with the probe
    /// timeout. The caller publishes the resulting validation state.
    pub async fn probe(&self, endpoint: &DohEndpoint) -> Result<(), DohError> {
        let name = umbra_proto::Name::from_str("dns-query-probe.invalid.example")
            .map_err(|_| DohError::Handshake("bad probe name".into()))?;
        let probe = umbra_proto::Message::query(umbra_proto::Question::a(name));
        let response = self
            .query(endpoint, &probe.to_wire(), self.config.probe_timeout)
            .await?;
        if umbra_proto::message::peek_rcode(&response).is_none() {
            return Err(DohError::Handshake("empty probe response".into()));
        }
        Ok(())
    }

    async fn exchange_on(
        &self,
        session: &Arc<DohSession>,
        endpoint: &DohEndpoint,
        query: &[u8],
    ) -> Result<Vec<u8>, DohError> {
        let mut send_request = session.send_request.clone().ready().await?;

        let uri = format!("https://{}{}", endpoint.hostname, endpoint.path);
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .header(http::header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .body(())
            .map_err(|e| DohError::Handshake(format!("bad request: {e}")))?;

        let (response, mut stream) = send_request.send_request(request, false)?;
        stream.send_data(Bytes::copy_from_slice(query), true)?;

        let response = response.await?;
        if response.status() != http::StatusCode::OK {
            return Err(DohError::Status(response.status().as_u16()));
        }

        let mut body = response.into_body();
        let mut answer = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk?;
            answer.extend_from_slice(&chunk);
            let _ = body.flow_control().release_capacity(chunk.len());
        }
        Ok(answer)
    }

    async fn ensure_session(&self, endpoint: &DohEndpoint) -> Result<Arc<DohSession>, DohError> {
        if let Some(session) = self.sessions.lock().get(&endpoint.addr) {
            if !session.dead.load(Ordering::Acquire) {
                return Ok(session.clone());
            }
        }

        let session = Arc::new(self.connect(endpoint).await?);
        self.sessions
            .lock()
            .insert(endpoint.addr, session.clone());
        Ok(session)
    }

    async fn connect(&self, endpoint: &DohEndpoint) -> Result<DohSession, DohError> {
        let mut roots = RootCertStore::empty();
        match &self.config.ca_override_pem {
            Some(pem) => {
                let mut reader = std::io::BufReader::new(pem.as_bytes());
                for cert in rustls_pemfile::certs(&mut reader).flatten() {
                    let _ = roots.add(cert);
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }
        let mut tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![ALPN_H2.to_vec()];

        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(endpoint.hostname.clone())
            .map_err(|e| DohError::Handshake(format!("invalid server name: {e}")))?;

        let connect = async {
            let tcp = TcpStream::connect(endpoint.addr).await?;
            tcp.set_nodelay(true)?;
            connector
                .connect(server_name, tcp)
                .await
                .map_err(std::io::Error::other)
        };
        let tls_stream = match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(DohError::Handshake(e.to_string())),
            Err(_) => return Err(DohError::ConnectTimeout),
        };

        let (send_request, connection) = h2::client::handshake(tls_stream).await?;
        debug!(server = %endpoint.hostname, addr = %endpoint.addr, "DoH session established");

        let dead = Arc::new(AtomicBool::new(false));
        let last_used = Arc::new(Mutex::new(Instant::now()));
        let session = DohSession {
            send_request,
            last_used: last_used.clone(),
            dead: dead.clone(),
        };

        // Session driver; marks the session dead when the connection
        // settles or has sat idle past the policy timeout, so the next
        // query reopens lazily.
        let hostname = endpoint.hostname.clone();
        let idle_timeout = self.config.idle_timeout;
        tokio::spawn(async move {
            let idle_watch = async {
                loop {
                    let deadline = *last_used.lock() + idle_timeout;
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    tokio::time::sleep(deadline - now).await;
                }
            };
            tokio::select! {
                result = connection => {
                    if let Err(e) = result {
                        trace!(server = %hostname, error = %e, "DoH connection error");
                    }
                }
                _ = idle_watch => {
                    trace!(server = %hostname, "DoH session idle timeout");
                }
            }
            dead.store(true, Ordering::Release);
        });

        Ok(session)
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

    fn make_tls_fixture(hostname: &str) -> (String, Arc<ServerConfig>) {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let server_params = CertificateParams::new(vec![hostname.to_string()]).unwrap();
        let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

        let key = PrivateKeyDer::try_from(server_key.serialize_der()).unwrap();
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![server_cert.der().clone()], key)
            .unwrap();
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        (ca_cert.pem(), Arc::new(config))
    }

    /// Minimal DoH server: answers every POST with one A record.
    async fn spawn_doh_server(config: Arc<ServerConfig>) -> SocketAddr {
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
                    let Ok(tls) = acceptor.accept(stream).await else {
                        return;
                    };
                    let Ok(mut conn) = h2::server::handshake(tls).await else {
                        return;
                    };
                    while let Some(Ok((request, mut respond))) = conn.accept().await {
                        tokio::spawn(async move {
                            let mut body = request.into_body();
                            let mut query = Vec::new();
                            while let Some(Ok(chunk)) = body.data().await {
                                query.extend_from_slice(&chunk);
                                let _ = body.flow_control().release_capacity(chunk.len());
                            }
                            let Ok(parsed) = Message::parse(&query) else {
                                return;
                            };
                            let mut resp = Message::response_to(&parsed);
                            resp.add_answer(ResourceRecord::a(
                                parsed.question().unwrap().qname.clone(),
                                60,
                                std::net::Ipv4Addr::new(192, 0, 2, 53),
                            ));
                            let http_resp = http::Response::builder()
                                .status(200)
                                .header(http::header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
                                .body(())
                                .unwrap();
                            if let Ok(mut stream) = respond.send_response(http_resp, false) {
                                let _ = stream.send_data(resp.to_wire(), true);
                            }
                        });
                    }
                });
            }
        });
        addr
    }

    fn endpoint(addr: SocketAddr) -> DohEndpoint {
        DohEndpoint {
            addr,
            hostname: "doh.test.example".to_string(),
            path: "/dns-query".to_string(),
        }
    }

    #[test]
    fn test_template_parsing() {
        let addr: SocketAddr = "1.2.3.4:443".parse().unwrap();
        let ep = DohEndpoint::from_template(addr, "https://dns.google/dns-query").unwrap();
        assert_eq!(ep.hostname, "dns.google");
        assert_eq!(ep.path, "/dns-query");

        let ep = DohEndpoint::from_template(addr, "https://dns.google").unwrap();
        assert_eq!(ep.path, "/dns-query");

        assert!(DohEndpoint::from_template(addr, "http://insecure.example/q").is_none());
        assert!(DohEndpoint::from_template(addr, "https:///nohost").is_none());
    }

    #[tokio::test]
    async fn test_doh_query() {
        let (ca_pem, server_config) = make_tls_fixture("doh.test.example");
        let addr = spawn_doh_server(server_config).await;

        let transport = DohTransport::new(DohConfig {
            ca_override_pem: Some(ca_pem),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let query = Message::query(Question::a(Name::from_str("example.com").unwrap()));
        let response = transport
            .query(&endpoint(addr), &query.to_wire(), Duration::from_secs(5))
            .await
            .unwrap();
        let parsed = Message::parse(&response).unwrap();
        assert_eq!(parsed.answers().len(), 1);
        assert_eq!(parsed.id(), query.id());
    }

    #[tokio::test]
    async fn test_doh_concurrent_streams() {
        let (ca_pem, server_config) = make_tls_fixture("doh.test.example");
        let addr = spawn_doh_server(server_config).await;

        let transport = Arc::new(DohTransport::new(DohConfig {
            ca_override_pem: Some(ca_pem),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        }));

        let mut tasks = Vec::new();
        for i in 0..6 {
            let transport = transport.clone();
            let ep = endpoint(addr);
            tasks.push(tokio::spawn(async move {
                let q = Message::query(Question::a(
                    Name::from_str(&format!("host{i}.example.com")).unwrap(),
                ));
                transport.query(&ep, &q.to_wire(), Duration::from_secs(5)).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        // All streams share one session.
        assert_eq!(transport.sessions.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_doh_probe() {
        let (ca_pem, server_config) = make_tls_fixture("doh.test.example");
        let addr = spawn_doh_server(server_config).await;

        let transport = DohTransport::new(DohConfig {
            ca_override_pem: Some(ca_pem),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        transport.probe(&endpoint(addr)).await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_hostname_fails() {
        let (ca_pem, server_config) = make_tls_fixture("doh.test.example");
        let addr = spawn_doh_server(server_config).await;

        let transport = DohTransport::new(DohConfig {
            ca_override_pem: Some(ca_pem),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let bad = DohEndpoint {
            addr,
            hostname: "wrong.example".to_string(),
            path: "/dns-query".to_string(),
        };
        let q = Message::query(Question::a(Name::from_str("example.com").unwrap()));
        assert!(transport
            .query(&bad, &q.to_wire(), Duration::from_secs(5))
            .await
            .is_err());
    }
}
