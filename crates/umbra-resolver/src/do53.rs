//! Cleartext DNS over UDP/TCP port 53.
//!
//! Per attempt: send over UDP; a truncated response triggers one TCP
//! retry against the same server. EDNS0 is attached by default; a server
//! answering FORMERR to an EDNS0 query is retried once without it and
//! remembered, so later queries skip EDNS0 for that server only.

use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace};
use umbra_proto::message;
use umbra_proto::{Rcode, EDNS_UDP_PAYLOAD};

/// Transport-level failure. Protocol-level outcomes (SERVFAIL, FORMERR)
/// travel back as response bytes for the dispatcher to classify.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Malformed(#[from] umbra_proto::ProtoError),
}

/// Truncation handling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum TcMode {
    /// TCP retry on the truncating server, then the next server over UDP.
    #[default]
    Default,
    /// TCP retry on the truncating server before any other server.
    UdpThenTcp,
}

/// One in-flight UDP exchange whose socket can outlive its attempt, for
/// the keep-listening retry policy.
pub struct UdpSession {
    socket: UdpSocket,
    server: SocketAddr,
    query_id: u16,
}

impl UdpSession {
    pub async fn start(server: SocketAddr, query: &[u8]) -> std::io::Result<Self> {
        let domain = if server.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let raw = Socket::new(domain, Type::DGRAM, None)?;
        raw.set_nonblocking(true)?;
        let bind_addr: SocketAddr = if server.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        raw.bind(&bind_addr.into())?;
        let socket = UdpSocket::from_std(raw.into())?;
        socket.connect(server).await?;
        socket.send(query).await?;
        Ok(Self {
            socket,
            server,
            query_id: message::peek_id(query).unwrap_or(0),
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Waits up to `deadline` for a response matching the query ID.
    pub async fn recv(&self, deadline: Duration) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; 65_535];
        let fut = async {
            loop {
                let len = self.socket.recv(&mut buf).await?;
                if message::peek_id(&buf[..len]) == Some(self.query_id) {
                    return Ok(buf[..len].to_vec());
                }
                trace!(server = %self.server, "mismatched response id, ignoring");
            }
        };
        match timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

/// Result of one Do53 attempt.
pub enum Do53Outcome {
    /// A response (any RCODE) arrived.
    Answer(Vec<u8>),
    /// No response in time; the session is handed back so the caller may
    /// keep listening on it across the next attempt.
    TimedOut(UdpSession),
}

/// Do53 client transport, shared by every network.
#[derive(Default)]
pub struct Do53Transport {
    /// Servers that answered FORMERR to an EDNS0 query.
    no_edns: Mutex<HashSet<SocketAddr>>,
}

impl Do53Transport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edns_disabled_for(&self, server: SocketAddr) -> bool {
        self.no_edns.lock().contains(&server)
    }

    /// Performs one attempt: UDP, TCP on truncation, and the one-shot
    /// EDNS0 downgrade on FORMERR.
    pub async fn exchange(
        &self,
        server: SocketAddr,
        query: &[u8],
        attempt_timeout: Duration,
    ) -> Result<Do53Outcome, TransportError> {
        let wire = self.prepare_query(server, query)?;
        let had_edns = message::has_edns0(&wire).unwrap_or(false);

        let response = match self.one_round(server, &wire, attempt_timeout).await? {
            Do53Outcome::Answer(response) => response,
            timed_out => return Ok(timed_out),
        };

        if had_edns && message::peek_rcode(&response) == Some(Rcode::FORMERR) {
            debug!(server = %server, "FORMERR on EDNS0 query, retrying without EDNS0");
            self.no_edns.lock().insert(server);
            let stripped = message::strip_edns0(&wire)?.unwrap_or(wire);
            return self.one_round(server, &stripped, attempt_timeout).await;
        }

        Ok(Do53Outcome::Answer(response))
    }

    /// One UDP round with the TC-bit TCP retry folded in.
    async fn one_round(
        &self,
        server: SocketAddr,
        wire: &[u8],
        attempt_timeout: Duration,
    ) -> Result<Do53Outcome, TransportError> {
        let session = UdpSession::start(server, wire).await?;
        let response = match session.recv(attempt_timeout).await {
            Ok(response) => response,
            Err(TransportError::Timeout) => return Ok(Do53Outcome::TimedOut(session)),
            Err(e) => return Err(e),
        };
        if message::peek_tc(&response).unwrap_or(false) {
            trace!(server = %server, "truncated response, retrying over TCP");
            let response = self.exchange_tcp(server, wire, attempt_timeout).await?;
            return Ok(Do53Outcome::Answer(response));
        }
        Ok(Do53Outcome::Answer(response))
    }

    /// TCP leg, also used directly for the TC retry.
    pub async fn exchange_tcp(
        &self,
        server: SocketAddr,
        query: &[u8],
        attempt_timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let fut = async {
            let mut stream = TcpStream::connect(server).await?;
            stream.write_all(&(query.len() as u16).to_be_bytes()).await?;
            stream.write_all(query).await?;
            stream.flush().await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = usize::from(u16::from_be_bytes(len_buf));
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        };
        let response = match timeout(attempt_timeout, fut).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout),
        };
        if message::peek_id(&response) != message::peek_id(query) {
            return Err(TransportError::Network(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response id mismatch",
            )));
        }
        Ok(response)
    }

    /// Attaches or strips EDNS0 according to what we know about `server`.
    fn prepare_query(&self, server: SocketAddr, query: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.edns_disabled_for(server) {
            return Ok(message::strip_edns0(query)?.unwrap_or_else(|| query.to_vec()));
        }
        if message::has_edns0(query)? {
            return Ok(query.to_vec());
        }
        let mut msg = umbra_proto::Message::parse(query)?;
        msg.enable_edns0(EDNS_UDP_PAYLOAD);
        Ok(msg.to_wire().to_vec())
    }
}
