//! Server identities and per-server tracking records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Identifies one private-DNS server: socket address plus provider name.
///
/// The provider name is empty for anonymous (opportunistic) servers; in
/// strict mode it equals the configured private-DNS hostname. Two
/// identities are equal only when both fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub sockaddr: SocketAddr,
    pub provider: String,
}

impl ServerIdentity {
    pub fn new(sockaddr: SocketAddr, provider: impl Into<String>) -> Self {
        Self {
            sockaddr,
            provider: provider.into(),
        }
    }

    /// An anonymous identity (no provider name).
    pub fn anonymous(sockaddr: SocketAddr) -> Self {
        Self::new(sockaddr, "")
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.provider.is_empty() {
            write!(f, "{}", self.sockaddr)
        } else {
            write!(f, "{}@{}", self.provider, self.sockaddr)
        }
    }
}

/// Validation lifecycle of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValidationState {
    /// Never probed.
    #[default]
    Unknown,
    /// A probe task is running or a retry is scheduled.
    InProgress,
    /// Last probe succeeded; queries may use the server.
    Success,
    /// Given up.
    Fail,
}

impl ValidationState {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Mutable per-server record owned by the configuration tracker.
///
/// A server removed by a configuration change keeps its entry with
/// `active = false` until in-flight work referencing it settles; queries
/// are never routed to inactive entries.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub identity: ServerIdentity,
    pub state: ValidationState,
    pub active: bool,
    /// Probe attempts since the last configuration change.
    pub attempts: u32,
    /// When the next scheduled revalidation is due.
    pub next_attempt_at: Option<Instant>,
}

impl ServerEntry {
    pub fn new(identity: ServerIdentity) -> Self {
        Self {
            identity,
            state: ValidationState::Unknown,
            active: true,
            attempts: 0,
            next_attempt_at: None,
        }
    }

    /// Usable by queries: still configured and validated.
    pub fn is_live(&self) -> bool {
        self.active && self.state.is_success()
    }
}
