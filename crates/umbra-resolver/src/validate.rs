//! Asynchronous server validation.
//!
//! The engine runs at most one probe task per (network, server). A probe
//! that fails is retried on an exponential backoff (60 s doubling to a
//! 3600 s cap) while the server stays `InProgress`; once the backoff
//! saturates the server is marked `Fail`. Tasks are never cancelled:
//! every publication carries the configuration generation that spawned
//! it, and the registry discards stale results.

use crate::backoff::BackoffBuilder;
use crate::config::{PublishResult, Registry, ValidationRequest};
use crate::doh::DohEndpoint;
use crate::events::{NoopObserver, ValidationObserver};
use crate::identity::ServerIdentity;
use crate::NetId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

/// Probe attempts before a server is marked `Fail` (the backoff is
/// saturated by then).
const MAX_PROBE_ATTEMPTS: u32 = 7;

/// Bounded log of validation transitions kept for diagnostics.
const TRANSITION_LOG_CAPACITY: usize = 100;

/// One recorded validation transition.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub netid: NetId,
    pub identity: ServerIdentity,
    pub success: bool,
    pub attempt: u32,
    pub at: SystemTime,
}

/// Validation engine; one instance per resolver.
pub struct ValidationEngine {
    registry: Arc<Registry>,
    observer: Mutex<Arc<dyn ValidationObserver>>,
    backoff: BackoffBuilder,
    log: Mutex<VecDeque<TransitionRecord>>,
}

impl ValidationEngine {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            observer: Mutex::new(Arc::new(NoopObserver)),
            backoff: BackoffBuilder::default(),
            log: Mutex::new(VecDeque::with_capacity(TRANSITION_LOG_CAPACITY)),
        })
    }

    /// Installs the observer receiving validation events.
    pub fn set_observer(&self, observer: Arc<dyn ValidationObserver>) {
        *self.observer.lock() = observer;
    }

    /// Recent validation transitions, oldest first.
    pub fn transition_log(&self) -> Vec<TransitionRecord> {
        self.log.lock().iter().cloned().collect()
    }

    /// Forwards a NAT64 prefix change to the observer.
    pub fn notify_nat64(&self, netid: NetId, added: bool, prefix: crate::nat64::Nat64Prefix) {
        self.observer
            .lock()
            .clone()
            .on_nat64_prefix_update(netid, added, prefix.addr(), crate::nat64::Nat64Prefix::LEN);
    }

    /// Spawns probe tasks for the requests returned by a configuration
    /// change.
    pub fn launch(self: &Arc<Self>, netid: NetId, requests: Vec<ValidationRequest>) {
        for request in requests {
            match request {
                ValidationRequest::Dot {
                    identity,
                    generation,
                } => self.clone().spawn_dot(netid, identity, generation),
                ValidationRequest::Doh {
                    endpoint,
                    generation,
                } => self.clone().spawn_doh(netid, endpoint, generation),
            }
        }
    }

    /// Revalidation requested by the dispatcher after repeated query
    /// failures. `demote` removes the server from the validated set for
    /// the duration (the unusable-threshold path).
    pub fn request_dot_revalidation(
        self: &Arc<Self>,
        netid: NetId,
        identity: &ServerIdentity,
        demote: bool,
    ) {
        if let Some(ValidationRequest::Dot {
            identity,
            generation,
        }) = self.registry.request_revalidation(netid, identity, demote)
        {
            debug!(netid, server = %identity, demote, "revalidation requested");
            self.clone().spawn_dot(netid, identity, generation);
        }
    }

    fn spawn_dot(self: Arc<Self>, netid: NetId, identity: ServerIdentity, generation: u64) {
        if !self.registry.begin_probe(netid, &identity, generation) {
            debug!(netid, server = %identity, "probe already in flight");
            return;
        }
        tokio::spawn(async move {
            let mut backoff = self.backoff.clone().build();
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let Some(handle) = self.registry.get(netid) else {
                    break;
                };
                let dot = handle.dot();
                let started = Instant::now();
                let result = dot.probe(&identity).await;
                let success = result.is_ok();
                self.record_transition(netid, &identity, success, attempt);
                if let Err(ref e) = result {
                    debug!(
                        netid,
                        server = %identity,
                        attempt,
                        error = %e,
                        elapsed = ?started.elapsed(),
                        "DoT validation probe failed"
                    );
                }

                let will_retry = !success && attempt < MAX_PROBE_ATTEMPTS;
                match self.registry.publish_dot_outcome(
                    netid,
                    &identity,
                    generation,
                    success,
                    will_retry,
                ) {
                    PublishResult::Stale => {
                        debug!(netid, server = %identity, "discarding stale validation result");
                        break;
                    }
                    PublishResult::Applied { emit } => {
                        if emit {
                            self.observer
                                .lock()
                                .clone()
                                .on_private_dns_validation(netid, &identity, success);
                        }
                    }
                }

                if success {
                    info!(netid, server = %identity, attempt, "DoT server validated");
                    break;
                }
                if !will_retry {
                    warn!(netid, server = %identity, attempt, "giving up on DoT validation");
                    break;
                }
                tokio::time::sleep(backoff.next_delay()).await;
            }
            self.registry.end_probe(netid, &identity, generation);
        });
    }

    fn spawn_doh(self: Arc<Self>, netid: NetId, endpoint: DohEndpoint, generation: u64) {
        let identity = endpoint.identity();
        if !self.registry.begin_probe(netid, &identity, generation) {
            return;
        }
        tokio::spawn(async move {
            let mut backoff = self.backoff.clone().build();
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let Some(handle) = self.registry.get(netid) else {
                    break;
                };
                let doh = handle.doh();
                let result = doh.probe(&endpoint).await;
                let success = result.is_ok();
                self.record_transition(netid, &identity, success, attempt);
                if let Err(ref e) = result {
                    debug!(netid, server = %identity, attempt, error = %e, "DoH probe failed");
                }

                let will_retry = !success && attempt < MAX_PROBE_ATTEMPTS;
                match self.registry.publish_doh_outcome(
                    netid,
                    &endpoint,
                    generation,
                    success,
                    will_retry,
                ) {
                    PublishResult::Stale => break,
                    PublishResult::Applied { emit } => {
                        if emit {
                            self.observer
                                .lock()
                                .clone()
                                .on_private_dns_validation(netid, &identity, success);
                        }
                    }
                }

                if success {
                    info!(netid, server = %identity, attempt, "DoH server validated");
                    break;
                }
                if !will_retry {
                    break;
                }
                tokio::time::sleep(backoff.next_delay()).await;
            }
            self.registry.end_probe(netid, &identity, generation);
        });
    }

    fn record_transition(
        &self,
        netid: NetId,
        identity: &ServerIdentity,
        success: bool,
        attempt: u32,
    ) {
        let mut log = self.log.lock();
        if log.len() >= TRANSITION_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(TransitionRecord {
            netid,
            identity: identity.clone(),
            success,
            attempt,
            at: SystemTime::now(),
        });
    }
}
